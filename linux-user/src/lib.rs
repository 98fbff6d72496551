mod elf;
mod loader;
mod process;
mod syscall;
mod tls;

pub use elf::{
    Elf32Ehdr, Elf32Phdr, ElfError, AT_ENTRY, AT_EXECFN, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT,
    AT_PHNUM, AT_RANDOM, EM_386, ET_DYN, ET_EXEC, PF_R, PF_W, PF_X, PT_INTERP, PT_LOAD, PT_PHDR,
};
pub use loader::{load_elf, ElfInfo, LoadError, GUEST_STACK_SIZE, GUEST_STACK_TOP};
pub use process::{install_sigsegv_handler, set_active_vmm, ProcessMemory};
pub use syscall::LinuxProcess;
pub use tls::install as install_tls;
