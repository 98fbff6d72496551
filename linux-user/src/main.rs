use std::env;
use std::process;

use dbt_exec::{dbt_init, dbt_run};
use vmm::VmmState;

use dbt_linux_user::{
    install_sigsegv_handler, install_tls, load_elf, set_active_vmm, ElfInfo, LinuxProcess, ProcessMemory,
};

/// Code cache size: generous enough that a small static binary never
/// forces a flush mid-run.
const CODE_CACHE_SIZE: usize = 16 * 1024 * 1024;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: dbt-ia32 <elf> [args...]");
        process::exit(1);
    }

    let elf_path = std::fs::canonicalize(&args[1]).expect("failed to resolve elf path");
    let elf_path = elf_path.to_str().unwrap().to_string();
    let guest_argv: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    let host_env: Vec<String> = env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let guest_envp: Vec<&str> = host_env.iter().map(|s| s.as_str()).collect();

    let mut vm = VmmState::new().expect("failed to create guest address space");
    let info: ElfInfo = load_elf(
        std::path::Path::new(&elf_path),
        &mut vm,
        &guest_argv,
        &guest_envp,
    )
    .expect("failed to load ELF");

    let gs = install_tls().expect("failed to install fs-relative TLS slots");
    let mut engine = dbt_init(CODE_CACHE_SIZE, gs).expect("failed to create code cache");

    let mem = ProcessMemory;
    let mut handler = LinuxProcess::new(vm, elf_path);
    set_active_vmm(&mut handler.vm as *mut VmmState<_>);
    install_sigsegv_handler().expect("failed to install SIGSEGV handler for COW faults");

    let code = dbt_run(&mut engine, &mem, &mut handler, info.entry, info.sp);
    process::exit(code);
}
