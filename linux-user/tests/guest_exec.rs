use std::path::PathBuf;
use std::process::Command;

/// Check whether a 32-bit-capable x86 gcc is installed (either a
/// native `gcc -m32` or a cross `i686-linux-gnu-gcc`).
fn find_i386_gcc() -> Option<&'static str> {
    for candidate in ["i686-linux-gnu-gcc", "gcc"] {
        let ok = Command::new(candidate)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if ok {
            return Some(candidate);
        }
    }
    None
}

/// Workspace root (two levels up from CARGO_MANIFEST_DIR).
fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).parent().unwrap().to_path_buf()
}

/// Build the static i386 guest test programs via Makefile.
fn build_guest_programs(cc: &str) {
    let guest_dir = workspace_root().join("tests/guest");
    let status = Command::new("make")
        .arg("-C")
        .arg(&guest_dir)
        .arg(format!("CC={cc}"))
        .status()
        .expect("failed to run make");
    assert!(status.success(), "make failed");
}

#[test]
fn guest_hello_world() {
    let Some(cc) = find_i386_gcc() else {
        eprintln!(
            "SKIP: no 32-bit-capable x86 gcc found, \
             install with: apt install gcc-i686-linux-gnu or gcc-multilib"
        );
        return;
    };

    build_guest_programs(cc);

    let bin = env!("CARGO_BIN_EXE_dbt-ia32");
    let elf = workspace_root().join("tests/guest/build/i386/hello");

    let output = Command::new(bin).arg(&elf).output().expect("failed to run dbt-ia32");

    assert!(
        output.status.success(),
        "dbt-ia32 exited with {:?}\nstderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr),
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello, World!\n");
}

#[test]
fn guest_exit_code_propagates() {
    let Some(cc) = find_i386_gcc() else {
        eprintln!("SKIP: no 32-bit-capable x86 gcc found");
        return;
    };

    build_guest_programs(cc);

    let bin = env!("CARGO_BIN_EXE_dbt-ia32");
    let elf = workspace_root().join("tests/guest/build/i386/exit_code");

    let status = Command::new(bin).arg(&elf).status().expect("failed to run dbt-ia32");
    assert_eq!(status.code(), Some(7), "guest's sys_exit(7) must surface as dbt-ia32's own exit code");
}
