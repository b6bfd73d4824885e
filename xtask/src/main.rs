use std::process::Command;

fn main() {
    let mut args = std::env::args().skip(1);
    let task = args.next().unwrap_or_else(|| "help".to_string());
    match task.as_str() {
        "stub" => build_stub(args.collect()),
        "wrap" => build_wrap(),
        _ => print_help(),
    }
}

/// Build the freestanding stub for the given architecture and objcopy the
/// raw binary the wrapper splices into executables.
fn build_stub(args: Vec<String>) {
    let target = match args.first().map(String::as_str).unwrap_or("x86_64") {
        "aarch64" => "aarch64-unknown-none",
        "x86_64" => "x86_64-unknown-none",
        other => {
            eprintln!("[xtask] unknown architecture {other}");
            std::process::exit(1);
        }
    };
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("-p").arg("stub")
        .arg("--release")
        .arg("--target").arg(target)
        .arg("-Z").arg("build-std=core")
        .arg("-Z").arg("build-std-features=compiler-builtins-mem");
    run(&mut cmd, "stub build");

    let elf = format!("target/{target}/release/stub");
    let bin = format!("target/{target}/release/stub.bin");
    let mut cmd = Command::new("llvm-objcopy");
    cmd.arg("-O").arg("binary").arg(&elf).arg(&bin);
    run(&mut cmd, "stub objcopy");
    println!("[xtask] stub: {elf}");
    println!("[xtask] stub.bin: {bin}");
}

fn build_wrap() {
    let mut cmd = Command::new("cargo");
    cmd.arg("build").arg("-p").arg("wrap").arg("--release");
    run(&mut cmd, "wrap build");
}

fn run(cmd: &mut Command, name: &str) {
    println!("[xtask] {}: {:?}", name, cmd);
    let status = cmd.status().expect("failed to run command");
    if !status.success() {
        eprintln!("[xtask] {} failed with status {:?}", name, status);
        std::process::exit(1);
    }
}

fn print_help() {
    println!("xtask usage:\n  cargo run -p xtask -- stub <aarch64|x86_64>\n  cargo run -p xtask -- wrap");
}
