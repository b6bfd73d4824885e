use std::fmt::Display;
use std::path::Path;

use log::LevelFilter;

use tg_elf::Arch;
use wrap::{WrapRequest, wrap};

/// Tracing sink: `wrap: <message>` lines on stderr, enabled by
/// `TANGRAM_TRACING`.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        eprintln!("wrap: {}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn fatal(message: impl Display) -> ! {
    eprintln!("wrap: {message}");
    std::process::abort();
}

fn main() {
    let level = if std::env::var_os("TANGRAM_TRACING").is_some() {
        LevelFilter::Trace
    } else {
        LevelFilter::Off
    };
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [arch, input, output, stub_elf, stub_bin, manifest] = args.as_slice() else {
        fatal("usage is wrap <arch> <input> <output> <stub.elf> <stub.bin> <manifest>");
    };
    let arch = Arch::from_name(arch)
        .unwrap_or_else(|| fatal(format_args!("unsupported architecture {arch}")));

    let request = WrapRequest {
        arch,
        input: Path::new(input),
        output: Path::new(output),
        stub_elf: Path::new(stub_elf),
        stub_bin: Path::new(stub_bin),
        manifest: Path::new(manifest),
    };
    if let Err(err) = wrap(&request) {
        fatal(err);
    }
}
