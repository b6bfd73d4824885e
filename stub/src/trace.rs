//! Stderr diagnostics for the stub.
//!
//! Nothing here may allocate: tracing writes straight to fd 2 through the
//! raw `write` syscall, and fatal paths trap before exiting so a debugger
//! can attach to the corpse.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use tg_syscall as sys;
use tg_util::Out;

static TRACING: AtomicBool = AtomicBool::new(false);

pub fn set_tracing(enabled: bool) {
    TRACING.store(enabled, Ordering::Relaxed);
}

pub fn tracing() -> bool {
    TRACING.load(Ordering::Relaxed)
}

/// Byte sink over stderr; failures are swallowed, diagnostics are best
/// effort.
pub struct Stderr;

impl Out for Stderr {
    fn put(&mut self, bytes: &[u8]) {
        let _ = sys::write(sys::STDERR_FILENO, bytes);
    }
}

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let _ = sys::write(sys::STDERR_FILENO, s.as_bytes());
        Ok(())
    }
}

pub fn write_fmt(args: fmt::Arguments<'_>) {
    let _ = fmt::Write::write_fmt(&mut Stderr, args);
}

/// Abort per the stub contract: message, software breakpoint, exit(111).
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    write_fmt(args);
    write_fmt(format_args!("\n"));
    sys::breakpoint();
    sys::exit(111)
}

/// Print to stderr when tracing is enabled.
macro_rules! trace {
    ($($arg:tt)*) => {
        if $crate::trace::tracing() {
            $crate::trace::write_fmt(core::format_args!($($arg)*));
        }
    };
}

/// Unconditional fatal error: message, trap, exit(111).
macro_rules! die {
    ($($arg:tt)*) => {
        $crate::trace::fatal(core::format_args!($($arg)*))
    };
}
