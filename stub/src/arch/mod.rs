//! Entry and exit trampolines.
//!
//! `_start` hands the untouched kernel stack pointer to `stub_main`;
//! `jump_to_entrypoint` leaves the stub for good. Neither may touch the
//! stack they are given beyond what the System V ABI allows at process
//! entry.

#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod imp;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod imp;

pub use imp::jump_to_entrypoint;
