//! x86_64 entry and control transfer.

#[cfg(target_os = "none")]
core::arch::global_asm!(
    ".global _start",
    "_start:",
    // The kernel's stack pointer is stub_main's only argument.
    "mov rdi, rsp",
    "call stub_main",
);

/// Switch to the prepared stack and branch to `entry`. Clears the frame
/// pointer, the return register, and rdx (no cleanup handler is passed to
/// the new image). Must not return and must leave no stub frame visible to
/// the callee.
///
/// # Safety
///
/// `sp` must point at a System V process-initialization stack and `entry`
/// at the first instruction the new image expects to run.
#[unsafe(naked)]
pub unsafe extern "C" fn jump_to_entrypoint(sp: *mut u8, entry: *const u8) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi", // set the stack pointer.
        "xor rax, rax", // clear the return value.
        "xor rbp, rbp", // clear the frame pointer.
        "xor rdx, rdx", // no cleanup handler.
        "jmp rsi",      // jump to the entrypoint.
    )
}
