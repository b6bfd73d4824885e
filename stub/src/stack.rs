//! Initial-stack scanning and new-stack synthesis.
//!
//! The kernel hands the process one stack layout and the loaded program
//! expects exactly the same shape back:
//!
//! ```text
//! [high address]
//! environment strings
//! argument strings
//! padding for alignment
//! auxv entries, AT_NULL last
//! null (end of envp)
//! envp pointers
//! null (end of argv)
//! argv pointers
//! argc                <- SP, 16-aligned
//! [low address]
//! ```

use core::ffi::{CStr, c_char};
use core::ptr;

use tg_arena::Arena;
use tg_elf::{AT_NULL, Auxv, at_name};
use tg_manifest::Manifest;
use tg_syscall as sys;
use tg_util::Out;

use crate::trace::Stderr;

/// Borrow the bytes of a null-terminated string living on the original
/// stack.
///
/// # Safety
///
/// `ptr` must point at a null-terminated string that stays mapped for the
/// stub's whole run (kernel-provided argv/envp strings qualify).
pub unsafe fn cstr_bytes(ptr: *const u8) -> &'static [u8] {
    unsafe { CStr::from_ptr(ptr as *const c_char) }.to_bytes()
}

/// Data passed to us on the stack by the kernel, plus lookup tables built
/// while scanning it.
pub struct Stack {
    pub sp: *mut u8,
    pub argc: usize,
    pub argv: *const *const u8,
    pub envc: usize,
    pub envp: *const *const u8,
    /// Number of auxv entries including the AT_NULL terminator.
    pub auxc: usize,
    pub auxv: *mut Auxv,
    /// Values of auxv entries with `a_type < 32`, for O(1) lookup.
    pub auxv_glob: [u64; 32],
}

impl Stack {
    /// Scan the bottom of the stack to extract argv, envp, and auxv.
    ///
    /// # Safety
    ///
    /// `sp` must be a System V process-initialization stack pointer.
    pub unsafe fn scan(sp: *mut u8) -> Stack {
        if sp as usize % 16 != 0 {
            die!("misaligned stack");
        }
        unsafe {
            let words = sp as *const u64;

            // The arg vector: a count, then argc pointers, then null.
            let argc = *words as usize;
            let argv = words.add(1) as *const *const u8;

            // The env vector is null-terminated.
            let envp = words.add(1 + argc + 1) as *const *const u8;
            let mut envc = 0;
            while !(*envp.add(envc)).is_null() {
                envc += 1;
            }

            // The aux vector runs until AT_NULL.
            let auxv = words.add(1 + argc + 1 + envc + 1) as *mut Auxv;
            let mut auxv_glob = [0u64; 32];
            let mut auxc = 0;
            loop {
                let entry = *auxv.add(auxc);
                auxc += 1;
                if entry.a_type < 32 {
                    auxv_glob[entry.a_type as usize] = entry.a_val;
                }
                if entry.a_type == AT_NULL {
                    break;
                }
            }

            Stack {
                sp,
                argc,
                argv,
                envc,
                envp,
                auxc,
                auxv,
                auxv_glob,
            }
        }
    }

    pub fn arg(&self, index: usize) -> &'static [u8] {
        unsafe { cstr_bytes(*self.argv.add(index)) }
    }

    pub fn env_entry(&self, index: usize) -> &'static [u8] {
        unsafe { cstr_bytes(*self.envp.add(index)) }
    }

    /// argv[0] as the kernel delivered it, trailing null included.
    pub fn argv0(&self) -> *const u8 {
        unsafe { *self.argv }
    }

    /// Debugging dump of everything the scan found.
    pub fn print(&self) {
        let out = &mut Stderr;
        crate::trace::write_fmt(format_args!("{{\n\targc: {},\n\targv: [\n", self.argc));
        for index in 0..self.argc {
            out.put(b"\t\t");
            tg_json::print_string(out, self.arg(index));
            out.put(b",\n");
        }
        out.put(b"\t],\n\tenvp: [\n");
        for index in 0..self.envc {
            out.put(b"\t\t");
            tg_json::print_string(out, self.env_entry(index));
            out.put(b",\n");
        }
        out.put(b"\t],\n\tauxv: [\n");
        for index in 0..self.auxc {
            let entry = unsafe { *self.auxv.add(index) };
            crate::trace::write_fmt(format_args!(
                "\t\t{{ a_type: \"{}\", a_val: {:08x} }},\n",
                at_name(entry.a_type),
                entry.a_val
            ));
        }
        out.put(b"\t]\n}\n");
    }
}

// ============================================================================
// Stack synthesis
// ============================================================================

fn push_bytes(sp: *mut u8, bytes: &[u8]) -> *mut u8 {
    unsafe {
        let sp = sp.sub(bytes.len());
        ptr::copy_nonoverlapping(bytes.as_ptr(), sp, bytes.len());
        sp
    }
}

fn push_word(sp: *mut u8, value: u64) -> *mut u8 {
    unsafe {
        let sp = sp.sub(8);
        (sp as *mut u64).write_unaligned(value);
        sp
    }
}

fn push_auxv(sp: *mut u8, entry: &Auxv) -> *mut u8 {
    let sp = push_word(sp, entry.a_val);
    push_word(sp, entry.a_type)
}

/// Build a fresh execution stack for the new image. The environment comes
/// from the manifest's table, argv[0] from the incoming stack, the rest of
/// argv from the (already composed) manifest argv, and the auxv is copied
/// from the live one with whatever patches were applied to it.
pub fn prepare_stack(arena: &Arena, stack: &Stack, manifest: &Manifest<'_>) -> *mut u8 {
    // Size the new stack off the kernel's limit, as-is.
    let rlim = sys::getrlimit(sys::RLIMIT_STACK)
        .unwrap_or_else(|err| die!("failed to get the stack size: {err}"));
    let stack_size = rlim.soft as usize;

    // The address mmap returns is the lowest address of the stack; pushing
    // starts one byte past the top and grows down.
    let base = unsafe {
        sys::mmap(
            ptr::null_mut(),
            stack_size,
            sys::Prot::READ | sys::Prot::WRITE,
            sys::Map::ANONYMOUS | sys::Map::PRIVATE | sys::Map::GROWSDOWN,
            -1,
            0,
        )
    }
    .unwrap_or_else(|err| die!("failed to map the new stack: {err}"));
    let mut sp = unsafe { base.as_ptr().add(stack_size) };

    // Push environment strings, recording their addresses. Order does not
    // matter.
    let envp = arena.alloc_slice_fill_copy(manifest.env.len(), ptr::null::<u8>());
    let mut envc = 0;
    for (key, value) in manifest.env.iter() {
        let entry = arena.alloc_slice_fill_copy(key.len() + value.len() + 2, 0u8);
        entry[..key.len()].copy_from_slice(key);
        entry[key.len()] = b'=';
        entry[key.len() + 1..key.len() + 1 + value.len()].copy_from_slice(value);
        sp = push_bytes(sp, entry);
        envp[envc] = sp;
        envc += 1;
    }

    // Push argv strings: the incoming argv[0] first, then the composed
    // manifest argv.
    let argv = arena.alloc_slice_fill_copy(manifest.argv.len() + 1, ptr::null::<u8>());
    let mut argc = 0;
    sp = push_bytes(sp, unsafe {
        CStr::from_ptr(stack.argv0() as *const c_char).to_bytes_with_nul()
    });
    argv[argc] = sp;
    argc += 1;
    for arg in manifest.argv {
        let arg = arena.alloc_cstr(arg);
        sp = push_bytes(sp, arg.to_bytes_with_nul());
        argv[argc] = sp;
        argc += 1;
    }

    // Push 16 null bytes, then align.
    sp = push_word(sp, 0);
    sp = push_word(sp, 0);
    sp = (sp as usize & !15) as *mut u8;

    // An even number of env and arg values needs 8 more bytes of padding so
    // the final stack pointer lands 16-aligned.
    if (envc + argc) % 2 == 0 {
        sp = push_word(sp, 0);
    }

    // Push the aux vector in reverse so the entries read in their original
    // order with AT_NULL last.
    for index in (0..stack.auxc).rev() {
        let entry = unsafe { *stack.auxv.add(index) };
        sp = push_auxv(sp, &entry);
    }

    // Null separator between envp and auxv.
    sp = push_word(sp, 0);

    // Push envp, in reverse order.
    for index in (0..envc).rev() {
        sp = push_word(sp, envp[index] as u64);
    }

    // Null separator between argv and envp.
    sp = push_word(sp, 0);

    // Push argv, in reverse order, then argc.
    for index in (0..argc).rev() {
        sp = push_word(sp, argv[index] as u64);
    }
    sp = push_word(sp, argc as u64);

    if sp as usize % 16 != 0 {
        die!("misaligned stack");
    }
    sp
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tg_elf::{AT_ENTRY, AT_PAGESZ, AT_PHDR};
    use tg_manifest::Cx;
    use tg_util::Table;

    /// A fake process-initialization stack, 16-aligned.
    #[repr(C, align(16))]
    struct FakeStack([u64; 64]);

    fn build_fake_stack(args: &[&CStr], envs: &[&CStr], auxv: &[(u64, u64)]) -> FakeStack {
        let mut words = [0u64; 64];
        let mut n = 0;
        words[n] = args.len() as u64;
        n += 1;
        for arg in args {
            words[n] = arg.as_ptr() as u64;
            n += 1;
        }
        n += 1; // argv null
        for env in envs {
            words[n] = env.as_ptr() as u64;
            n += 1;
        }
        n += 1; // envp null
        for (a_type, a_val) in auxv {
            words[n] = *a_type;
            words[n + 1] = *a_val;
            n += 2;
        }
        // AT_NULL terminator is already zero.
        FakeStack(words)
    }

    #[test]
    fn scan_finds_vectors_and_glob() {
        let fake = build_fake_stack(
            &[c"/bin/app", c"--flag"],
            &[c"PATH=/usr/bin", c"HOME=/root"],
            &[(AT_PAGESZ, 4096), (AT_ENTRY, 0x555555555000), (AT_PHDR, 0x400040)],
        );
        let stack = unsafe { Stack::scan(fake.0.as_ptr() as *mut u8) };
        assert_eq!(stack.argc, 2);
        assert_eq!(stack.arg(0), b"/bin/app");
        assert_eq!(stack.arg(1), b"--flag");
        assert_eq!(stack.envc, 2);
        assert_eq!(stack.env_entry(1), b"HOME=/root");
        assert_eq!(stack.auxc, 4);
        assert_eq!(stack.auxv_glob[AT_PAGESZ as usize], 4096);
        assert_eq!(stack.auxv_glob[AT_ENTRY as usize], 0x555555555000);
    }

    #[test]
    fn prepared_stack_scans_back_correctly() {
        let doc = r#"{
            "args": [
                { "components": [{ "kind": "string", "value": "--one" }] },
                { "components": [{ "kind": "string", "value": "--two" }] }
            ],
            "env": { "kind": "set", "value": { "kind": "map", "value": {
                "ALPHA": "a", "BETA": "b", "GAMMA": "c"
            }}}
        }"#;
        let fake = build_fake_stack(
            &[c"/bin/app"],
            &[],
            &[(AT_PAGESZ, 4096), (AT_ENTRY, 0x555555555000)],
        );
        let stack = unsafe { Stack::scan(fake.0.as_ptr() as *mut u8) };

        let arena = Arena::new(4096);
        let cx = Cx::new(&arena);
        let manifest = tg_manifest::parse(&cx, Table::new(&arena, 64), doc.as_bytes()).unwrap();

        let sp = prepare_stack(&arena, &stack, &manifest);
        assert_eq!(sp as usize % 16, 0);

        // The new stack must scan exactly like a kernel-provided one.
        let new_stack = unsafe { Stack::scan(sp) };
        assert_eq!(new_stack.argc, 3);
        assert_eq!(new_stack.arg(0), b"/bin/app");
        assert_eq!(new_stack.arg(1), b"--one");
        assert_eq!(new_stack.arg(2), b"--two");
        assert_eq!(new_stack.envc, 3);
        let mut seen: Vec<&[u8]> = (0..new_stack.envc).map(|i| new_stack.env_entry(i)).collect();
        seen.sort();
        assert_eq!(seen, vec![&b"ALPHA=a"[..], b"BETA=b", b"GAMMA=c"]);

        // The auxv is copied verbatim, AT_NULL last.
        assert_eq!(new_stack.auxc, 3);
        assert_eq!(new_stack.auxv_glob[AT_PAGESZ as usize], 4096);
        assert_eq!(new_stack.auxv_glob[AT_ENTRY as usize], 0x555555555000);
        let last = unsafe { *new_stack.auxv.add(2) };
        assert_eq!(last.a_type, AT_NULL);
    }

    #[test]
    fn parity_padding_holds_for_odd_and_even_counts() {
        for extra_env in 0..4 {
            let doc = format!(
                r#"{{ "env": {{ "kind": "set", "value": {{ "kind": "map", "value": {{ {} }} }} }} }}"#,
                (0..extra_env)
                    .map(|n| format!(r#""VAR{n}": "v""#))
                    .collect::<Vec<_>>()
                    .join(",")
            );
            let fake = build_fake_stack(&[c"argv0"], &[], &[(AT_PAGESZ, 4096)]);
            let stack = unsafe { Stack::scan(fake.0.as_ptr() as *mut u8) };
            let arena = Arena::new(4096);
            let cx = Cx::new(&arena);
            let manifest =
                tg_manifest::parse(&cx, Table::new(&arena, 16), doc.as_bytes()).unwrap();
            let sp = prepare_stack(&arena, &stack, &manifest);
            assert_eq!(sp as usize % 16, 0, "extra_env = {extra_env}");
            let rescanned = unsafe { Stack::scan(sp) };
            assert_eq!(rescanned.argc, 1);
            assert_eq!(rescanned.envc, extra_env);
        }
    }
}
