//! The stub runtime.
//!
//! A wrapped binary's `e_entry` points here. Before any other code in the
//! process runs, the stub scans the kernel-provided stack, reads the
//! manifest embedded in its own file image, and either `execve`s the
//! configured command or maps a dynamic interpreter, synthesizes fresh
//! program headers and a fresh stack, and jumps.
//!
//! There is no libc and no heap: every syscall is direct and every
//! allocation comes from the mmap-backed arena.

#![cfg_attr(all(not(test), target_os = "none"), no_std)]
#![cfg_attr(all(not(test), target_os = "none"), no_main)]

#[macro_use]
mod trace;

mod arch;
mod exe;
mod interp;
mod phdr;
mod stack;

use tg_arena::Arena;
use tg_elf::{AT_BASE, AT_ENTRY, AT_PAGESZ, AT_PHDR, AT_PHNUM};
use tg_manifest::{InterpreterKind, Manifest};
use tg_syscall as sys;
use tg_util::Out;

use crate::stack::Stack;
use crate::trace::Stderr;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Options {
    enable_tracing: bool,
    suppress_args: bool,
    suppress_env: bool,
}

impl Options {
    /// Scan argv for `--tangram-*` flags and envp for `TANGRAM_*` prefixes.
    fn parse(stack: &Stack) -> Options {
        let mut options = Options::default();
        for index in 0..stack.argc {
            match stack.arg(index) {
                b"--tangram-suppress-args" => options.suppress_args = true,
                b"--tangram-suppress-env" => options.suppress_env = true,
                _ => {}
            }
        }
        for index in 0..stack.envc {
            let entry = stack.env_entry(index);
            if entry.starts_with(b"TANGRAM_SUPPRESS_ARGS") {
                options.suppress_args = true;
            }
            if entry.starts_with(b"TANGRAM_SUPPRESS_ENV") {
                options.suppress_env = true;
            }
            if entry.starts_with(b"TANGRAM_TRACING") {
                options.enable_tracing = true;
            }
        }
        trace::set_tracing(options.enable_tracing);
        options
    }
}

// ============================================================================
// Auxv bookkeeping
// ============================================================================

/// Positions of the auxv entries the stub rewrites in place.
struct AuxvIndices {
    entry: usize,
    phdr: usize,
    phnum: usize,
    base: Option<usize>,
}

impl AuxvIndices {
    fn find(stack: &Stack) -> AuxvIndices {
        let mut entry = None;
        let mut phdr = None;
        let mut phnum = None;
        let mut base = None;
        for index in 0..stack.auxc {
            let aux = unsafe { *stack.auxv.add(index) };
            let slot = match aux.a_type {
                AT_ENTRY => &mut entry,
                AT_PHDR => &mut phdr,
                AT_PHNUM => &mut phnum,
                AT_BASE => &mut base,
                _ => continue,
            };
            if slot.is_some() {
                die!("duplicate auxv entry {}", aux.a_type);
            }
            *slot = Some(index);
        }
        let (Some(entry), Some(phdr), Some(phnum)) = (entry, phdr, phnum) else {
            die!("missing AT_PHDR or AT_ENTRY");
        };
        AuxvIndices {
            entry,
            phdr,
            phnum,
            base,
        }
    }

    fn set(&self, stack: &Stack, index: usize, value: u64) {
        unsafe { (*stack.auxv.add(index)).a_val = value };
    }
}

// ============================================================================
// The execve path
// ============================================================================

/// A fully composed `execve` invocation. `argv` and `envp` are
/// null-terminated pointer arrays in arena memory.
struct ExecImage<'a> {
    pathname: &'a core::ffi::CStr,
    argv: &'a [*const u8],
    envp: &'a [*const u8],
}

/// Compose the child invocation: the interpreter (when present) runs the
/// executable with `--argv0` carrying the incoming argv[0], and musl's
/// loader additionally receives a `--` separator.
fn compose_exec<'a>(
    arena: &'a Arena,
    manifest: &Manifest<'a>,
    argv0: *const u8,
) -> ExecImage<'a> {
    let Some(executable) = manifest.executable else {
        die!("missing executable");
    };
    let pathname = arena.alloc_cstr(manifest.interpreter.unwrap_or(executable));

    // pathname + interp args + --argv0 + argv0 + -- + executable + args.
    let capacity = 1 + manifest.interp_argv.len() + 4 + manifest.argv.len();
    let argv = arena.alloc_slice_fill_copy(capacity + 1, core::ptr::null::<u8>());
    let mut n = 0;
    argv[n] = pathname.as_ptr() as *const u8;
    n += 1;
    if manifest.interpreter.is_some() {
        for arg in manifest.interp_argv {
            argv[n] = arena.alloc_cstr(arg).as_ptr() as *const u8;
            n += 1;
        }
        // Tell the loader what the program believes its own name is.
        argv[n] = c"--argv0".as_ptr() as *const u8;
        n += 1;
        argv[n] = argv0;
        n += 1;
        if manifest.interpreter_kind == InterpreterKind::LdMusl {
            argv[n] = c"--".as_ptr() as *const u8;
            n += 1;
        }
        argv[n] = arena.alloc_cstr(executable).as_ptr() as *const u8;
        n += 1;
    }
    for arg in manifest.argv {
        argv[n] = arena.alloc_cstr(arg).as_ptr() as *const u8;
        n += 1;
    }

    // Materialize envp from the table.
    let envp = arena.alloc_slice_fill_copy(manifest.env.len() + 1, core::ptr::null::<u8>());
    let mut e = 0;
    for (key, value) in manifest.env.iter() {
        let entry = arena.alloc_slice_fill_copy(key.len() + value.len() + 2, 0u8);
        entry[..key.len()].copy_from_slice(key);
        entry[key.len()] = b'=';
        entry[key.len() + 1..key.len() + 1 + value.len()].copy_from_slice(value);
        envp[e] = entry.as_ptr();
        e += 1;
    }

    let argv: &'a [*const u8] = argv;
    let envp: &'a [*const u8] = envp;
    ExecImage {
        pathname,
        argv: &argv[..n + 1],
        envp: &envp[..e + 1],
    }
}

/// Spawn the manifest's executable through `execve`, optionally under its
/// interpreter. Only returns on failure, which is fatal.
fn exec<'a>(arena: &'a Arena, manifest: &Manifest<'a>, argv0: *const u8) -> ! {
    let image = compose_exec(arena, manifest, argv0);

    if trace::tracing() {
        trace!("about to exec...\n");
        let out = &mut Stderr;
        for (index, arg) in image.argv.iter().take_while(|arg| !arg.is_null()).enumerate() {
            trace::write_fmt(format_args!("argv[{index}] = "));
            out.put(unsafe { stack::cstr_bytes(*arg) });
            out.put(b"\n");
        }
        for (index, entry) in image.envp.iter().take_while(|entry| !entry.is_null()).enumerate() {
            trace::write_fmt(format_args!("envp[{index}] = "));
            out.put(unsafe { stack::cstr_bytes(*entry) });
            out.put(b"\n");
        }
    }

    let errno = unsafe {
        sys::execve(
            image.pathname.as_ptr() as *const u8,
            image.argv.as_ptr(),
            image.envp.as_ptr(),
        )
    };
    die!("execve failed: {errno}")
}

// ============================================================================
// Entrypoint
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn stub_main(sp: *mut u8) -> ! {
    // Scan the stack to collect argv/envp/auxv, then configure ourselves
    // from them.
    let stack = unsafe { Stack::scan(sp) };
    let options = Options::parse(&stack);
    trace!(
        "options: enable_tracing:{}, suppress_args:{}, suppress_env:{}\n",
        options.enable_tracing, options.suppress_args, options.suppress_env
    );
    if trace::tracing() {
        trace!("original stack:\n");
        stack.print();
    }

    // Only the page size comes from the glob table; the program headers are
    // re-read from the file image later.
    let mut page_size = stack.auxv_glob[AT_PAGESZ as usize];
    if page_size == 0 {
        page_size = 4096;
    }

    let arena = Arena::new(page_size as usize);
    trace!("initialized arena\n");

    // The auxv slots that get patched before the jump.
    let auxv = AuxvIndices::find(&stack);

    // Read the executable and manifest.
    let exe = exe::read_self(&arena, &stack, options.suppress_env);
    trace!("read executable, manifest size: {}\n", exe.footer.size);
    let mut manifest = exe.manifest;

    // Compose the child argv: manifest args first, then the incoming args
    // (sans argv0) unless suppressed.
    if !options.suppress_args {
        let composed = arena.alloc_slice_fill_copy::<&[u8]>(
            manifest.argv.len() + stack.argc.saturating_sub(1),
            b"",
        );
        let mut n = 0;
        for arg in manifest.argv {
            composed[n] = *arg;
            n += 1;
        }
        for index in 1..stack.argc {
            composed[n] = stack.arg(index);
            n += 1;
        }
        manifest.argv = composed;
    }

    // The wrapped binary's actual base, as reported by the kernel. The
    // AT_PHDR value cannot be trusted once the header table was patched.
    let load_address = stack.auxv_glob[AT_ENTRY as usize]
        .checked_sub(exe.ehdr.e_entry)
        .unwrap_or_else(|| die!("AT_ENTRY below file entrypoint"));

    // A manifest dump was requested: print and leave.
    for index in 1..stack.argc {
        if stack.arg(index) == b"--tangram-print-manifest" {
            manifest.print(&mut Stderr);
            sys::exit(0);
        }
    }

    // Path mode: hand the whole process over to execve.
    if manifest.executable.is_some() {
        exec(&arena, &manifest, stack.argv0());
    }

    // Address mode: load the interpreter (if any) and jump in-process.
    let Some(entrypoint_offset) = manifest.entrypoint else {
        die!("missing entrypoint");
    };
    let new_entry = load_address
        .checked_add(entrypoint_offset)
        .unwrap_or_else(|| die!("entrypoint overflows"));
    auxv.set(&stack, auxv.entry, new_entry);

    let entrypoint = match manifest.interpreter {
        Some(path) => {
            let loaded = interp::load_interpreter(&arena, path, page_size);
            if let Some(base) = auxv.base {
                auxv.set(&stack, base, loaded.base);
            }
            loaded.base.wrapping_add(loaded.entry)
        }
        None => new_entry,
    };

    // Fix the program headers. They live in a second arena that survives
    // the jump.
    let preserved = Arena::new(page_size as usize);
    let new_phdrs = phdr::create_program_headers(
        &preserved,
        manifest.interpreter,
        load_address,
        exe.ehdr.e_entry,
        exe.phdrs,
    );
    if trace::tracing() {
        phdr::print_table(new_phdrs);
    }
    auxv.set(&stack, auxv.phdr, new_phdrs.as_ptr() as u64);
    auxv.set(&stack, auxv.phnum, new_phdrs.len() as u64);

    // Prepare the new stack.
    let new_sp = stack::prepare_stack(&arena, &stack, &manifest);
    if trace::tracing() {
        trace!("new stack:\n");
        unsafe { Stack::scan(new_sp) }.print();
    }

    // Release everything except the preserved arena, then jump.
    drop(manifest);
    drop(arena);
    core::mem::forget(preserved);

    trace!("about to transfer control\n");
    trace!("entrypoint: {entrypoint:#x}\n");
    unsafe { arch::jump_to_entrypoint(new_sp, entrypoint as *const u8) }
}

// ============================================================================
// Panic plumbing
// ============================================================================

/// All fatal paths funnel here: report, trap for an attached debugger, and
/// exit with the stub's failure code.
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    trace::write_fmt(format_args!("{}\n", info.message()));
    sys::breakpoint();
    sys::exit(111)
}

// On hosted targets the stub is only built to keep the workspace
// compiling; it runs solely as a wrapped binary's entrypoint.
#[cfg(all(not(test), not(target_os = "none")))]
fn main() {
    die!("the stub only runs as a wrapped executable's entrypoint");
}

// ============================================================================
// Tests
// ============================================================================
