//! Reading the wrapped binary's own image.
//!
//! The stub opens `/proc/self/exe`, walks its section headers to the
//! manifest note section, validates the trailing footer, and parses the
//! manifest against an environment seeded from the incoming envp.

use core::mem::size_of;

use tg_arena::Arena;
use tg_elf::{Elf64Ehdr, Elf64Phdr, Elf64Shdr, Footer, SHN_XINDEX};
use tg_manifest::{Cx, Manifest};
use tg_syscall as sys;
use tg_util::{Out, Table, split_env};

use crate::stack::Stack;
use crate::trace::Stderr;

/// Everything the stub needs to know about its own file image.
pub struct Executable<'a> {
    pub ehdr: Elf64Ehdr,
    pub phdrs: &'a [Elf64Phdr],
    pub footer: Footer,
    pub manifest: Manifest<'a>,
}

pub(crate) fn read_exact_at(fd: i32, buf: &mut [u8], offset: u64) {
    let mut done = 0;
    while done < buf.len() {
        match sys::pread64(fd, &mut buf[done..], offset + done as u64) {
            Ok(0) => die!("unexpected end of file"),
            Ok(n) => done += n,
            Err(err) => die!("failed to read: {err}"),
        }
    }
}

pub(crate) fn read_struct_at<T: Copy>(fd: i32, offset: u64) -> T {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, size_of::<T>())
    };
    read_exact_at(fd, buf, offset);
    unsafe { value.assume_init() }
}

pub(crate) fn read_structs_at<'a, T: Copy>(
    arena: &'a Arena,
    fd: i32,
    count: usize,
    offset: u64,
) -> &'a [T] {
    let size = count * size_of::<T>();
    let ptr = arena.alloc(size, core::mem::align_of::<T>()).as_ptr() as *mut T;
    let buf = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) };
    read_exact_at(fd, buf, offset);
    unsafe { core::slice::from_raw_parts(ptr, count) }
}

/// Read the running image and parse its manifest. The env table is seeded
/// from the incoming environment unless suppressed; manifest mutations then
/// apply on top.
pub fn read_self<'a>(arena: &'a Arena, stack: &Stack, suppress_env: bool) -> Executable<'a> {
    // Initialize the environment table.
    let env = Table::new(arena, 4096);
    if !suppress_env {
        for index in 0..stack.envc {
            // Entries without a '=' are malformed; skip them.
            let Some((key, value)) = split_env(stack.env_entry(index)) else {
                continue;
            };
            env.insert(arena.alloc_bytes(key), arena.alloc_bytes(value));
        }
        trace!("initialized env\n");
    }

    // We assume the kernel didn't lie: the image we are running is the one
    // behind /proc/self/exe, so no validation here.
    let fd = sys::open(c"/proc/self/exe", sys::O_RDONLY, 0)
        .unwrap_or_else(|err| die!("failed to open /proc/self/exe: {err}"));
    let ehdr: Elf64Ehdr = read_struct_at(fd, 0);

    let phdrs: &[Elf64Phdr] = read_structs_at(arena, fd, ehdr.e_phnum as usize, ehdr.e_phoff);

    // Section count and string-table index, honoring the escape hatches in
    // section 0.
    let mut shnum = ehdr.e_shnum as usize;
    if shnum == 0 && ehdr.e_shoff != 0 {
        let first: Elf64Shdr = read_struct_at(fd, ehdr.e_shoff);
        shnum = first.sh_size as usize;
    }
    if shnum == 0 {
        die!("failed to find manifest section");
    }
    let shdrs: &[Elf64Shdr] = read_structs_at(arena, fd, shnum, ehdr.e_shoff);
    let shstrndx = if ehdr.e_shstrndx == SHN_XINDEX {
        shdrs[0].sh_link as usize
    } else {
        ehdr.e_shstrndx as usize
    };

    let strtab_shdr = &shdrs[shstrndx];
    let strtab: &[u8] =
        read_structs_at(arena, fd, strtab_shdr.sh_size as usize, strtab_shdr.sh_offset);

    // Look for the manifest note section.
    let mut found: Option<(&[u8], Footer)> = None;
    for shdr in shdrs {
        let name_start = shdr.sh_name as usize;
        let Some(tail) = strtab.get(name_start..) else {
            continue;
        };
        let name = match tail.iter().position(|&b| b == 0) {
            Some(end) => &tail[..end],
            None => continue,
        };
        if crate::trace::tracing() {
            let out = &mut Stderr;
            out.put(b"found section ");
            tg_json::print_string(out, name);
            out.put(b"\n");
        }
        if name != b".note.tg-manifest" {
            continue;
        }

        trace!(
            "reading manifest at offset: {}, size: {}\n",
            shdr.sh_offset,
            shdr.sh_size
        );
        let size = shdr.sh_size as usize;
        if size < size_of::<Footer>() {
            die!("manifest section too small");
        }
        let buf = arena.alloc_slice_fill_copy(size, 0u8);
        read_exact_at(fd, buf, shdr.sh_offset);
        let data: &'a [u8] = buf;

        // The footer trails the section; it locates the manifest body.
        let footer_bytes: &[u8; 16] = data[size - size_of::<Footer>()..].try_into().unwrap();
        let footer = Footer::decode(footer_bytes)
            .unwrap_or_else(|err| die!("invalid manifest footer: {err:?}"));
        if footer.size as usize + size_of::<Footer>() > size {
            die!("manifest footer size out of range");
        }
        found = Some((&data[..footer.size as usize], footer));
        break;
    }
    let Some((manifest_data, footer)) = found else {
        die!("failed to find manifest section");
    };
    let _ = sys::close(fd);

    if crate::trace::tracing() {
        let out = &mut Stderr;
        out.put(b"manifest: \n");
        out.put(manifest_data);
        out.put(b"\n");
    }

    // Parse the manifest.
    let cx = Cx::new(arena);
    let manifest = tg_manifest::parse(&cx, env, manifest_data)
        .unwrap_or_else(|err| die!("failed to parse manifest: {err:?}"));

    Executable {
        ehdr,
        phdrs,
        footer,
        manifest,
    }
}
