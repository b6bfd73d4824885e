//! Dynamic interpreter loading.
//!
//! Maps an ET_DYN interpreter into the address space the same way the
//! kernel would: one PROT_NONE reservation over the whole vaddr range,
//! then MAP_FIXED slices per PT_LOAD with the file-offset misalignment
//! folded into each mapping.

use tg_arena::Arena;
use tg_elf::{ET_DYN, Elf64Ehdr, Elf64Phdr, PF_R, PF_W, PF_X, PT_LOAD, align_up};
use tg_syscall as sys;

use crate::exe::read_structs_at;

pub struct LoadedInterpreter {
    /// Runtime address of the interpreter's own program header table, if a
    /// loadable segment covered it.
    pub phdr: u64,
    pub phnum: u64,
    /// File-relative entrypoint.
    pub entry: u64,
    /// The bias: runtime base minus the image's lowest `p_vaddr`.
    pub base: u64,
}

/// Load the interpreter at `path` and return its entrypoint and bias.
pub fn load_interpreter(arena: &Arena, path: &[u8], page_size: u64) -> LoadedInterpreter {
    trace!("loading interpreter with page_sz: {page_size}\n");

    let cpath = arena.alloc_cstr(path);
    let fd = sys::open(cpath, sys::O_RDONLY, 0)
        .unwrap_or_else(|err| die!("failed to open interpreter: {err}"));

    let ehdr: Elf64Ehdr = crate::exe::read_struct_at(fd, 0);
    if ehdr.validate().is_err() {
        die!("invalid ELF file");
    }
    // Only dynamic interpreters are supported.
    if ehdr.e_type != ET_DYN {
        die!("invalid interpreter e_type");
    }

    let phdrs: &[Elf64Phdr] = read_structs_at(arena, fd, ehdr.e_phnum as usize, ehdr.e_phoff);

    // Find the address range the loadable segments want.
    let mut min_vaddr = u64::MAX;
    let mut max_vaddr = 0u64;
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        min_vaddr = min_vaddr.min(phdr.p_vaddr);
        max_vaddr = max_vaddr.max(phdr.p_vaddr + phdr.p_memsz);
    }
    if max_vaddr == 0 {
        die!("interpreter has no loadable segments");
    }
    trace!("loader virtual address range: {min_vaddr:08x}..{max_vaddr:08x}\n");

    // One big PROT_NONE reservation; the segments carve it up below.
    let reservation = unsafe {
        sys::mmap(
            core::ptr::null_mut(),
            align_up(max_vaddr, page_size) as usize,
            sys::PROT_NONE,
            sys::Map::PRIVATE | sys::Map::ANONYMOUS,
            -1,
            0,
        )
    }
    .unwrap_or_else(|err| die!("failed to reserve interpreter range: {err}"));
    let bias = (reservation.as_ptr() as u64).wrapping_sub(min_vaddr);

    let mask = page_size - 1;
    let mut phdr_addr = 0u64;
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        // The file offset may be misaligned; fold the misalignment into the
        // mapping.
        let misalignment = phdr.p_offset & mask;
        let file_offset = phdr.p_offset - misalignment;
        let segment_address = bias.wrapping_add(phdr.p_vaddr - misalignment) as *mut u8;

        let mut prot = sys::PROT_NONE;
        if phdr.p_flags & PF_R != 0 {
            prot |= sys::Prot::READ;
        }
        if phdr.p_flags & PF_W != 0 {
            prot |= sys::Prot::WRITE;
        }
        if phdr.p_flags & PF_X != 0 {
            prot |= sys::Prot::EXEC;
        }
        let writable = prot.contains(sys::Prot::WRITE);

        let filesz = align_up(phdr.p_filesz + misalignment, page_size);
        let memsz = align_up(phdr.p_memsz + misalignment, page_size);

        // Map the file-backed span.
        let mut mapped = 0u64;
        if phdr.p_filesz > 0 {
            let flags = if writable {
                sys::Map::PRIVATE
            } else {
                sys::Map::SHARED
            };
            unsafe {
                sys::mmap(
                    segment_address,
                    filesz as usize,
                    prot,
                    sys::Map::FIXED | flags,
                    fd,
                    file_offset,
                )
            }
            .unwrap_or_else(|err| die!("mmap failed: {err}"));
            mapped += filesz;
        }

        // Extend with anonymous memory when the segment is larger in memory
        // than in the file.
        if memsz > filesz {
            unsafe {
                sys::mmap(
                    segment_address.add(filesz as usize),
                    (memsz - filesz) as usize,
                    prot,
                    sys::Map::FIXED | sys::Map::ANONYMOUS | sys::Map::PRIVATE,
                    -1,
                    0,
                )
            }
            .unwrap_or_else(|err| die!("mmap failed: {err}"));
            mapped += memsz - filesz;
        }

        // Zero the tail of a writable segment to satisfy .bss.
        if writable {
            let offset = misalignment + phdr.p_filesz;
            let length = mapped.saturating_sub(phdr.p_filesz + misalignment);
            unsafe {
                segment_address.add(offset as usize).write_bytes(0, length as usize);
            }
        }

        if mapped < phdr.p_memsz {
            die!("failed to map segment");
        }
        trace!(
            "LOADER: {:08x}..{:08x} to {:08x}..{:08x} {:03o}\n",
            phdr.p_vaddr,
            phdr.p_vaddr + phdr.p_memsz,
            segment_address as u64,
            segment_address as u64 + mapped,
            prot.bits()
        );

        // If this segment covers the program header table, remember where
        // it landed.
        if phdr.p_offset <= ehdr.e_phoff && ehdr.e_phoff < phdr.p_offset + phdr.p_filesz {
            phdr_addr = bias.wrapping_add(phdr.p_vaddr + (ehdr.e_phoff - phdr.p_offset));
        }
    }

    let _ = sys::close(fd);

    let loaded = LoadedInterpreter {
        phdr: phdr_addr,
        phnum: ehdr.e_phnum as u64,
        entry: ehdr.e_entry,
        base: bias,
    };
    trace!(
        "loaded interpreter: phdr: {:x}, phnum: {}, entry: {:x}, base_address: {:x}\n",
        loaded.phdr,
        loaded.phnum,
        loaded.entry,
        loaded.base
    );
    loaded
}
