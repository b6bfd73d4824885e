//! Program-header synthesis for the loaded process.
//!
//! The interpreter discovers the main program through `AT_PHDR`, but the
//! table baked into the wrapped file describes the stub's segment too. The
//! stub is already mapped (it is running), so the rebuilt table drops that
//! segment, repoints `PT_PHDR` at itself, and appends a synthetic
//! `PT_INTERP` naming the manifest's interpreter.

use tg_arena::Arena;
use tg_elf::{Elf64Phdr, PF_R, PT_INTERP, PT_LOAD, PT_PHDR, p_type_name};

/// Build the program header table the interpreter will see. The memory
/// must come from an arena that outlives the control transfer.
pub fn create_program_headers<'a>(
    arena: &'a Arena,
    interpreter: Option<&[u8]>,
    load_address: u64,
    stub_entry: u64,
    old: &[Elf64Phdr],
) -> &'a [Elf64Phdr] {
    let table = arena.alloc_slice_fill_copy(old.len() + 1, Elf64Phdr::zeroed());
    let mut count = 0;
    for (index, phdr) in old.iter().enumerate() {
        // Skip the load segment containing the stub; the loader must not
        // map it again.
        if phdr.p_type == PT_LOAD && phdr.contains_vaddr(stub_entry) {
            continue;
        }

        table[count] = *phdr;

        // Patch PT_PHDR to point at this table. The vaddr is stored
        // unrebased; the loader adds the base back.
        if phdr.p_type == PT_PHDR {
            if index != 0 {
                die!("PT_PHDR must appear first");
            }
            table[count].p_vaddr = (table.as_ptr() as u64).wrapping_sub(load_address);
            table[count].p_paddr = table[count].p_vaddr;
        }

        count += 1;
    }

    // Append a PT_INTERP naming the manifest's interpreter.
    if let Some(path) = interpreter {
        let copy = arena.alloc_cstr(path);
        let mut interp = Elf64Phdr::zeroed();
        interp.p_type = PT_INTERP;
        interp.p_flags = PF_R;
        interp.p_vaddr = (copy.as_ptr() as u64).wrapping_sub(load_address);
        interp.p_paddr = interp.p_vaddr;
        interp.p_memsz = path.len() as u64;
        interp.p_align = 1;
        table[count] = interp;
        count += 1;
    }

    &table[..count]
}

/// Debugging dump of a program header table.
pub fn print_table(phdrs: &[Elf64Phdr]) {
    crate::trace::write_fmt(format_args!("count: {}\n", phdrs.len()));
    for phdr in phdrs {
        crate::trace::write_fmt(format_args!(
            "{} flags:{:o} offset:{:x} vaddr:{:x}, paddr:{:x}, filesz:{:x}, memsz:{:x}, align: {:x}\n",
            p_type_name(phdr.p_type),
            phdr.p_flags,
            phdr.p_offset,
            phdr.p_vaddr,
            phdr.p_paddr,
            phdr.p_filesz,
            phdr.p_memsz,
            phdr.p_align
        ));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tg_elf::PT_NOTE;

    fn load(vaddr: u64, memsz: u64) -> Elf64Phdr {
        let mut phdr = Elf64Phdr::zeroed();
        phdr.p_type = PT_LOAD;
        phdr.p_vaddr = vaddr;
        phdr.p_memsz = memsz;
        phdr.p_align = 0x1000;
        phdr
    }

    #[test]
    fn drops_the_stub_segment_and_appends_interp() {
        let mut pt_phdr = Elf64Phdr::zeroed();
        pt_phdr.p_type = PT_PHDR;
        let mut note = Elf64Phdr::zeroed();
        note.p_type = PT_NOTE;
        let old = [
            pt_phdr,
            load(0x0000, 0x2000),
            load(0x200000, 0x1000), // the stub's segment
            note,
        ];

        let arena = Arena::new(4096);
        let load_address = 0x1000u64;
        let table = create_program_headers(
            &arena,
            Some(b"/lib64/ld-linux-x86-64.so.2"),
            load_address,
            0x200123,
            &old,
        );

        // Stub LOAD dropped, PT_INTERP appended.
        assert_eq!(table.len(), 4);
        assert!(table.iter().all(|phdr| !phdr.contains_vaddr(0x200123) || phdr.p_type != PT_LOAD));
        assert_eq!(table[0].p_type, PT_PHDR);
        assert_eq!(table[1].p_type, PT_LOAD);
        assert_eq!(table[1].p_vaddr, 0x0000);
        assert_eq!(table[2].p_type, PT_NOTE);

        // PT_PHDR points at the new table, unrebased.
        assert_eq!(
            table[0].p_vaddr.wrapping_add(load_address),
            table.as_ptr() as u64
        );

        // The synthetic PT_INTERP names the interpreter path.
        let interp = &table[3];
        assert_eq!(interp.p_type, PT_INTERP);
        assert_eq!(interp.p_flags, PF_R);
        assert_eq!(interp.p_align, 1);
        assert_eq!(interp.p_memsz, b"/lib64/ld-linux-x86-64.so.2".len() as u64);
        let path_ptr = interp.p_vaddr.wrapping_add(load_address) as *const u8;
        let path = unsafe { crate::stack::cstr_bytes(path_ptr) };
        assert_eq!(path, b"/lib64/ld-linux-x86-64.so.2");
    }

    #[test]
    fn no_interpreter_appends_nothing() {
        let old = [load(0x0000, 0x1000), load(0x400000, 0x1000)];
        let arena = Arena::new(4096);
        let table = create_program_headers(&arena, None, 0, 0x400010, &old);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].p_vaddr, 0x0000);
    }
}
