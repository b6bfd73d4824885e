//! End-to-end tests for the wrap pipeline over synthetic ELF images.

use std::mem::size_of;
use std::path::{Path, PathBuf};

use serde_json::json;

use tg_elf::{
    Arch, Elf64Ehdr, Elf64Phdr, Elf64Shdr, ELF_MAGIC, ELFCLASS64, ELFDATA2LSB, EI_CLASS, EI_DATA,
    EM_X86_64, ET_DYN, PF_R, PF_W, PF_X, PT_GNU_EH_FRAME, PT_GNU_STACK, PT_INTERP, PT_LOAD,
    PT_NOTE, PT_PHDR, PT_TLS, SHF_ALLOC, SHF_EXECINSTR, SHT_NOTE, SHT_PROGBITS, SHT_STRTAB,
    align_up,
};
use wrap::{STUB_SECTION, WrapError, WrapRequest, wrap};

// ============================================================================
// Synthetic ELF construction
// ============================================================================

fn push_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    buf.extend_from_slice(bytes);
}

fn read_struct<T: Copy>(bytes: &[u8], offset: usize) -> T {
    assert!(offset + size_of::<T>() <= bytes.len());
    unsafe { (bytes.as_ptr().add(offset) as *const T).read_unaligned() }
}

fn base_ehdr() -> Elf64Ehdr {
    let mut e_ident = [0u8; 16];
    e_ident[0..4].copy_from_slice(&ELF_MAGIC);
    e_ident[EI_CLASS] = ELFCLASS64;
    e_ident[EI_DATA] = ELFDATA2LSB;
    Elf64Ehdr {
        e_ident,
        e_type: ET_DYN,
        e_machine: EM_X86_64,
        e_version: 1,
        e_entry: 0x1000,
        e_phoff: 64,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: 64,
        e_phentsize: size_of::<Elf64Phdr>() as u16,
        e_phnum: 0,
        e_shentsize: size_of::<Elf64Shdr>() as u16,
        e_shnum: 0,
        e_shstrndx: 0,
    }
}

fn load_phdr(vaddr: u64, memsz: u64, flags: u32) -> Elf64Phdr {
    let mut phdr = Elf64Phdr::zeroed();
    phdr.p_type = PT_LOAD;
    phdr.p_flags = flags;
    phdr.p_offset = vaddr & 0xfff;
    phdr.p_vaddr = vaddr;
    phdr.p_paddr = vaddr;
    phdr.p_filesz = memsz;
    phdr.p_memsz = memsz;
    phdr.p_align = 0x1000;
    phdr
}

fn other_phdr(p_type: u32) -> Elf64Phdr {
    let mut phdr = Elf64Phdr::zeroed();
    phdr.p_type = p_type;
    phdr.p_flags = PF_R;
    phdr.p_align = 8;
    phdr
}

/// Build an input image: header, program headers, the placeholder sections
/// the wrapper patches, a string table, and some trailing payload bytes.
fn build_input(phdrs: &[Elf64Phdr]) -> Vec<u8> {
    let shstrtab = b"\0.text.tangram-stub\0.note.tg-manifest\0.shstrtab\0";
    let phoff = 64u64;
    let shoff = phoff + (phdrs.len() * size_of::<Elf64Phdr>()) as u64;
    let stroff = shoff + (4 * size_of::<Elf64Shdr>()) as u64;

    let mut ehdr = base_ehdr();
    ehdr.e_phnum = phdrs.len() as u16;
    ehdr.e_shoff = shoff;
    ehdr.e_shnum = 4;
    ehdr.e_shstrndx = 3;

    let null_shdr: Elf64Shdr = unsafe { std::mem::zeroed() };
    let mut stub_shdr = null_shdr;
    stub_shdr.sh_name = 1; // ".text.tangram-stub"
    let mut manifest_shdr = null_shdr;
    manifest_shdr.sh_name = 20; // ".note.tg-manifest"
    let mut strtab_shdr = null_shdr;
    strtab_shdr.sh_name = 38; // ".shstrtab"
    strtab_shdr.sh_type = SHT_STRTAB;
    strtab_shdr.sh_offset = stroff;
    strtab_shdr.sh_size = shstrtab.len() as u64;

    let mut image = Vec::new();
    push_struct(&mut image, &ehdr);
    for phdr in phdrs {
        push_struct(&mut image, phdr);
    }
    for shdr in [&null_shdr, &stub_shdr, &manifest_shdr, &strtab_shdr] {
        push_struct(&mut image, shdr);
    }
    image.extend_from_slice(shstrtab);
    // Payload standing in for the program's own bytes.
    image.extend_from_slice(&[0xaa; 256]);
    image
}

/// A minimal but valid stub ELF; only its header matters to the wrapper.
fn build_stub_elf(entry: u64) -> Vec<u8> {
    let mut ehdr = base_ehdr();
    ehdr.e_entry = entry;
    ehdr.e_phnum = 1;
    let mut image = Vec::new();
    push_struct(&mut image, &ehdr);
    push_struct(&mut image, &load_phdr(0, 0x800, PF_R | PF_X));
    image
}

// ============================================================================
// Fixture plumbing
// ============================================================================

struct Fixture {
    dir: PathBuf,
    input: Vec<u8>,
    stub_elf: Vec<u8>,
    stub_bin: Vec<u8>,
    manifest: Vec<u8>,
}

impl Fixture {
    fn new(name: &str, input: Vec<u8>) -> Fixture {
        let dir = std::env::temp_dir().join(format!("wrap-test-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "executable": { "kind": "path", "value": { "components": [
                { "kind": "string", "value": "/opt/bin/app" },
            ]}},
        })
        .to_string()
        .into_bytes();
        Fixture {
            dir,
            input,
            stub_elf: build_stub_elf(0x1234),
            stub_bin: vec![0x90; 777],
            manifest,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn run(&self) -> Result<Vec<u8>, WrapError> {
        std::fs::write(self.path("input.elf"), &self.input).unwrap();
        std::fs::write(self.path("stub.elf"), &self.stub_elf).unwrap();
        std::fs::write(self.path("stub.bin"), &self.stub_bin).unwrap();
        std::fs::write(self.path("manifest.json"), &self.manifest).unwrap();
        wrap(&WrapRequest {
            arch: Arch::X86_64,
            input: &self.path("input.elf"),
            output: &self.path("output.elf"),
            stub_elf: &self.path("stub.elf"),
            stub_bin: &self.path("stub.bin"),
            manifest: &self.path("manifest.json"),
        })?;
        Ok(std::fs::read(self.path("output.elf")).unwrap())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn output_phdrs(output: &[u8]) -> (Elf64Ehdr, Vec<Elf64Phdr>) {
    let ehdr: Elf64Ehdr = read_struct(output, 0);
    let phdrs = (0..ehdr.e_phnum as usize)
        .map(|i| read_struct(output, ehdr.e_phoff as usize + i * size_of::<Elf64Phdr>()))
        .collect();
    (ehdr, phdrs)
}

fn output_shdr(output: &[u8], index: usize) -> Elf64Shdr {
    let ehdr: Elf64Ehdr = read_struct(output, 0);
    read_struct(output, ehdr.e_shoff as usize + index * size_of::<Elf64Shdr>())
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn wrap_without_interp_grows_the_table_by_one() {
    // Eight segments, four loadable, no PT_INTERP and no PT_PHDR.
    let input = build_input(&[
        load_phdr(0x0000, 0x500, PF_R),
        load_phdr(0x1000, 0xe00, PF_R | PF_X),
        load_phdr(0x2000, 0x800, PF_R),
        load_phdr(0x3000, 0x400, PF_R | PF_W),
        other_phdr(PT_NOTE),
        other_phdr(PT_GNU_EH_FRAME),
        other_phdr(PT_GNU_STACK),
        other_phdr(PT_TLS),
    ]);
    let fixture = Fixture::new("fresh-table", input.clone());
    let output = fixture.run().unwrap();

    // The input file is never mutated in place.
    assert_eq!(std::fs::read(fixture.path("input.elf")).unwrap(), input);
    // The program's own bytes survive unchanged in the output.
    assert_eq!(&output[input.len() - 256..input.len()], &[0xaa; 256]);

    let (ehdr, phdrs) = output_phdrs(&output);
    assert_eq!(phdrs.len(), 9);

    // Loadable segments first and in order, then the stub slot, then the
    // rest.
    for (n, vaddr) in [0x0000u64, 0x1000, 0x2000, 0x3000].iter().enumerate() {
        assert_eq!(phdrs[n].p_type, PT_LOAD);
        assert_eq!(phdrs[n].p_vaddr, *vaddr);
    }
    let stub_segment = &phdrs[4];
    assert_eq!(stub_segment.p_type, PT_LOAD);
    assert_eq!(stub_segment.p_flags, PF_R | PF_X);
    assert_eq!(stub_segment.p_vaddr, align_up(0x3000 + 0x400, 0x1000));
    assert_eq!(stub_segment.p_align, 0x1000);
    assert_eq!(
        stub_segment.p_filesz,
        (fixture.stub_bin.len() + fixture.manifest.len()) as u64
    );
    assert_eq!(stub_segment.p_memsz, align_up(stub_segment.p_filesz, 0x1000));
    for p_type in [PT_NOTE, PT_GNU_EH_FRAME, PT_GNU_STACK, PT_TLS] {
        assert!(phdrs[5..].iter().any(|phdr| phdr.p_type == p_type));
    }

    // Loadable segments are ordered by ascending vaddr with no overlap.
    let loads: Vec<&Elf64Phdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    for pair in loads.windows(2) {
        assert!(pair[0].p_vaddr + pair[0].p_memsz <= pair[1].p_vaddr);
    }

    // The entrypoint lands inside the stub segment.
    assert_eq!(ehdr.e_entry, stub_segment.p_vaddr + 0x1234);

    // The stub payload sits at the segment's file offset.
    let stub_offset = stub_segment.p_offset as usize;
    assert_eq!(
        &output[stub_offset..stub_offset + fixture.stub_bin.len()],
        &fixture.stub_bin[..]
    );

    // Footer: magic, version 0, manifest size; manifest bytes precede it.
    let footer = &output[output.len() - 16..];
    assert_eq!(&footer[0..8], b"tangram\0");
    assert_eq!(u32::from_le_bytes(footer[8..12].try_into().unwrap()), 0);
    let manifest_size = u32::from_le_bytes(footer[12..16].try_into().unwrap()) as usize;
    assert_eq!(manifest_size, fixture.manifest.len());
    let manifest_start = output.len() - 16 - manifest_size;
    assert_eq!(&output[manifest_start..output.len() - 16], &fixture.manifest[..]);
}

#[test]
fn wrap_patches_the_placeholder_sections() {
    let input = build_input(&[load_phdr(0x1000, 0x800, PF_R | PF_X)]);
    let fixture = Fixture::new("sections", input);
    let output = fixture.run().unwrap();
    let (_, phdrs) = output_phdrs(&output);
    let stub_segment = phdrs.iter().find(|p| p.p_flags == (PF_R | PF_X) && p.p_vaddr >= 0x1800).unwrap();

    // Section 1 is .text.tangram-stub, section 2 is .note.tg-manifest.
    let text = output_shdr(&output, 1);
    assert_eq!(text.sh_type, SHT_PROGBITS);
    assert_eq!(text.sh_flags, SHF_ALLOC | SHF_EXECINSTR);
    assert_eq!(text.sh_addr, stub_segment.p_vaddr);
    assert_eq!(text.sh_offset, stub_segment.p_offset);
    assert_eq!(text.sh_size, fixture.stub_bin.len() as u64);

    let note = output_shdr(&output, 2);
    assert_eq!(note.sh_type, SHT_NOTE);
    assert_eq!(note.sh_addr, stub_segment.p_vaddr + fixture.stub_bin.len() as u64);
    assert_eq!(note.sh_offset, stub_segment.p_offset + fixture.stub_bin.len() as u64);
    assert_eq!(note.sh_size, (fixture.manifest.len() + 16) as u64);
}

#[test]
fn wrap_reuses_the_interp_slot() {
    let mut interp = other_phdr(PT_INTERP);
    interp.p_offset = 0x200;
    interp.p_filesz = 28;
    let input = build_input(&[
        load_phdr(0x0000, 0x500, PF_R),
        interp,
        load_phdr(0x1000, 0xe00, PF_R | PF_X),
        other_phdr(PT_GNU_STACK),
    ]);
    let fixture = Fixture::new("interp-slot", input);
    let output = fixture.run().unwrap();
    let (ehdr, phdrs) = output_phdrs(&output);

    // Same header count; the interpreter slot now holds the stub segment.
    assert_eq!(phdrs.len(), 4);
    assert!(phdrs.iter().all(|phdr| phdr.p_type != PT_INTERP));
    let stub_segment = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_LOAD && phdr.p_vaddr == align_up(0x1e00, 0x1000))
        .expect("stub segment");
    assert_eq!(stub_segment.p_flags, PF_R | PF_X);
    assert_eq!(ehdr.e_entry, stub_segment.p_vaddr + 0x1234);

    // In-place tables get their loadable subset sorted by vaddr.
    let loads: Vec<&Elf64Phdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    assert_eq!(loads.len(), 3);
    for pair in loads.windows(2) {
        assert!(pair[0].p_vaddr < pair[1].p_vaddr);
    }
}

#[test]
fn wrap_rejects_multiple_interpreters() {
    let input = build_input(&[
        load_phdr(0x1000, 0x100, PF_R),
        other_phdr(PT_INTERP),
        other_phdr(PT_INTERP),
    ]);
    let fixture = Fixture::new("two-interps", input);
    assert!(matches!(fixture.run(), Err(WrapError::MultipleInterpreters)));
}

#[test]
fn wrap_rejects_pt_phdr_when_rebuilding() {
    let input = build_input(&[load_phdr(0x1000, 0x100, PF_R), other_phdr(PT_PHDR)]);
    let fixture = Fixture::new("pt-phdr", input);
    assert!(matches!(fixture.run(), Err(WrapError::UnexpectedPhdr)));
}

#[test]
fn wrap_rejects_overlapping_load_segments() {
    let input = build_input(&[
        other_phdr(PT_INTERP),
        load_phdr(0x1000, 0x2000, PF_R),
        load_phdr(0x2000, 0x1000, PF_R | PF_X),
    ]);
    let fixture = Fixture::new("overlap", input);
    assert!(matches!(fixture.run(), Err(WrapError::OverlappingLoadSegments)));
}

#[test]
fn wrap_requires_the_placeholder_sections() {
    // An image with sections that do not include the placeholders.
    let phdrs = [load_phdr(0x1000, 0x100, PF_R)];
    let mut image = build_input(&phdrs);
    // Rename the stub section in the string table so lookup fails.
    let name_at = image
        .windows(STUB_SECTION.len())
        .position(|window| window == STUB_SECTION)
        .unwrap();
    image[name_at] = b'X';
    let fixture = Fixture::new("no-placeholder", image);
    assert!(matches!(fixture.run(), Err(WrapError::MissingSection(_))));
}

#[test]
fn wrap_rejects_wrong_machine() {
    let phdrs = [load_phdr(0x1000, 0x100, PF_R)];
    let mut image = build_input(&phdrs);
    // e_machine lives at offset 18.
    image[18] = 183; // EM_AARCH64
    let fixture = Fixture::new("wrong-machine", image);
    assert!(matches!(fixture.run(), Err(WrapError::Elf(_, _))));
}
