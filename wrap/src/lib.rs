//! ELF64 wrapper.
//!
//! Transforms an input executable into a self-wrapping one: the stub's code
//! is appended as a new `PT_LOAD` segment, the manifest rides along in a
//! note section, and the entrypoint is redirected into the stub. The
//! original loadable segments are preserved byte for byte; the input file is
//! never modified.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::{debug, trace};

use tg_elf::{
    Arch, Elf64Ehdr, Elf64Phdr, Elf64Shdr, ElfError, Footer, PF_R, PF_X, PT_INTERP, PT_LOAD,
    PT_PHDR, SHF_ALLOC, SHF_EXECINSTR, SHN_XINDEX, SHT_NOTE, SHT_PROGBITS, align_up, p_type_name,
};

/// Section carrying the stub's code in the input image.
pub const STUB_SECTION: &[u8] = b".text.tangram-stub";

/// Section carrying the manifest and footer.
pub const MANIFEST_SECTION: &[u8] = b".note.tg-manifest";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum WrapError {
    Io(&'static str, std::io::Error),
    Elf(&'static str, ElfError),
    Truncated(&'static str),
    MultipleInterpreters,
    /// Rebuilding the program header table assumes the input has no
    /// `PT_PHDR` to keep consistent.
    UnexpectedPhdr,
    MissingSection(&'static str),
    OverlappingLoadSegments,
}

impl fmt::Display for WrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WrapError::Io(what, err) => write!(f, "{what}: {err}"),
            WrapError::Elf(what, err) => write!(f, "{what}: {err:?}"),
            WrapError::Truncated(what) => write!(f, "{what}: truncated ELF image"),
            WrapError::MultipleInterpreters => write!(f, "multiple interpreters found"),
            WrapError::UnexpectedPhdr => write!(f, "unexpected PT_PHDR"),
            WrapError::MissingSection(name) => write!(f, "missing section {name}"),
            WrapError::OverlappingLoadSegments => write!(f, "invalid program headers"),
        }
    }
}

impl std::error::Error for WrapError {}

fn io_err(what: &'static str) -> impl FnOnce(std::io::Error) -> WrapError {
    move |err| WrapError::Io(what, err)
}

// ============================================================================
// Memory-mapped files
// ============================================================================

/// A `MAP_SHARED` view of a file. Writes land in the file; the mapping is
/// released on drop.
struct Mmap {
    ptr: *mut u8,
    len: usize,
}

impl Mmap {
    fn map(file: &File, len: usize, writable: bool) -> Result<Mmap, WrapError> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(WrapError::Io("mmap", std::io::Error::last_os_error()));
        }
        Ok(Mmap {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// ============================================================================
// Raw struct access
// ============================================================================

/// Read a `#[repr(C)]` record at `offset`. Unaligned offsets are legal in
/// ELF files, so this goes through `read_unaligned`.
fn read_at<T: Copy>(data: &[u8], offset: u64, what: &'static str) -> Result<T, WrapError> {
    let offset = offset as usize;
    let end = offset.checked_add(size_of::<T>()).ok_or(WrapError::Truncated(what))?;
    if end > data.len() {
        return Err(WrapError::Truncated(what));
    }
    Ok(unsafe { (data.as_ptr().add(offset) as *const T).read_unaligned() })
}

fn write_at<T: Copy>(data: &mut [u8], offset: u64, value: &T, what: &'static str) -> Result<(), WrapError> {
    let offset = offset as usize;
    let end = offset.checked_add(size_of::<T>()).ok_or(WrapError::Truncated(what))?;
    if end > data.len() {
        return Err(WrapError::Truncated(what));
    }
    unsafe { (data.as_mut_ptr().add(offset) as *mut T).write_unaligned(*value) };
    Ok(())
}

fn structs_bytes<T: Copy>(values: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(values.as_ptr() as *const u8, std::mem::size_of_val(values))
    }
}

// ============================================================================
// ELF image view
// ============================================================================

/// A parsed view over a mapped ELF image. Header records are copied out on
/// read and written back explicitly, so unaligned tables are fine.
struct ElfImage {
    map: Mmap,
    ehdr: Elf64Ehdr,
}

impl ElfImage {
    fn parse(map: Mmap, machine: u16, what: &'static str) -> Result<ElfImage, WrapError> {
        let ehdr: Elf64Ehdr = read_at(map.bytes(), 0, what)?;
        ehdr.validate_for_machine(machine)
            .map_err(|err| WrapError::Elf(what, err))?;
        Ok(ElfImage { map, ehdr })
    }

    fn phdr(&self, index: usize) -> Result<Elf64Phdr, WrapError> {
        read_at(
            self.map.bytes(),
            self.ehdr.e_phoff + (index * size_of::<Elf64Phdr>()) as u64,
            "program header",
        )
    }

    fn set_phdr(&mut self, index: usize, phdr: &Elf64Phdr) -> Result<(), WrapError> {
        let offset = self.ehdr.e_phoff + (index * size_of::<Elf64Phdr>()) as u64;
        write_at(self.map.bytes_mut(), offset, phdr, "program header")
    }

    fn phnum(&self) -> usize {
        self.ehdr.e_phnum as usize
    }

    /// Section count, honoring the large-count escape in section 0.
    fn shnum(&self) -> Result<usize, WrapError> {
        if self.ehdr.e_shnum != 0 {
            return Ok(self.ehdr.e_shnum as usize);
        }
        if self.ehdr.e_shoff == 0 {
            return Ok(0);
        }
        Ok(self.shdr(0)?.sh_size as usize)
    }

    /// Section name table index, honoring `SHN_XINDEX`.
    fn shstrndx(&self) -> Result<usize, WrapError> {
        if self.ehdr.e_shstrndx == SHN_XINDEX {
            return Ok(self.shdr(0)?.sh_link as usize);
        }
        Ok(self.ehdr.e_shstrndx as usize)
    }

    fn shdr(&self, index: usize) -> Result<Elf64Shdr, WrapError> {
        read_at(
            self.map.bytes(),
            self.ehdr.e_shoff + (index * size_of::<Elf64Shdr>()) as u64,
            "section header",
        )
    }

    fn set_shdr(&mut self, index: usize, shdr: &Elf64Shdr) -> Result<(), WrapError> {
        let offset = self.ehdr.e_shoff + (index * size_of::<Elf64Shdr>()) as u64;
        write_at(self.map.bytes_mut(), offset, shdr, "section header")
    }

    /// Find a section by name through the section header string table.
    fn find_section(&self, name: &[u8]) -> Result<Option<usize>, WrapError> {
        if self.ehdr.e_shoff == 0 {
            return Ok(None);
        }
        let strtab = self.shdr(self.shstrndx()?)?;
        for index in 0..self.shnum()? {
            let shdr = self.shdr(index)?;
            let start = strtab.sh_offset + shdr.sh_name as u64;
            let bytes = self.map.bytes();
            let mut end = start as usize;
            while end < bytes.len() && bytes[end] != 0 {
                end += 1;
            }
            if end > bytes.len() {
                return Err(WrapError::Truncated("section name"));
            }
            if &bytes[start as usize..end] == name {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Flush the (possibly modified) file header back to the image.
    fn write_ehdr(&mut self) -> Result<(), WrapError> {
        let ehdr = self.ehdr;
        write_at(self.map.bytes_mut(), 0, &ehdr, "elf header")
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// What the wrapper needs to know about the output image before splicing.
struct Analysis {
    pt_interp: Option<usize>,
    max_vaddr: u64,
    max_align: u64,
}

fn analyze(elf: &ElfImage) -> Result<Analysis, WrapError> {
    let mut analysis = Analysis {
        pt_interp: None,
        max_vaddr: 0,
        max_align: 0,
    };
    for index in 0..elf.phnum() {
        let phdr = elf.phdr(index)?;
        if phdr.p_type == PT_LOAD {
            let end_of_segment = phdr.p_vaddr + phdr.p_memsz;
            trace!(
                "phdr[{index}] {} vaddr:{:x} memsz:{:x} end:{end_of_segment:x}",
                p_type_name(phdr.p_type),
                phdr.p_vaddr,
                phdr.p_memsz
            );
            analysis.max_vaddr = analysis.max_vaddr.max(end_of_segment);
            analysis.max_align = analysis.max_align.max(phdr.p_align);
        }
        if phdr.p_type == PT_INTERP {
            if analysis.pt_interp.is_some() {
                return Err(WrapError::MultipleInterpreters);
            }
            analysis.pt_interp = Some(index);
        }
    }

    // A segment-less input would leave the stub segment unaligned.
    if analysis.max_align == 0 {
        analysis.max_align = 1;
    }
    debug!(
        "analysis: pt_interp:{:?} max_vaddr:{:x} max_align:{:x}",
        analysis.pt_interp, analysis.max_vaddr, analysis.max_align
    );
    Ok(analysis)
}

/// Bubble-sort the LOAD subset of the in-place program header table by
/// `p_vaddr`, then reject any overlapping pair.
fn sort_load_segments(elf: &mut ElfImage) -> Result<(), WrapError> {
    let mut load_indices = Vec::new();
    for index in 0..elf.phnum() {
        if elf.phdr(index)?.p_type == PT_LOAD {
            load_indices.push(index);
        }
    }

    loop {
        let mut swapped = false;
        for pair in 0..load_indices.len().saturating_sub(1) {
            let a = elf.phdr(load_indices[pair])?;
            let b = elf.phdr(load_indices[pair + 1])?;
            let a_end = a.p_vaddr + a.p_memsz;
            if b.p_vaddr >= a.p_vaddr && b.p_vaddr < a_end {
                return Err(WrapError::OverlappingLoadSegments);
            }
            if a_end > b.p_vaddr {
                trace!("swap phdr[{}], phdr[{}]", load_indices[pair], load_indices[pair + 1]);
                elf.set_phdr(load_indices[pair], &b)?;
                elf.set_phdr(load_indices[pair + 1], &a)?;
                swapped = true;
            }
        }
        if !swapped {
            break;
        }
    }
    Ok(())
}

// ============================================================================
// The wrap pipeline
// ============================================================================

/// A freshly built program header table destined for the end of the file.
struct NewHeaders {
    offset: u64,
    table: Vec<Elf64Phdr>,
    /// Index of the stub's slot within `table`.
    stub_slot: usize,
}

pub struct WrapRequest<'a> {
    pub arch: Arch,
    pub input: &'a Path,
    pub output: &'a Path,
    pub stub_elf: &'a Path,
    pub stub_bin: &'a Path,
    pub manifest: &'a Path,
}

pub fn wrap(request: &WrapRequest<'_>) -> Result<(), WrapError> {
    // Copy the input byte for byte; all edits happen on the copy.
    std::fs::copy(request.input, request.output).map_err(io_err("failed to copy input"))?;
    debug!("copied {} to {}", request.input.display(), request.output.display());

    let stub_bin = std::fs::read(request.stub_bin).map_err(io_err("failed to read stub binary"))?;
    let manifest = std::fs::read(request.manifest).map_err(io_err("failed to read manifest"))?;

    let output_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(request.output)
        .map_err(io_err("failed to open output"))?;
    let output_size = output_file
        .metadata()
        .map_err(io_err("failed to stat output"))?
        .len();

    let machine = request.arch.e_machine();
    let mut output = ElfImage::parse(
        Mmap::map(&output_file, output_size as usize, true)?,
        machine,
        "output",
    )?;
    debug!("parsed {}", request.output.display());

    let stub_file = File::open(request.stub_elf).map_err(io_err("failed to open stub"))?;
    let stub_size = stub_file
        .metadata()
        .map_err(io_err("failed to stat stub"))?
        .len();
    let stub_elf = ElfImage::parse(
        Mmap::map(&stub_file, stub_size as usize, false)?,
        machine,
        "stub",
    )?;
    debug!("parsed {}", request.stub_elf.display());

    // Scan the output for its PT_INTERP and the loadable address ceiling.
    let analysis = analyze(&output)?;

    // Locate the two sections the splice patches.
    let stub_section = output
        .find_section(STUB_SECTION)?
        .ok_or(WrapError::MissingSection(".text.tangram-stub"))?;
    let manifest_section = output
        .find_section(MANIFEST_SECTION)?
        .ok_or(WrapError::MissingSection(".note.tg-manifest"))?;

    // With no PT_INTERP to reuse, build a fresh program header table:
    // loadable segments in order, then the stub slot, then the rest.
    let mut new_headers: Option<NewHeaders> = None;
    if analysis.pt_interp.is_none() {
        let mut table = Vec::with_capacity(output.phnum() + 1);
        for index in 0..output.phnum() {
            let phdr = output.phdr(index)?;
            if phdr.p_type == PT_PHDR {
                return Err(WrapError::UnexpectedPhdr);
            }
            if phdr.p_type == PT_LOAD {
                table.push(phdr);
            }
        }
        let stub_slot = table.len();
        table.push(Elf64Phdr::zeroed());
        for index in 0..output.phnum() {
            let phdr = output.phdr(index)?;
            if phdr.p_type != PT_LOAD {
                table.push(phdr);
            }
        }
        new_headers = Some(NewHeaders {
            offset: align_up(output_size, 64),
            table,
            stub_slot,
        });
        debug!("created new program headers");
    }

    // Place the stub payload past everything else in the file.
    let stub_offset = match &new_headers {
        Some(headers) => align_up(
            headers.offset + (headers.table.len() * size_of::<Elf64Phdr>()) as u64,
            analysis.max_align,
        ),
        None => align_up(output_size, analysis.max_align),
    };

    // The stub segment covers the raw stub binary and the manifest; the
    // footer trails outside of it.
    let mut stub_segment = Elf64Phdr::zeroed();
    stub_segment.p_type = PT_LOAD;
    stub_segment.p_flags = PF_R | PF_X;
    stub_segment.p_align = analysis.max_align;
    stub_segment.p_offset = stub_offset;
    stub_segment.p_vaddr = align_up(analysis.max_vaddr, analysis.max_align);
    stub_segment.p_paddr = stub_segment.p_vaddr;
    stub_segment.p_filesz = (stub_bin.len() + manifest.len()) as u64;
    stub_segment.p_memsz = align_up(stub_segment.p_filesz, analysis.max_align);
    debug!(
        "new segment offset: {stub_offset:x}, vaddr: {:x}, memsz: {:x}",
        stub_segment.p_vaddr, stub_segment.p_memsz
    );

    match &mut new_headers {
        Some(headers) => headers.table[headers.stub_slot] = stub_segment,
        // Reuse the PT_INTERP slot for the stub's LOAD segment.
        None => output.set_phdr(analysis.pt_interp.unwrap(), &stub_segment)?,
    }

    // Patch the stub and manifest sections to describe the new segment.
    let mut text = output.shdr(stub_section)?;
    text.sh_type = SHT_PROGBITS;
    text.sh_flags = SHF_ALLOC | SHF_EXECINSTR;
    text.sh_addr = stub_segment.p_vaddr;
    text.sh_offset = stub_offset;
    text.sh_size = stub_bin.len() as u64;
    text.sh_addralign = 16;
    output.set_shdr(stub_section, &text)?;

    let mut note = output.shdr(manifest_section)?;
    note.sh_type = SHT_NOTE;
    note.sh_flags = SHF_ALLOC;
    note.sh_addr = stub_segment.p_vaddr + stub_bin.len() as u64;
    note.sh_offset = stub_offset + stub_bin.len() as u64;
    note.sh_size = (manifest.len() + size_of::<Footer>()) as u64;
    note.sh_addralign = 1;
    output.set_shdr(manifest_section, &note)?;

    // Redirect the entrypoint into the stub.
    debug!("stub entrypoint: {:x}", stub_elf.ehdr.e_entry);
    output.ehdr.e_entry = stub_segment.p_vaddr + stub_elf.ehdr.e_entry;

    match &new_headers {
        Some(headers) => {
            output.ehdr.e_phoff = headers.offset;
            output.ehdr.e_phnum = headers.table.len() as u16;
        }
        None => sort_load_segments(&mut output)?,
    }
    output.write_ehdr()?;

    // Release the mappings before the file grows.
    drop(output);
    drop(stub_elf);

    // Append the new program header table if necessary.
    let mut output_file = output_file;
    if let Some(headers) = &new_headers {
        output_file
            .set_len(headers.offset)
            .map_err(io_err("failed to resize output"))?;
        output_file
            .seek(SeekFrom::Start(headers.offset))
            .map_err(io_err("failed to seek output"))?;
        output_file
            .write_all(structs_bytes(&headers.table))
            .map_err(io_err("failed to write new program headers"))?;
        debug!("appended new program header table");
    }

    // Lay down the payload: stub, manifest, footer.
    output_file
        .set_len(stub_offset)
        .map_err(io_err("failed to resize output"))?;
    output_file
        .seek(SeekFrom::End(0))
        .map_err(io_err("failed to seek output"))?;
    output_file
        .write_all(&stub_bin)
        .map_err(io_err("failed to append stub"))?;
    debug!("appended stub to binary");
    output_file
        .write_all(&manifest)
        .map_err(io_err("failed to append manifest"))?;
    debug!("appended manifest to binary");

    let footer = Footer::new(manifest.len() as u32);
    output_file
        .write_all(&footer.encode())
        .map_err(io_err("failed to append footer"))?;
    debug!("appended footer to binary");

    Ok(())
}
