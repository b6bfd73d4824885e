//! Extremely minimal arena allocator.
//!
//! The stub runs without a heap, so every transient structure it builds
//! (parsed manifest, rendered strings, rebuilt program headers) lives in one
//! of these arenas. An arena is a chain of anonymous page-aligned mappings
//! with a bump offset; individual allocations are never freed, the whole
//! chain is unmapped at once when the arena is dropped.
//!
//! Invariants:
//! - allocations never cross a segment boundary;
//! - every returned pointer is aligned to the requested alignment;
//! - callers pass `size % align == 0` (violations are fatal);
//! - exhausting the 1 GiB cap is fatal.

#![cfg_attr(not(test), no_std)]

use core::cell::Cell;
use core::ffi::CStr;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use core::slice;

use tg_syscall as sys;

/// Number of pages per segment in the arena.
pub const DEFAULT_NUM_PAGES: usize = 16;

/// Soft cap on the total mapped size (1 GiB). Blowing past this indicates a
/// runaway manifest, not a legitimate workload.
const MAX_BYTES: usize = 1 << 30;

/// Chain link at the head of every mapping. The usable memory follows the
/// header inside the same mapping.
#[repr(C)]
struct Segment {
    /// Bump offset from the segment base; starts past this header.
    offset: usize,
    /// Total mapped length of the segment, a multiple of the page size.
    length: usize,
    /// Older segments; allocation only ever touches the head.
    next: *mut Segment,
}

/// Helper to align `m` up to `n` (a power of two).
#[inline]
const fn align_up(m: usize, n: usize) -> usize {
    (m + n - 1) & !(n - 1)
}

#[derive(Debug)]
pub struct Arena {
    head: Cell<*mut Segment>,
    page_size: usize,
    mapped: Cell<usize>,
}

impl Arena {
    /// Create an arena and map its first segment.
    pub fn new(page_size: usize) -> Arena {
        assert!(page_size.is_power_of_two(), "invalid page size");
        let arena = Arena {
            head: Cell::new(core::ptr::null_mut()),
            page_size,
            mapped: Cell::new(0),
        };
        arena.add_segment(DEFAULT_NUM_PAGES);
        arena
    }

    /// Bump-allocate `size` bytes at `align`. Never returns null; all
    /// failures are fatal.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        assert!(align.is_power_of_two(), "invalid alignment");
        assert!(size % align == 0, "misaligned allocation");

        let head = self.head.get();
        let (mut start, mut end) = unsafe {
            let offset = align_up((*head).offset, align);
            (offset, offset + size)
        };

        // Out of space: chain a new segment sized for the request.
        if end > unsafe { (*head).length } {
            let min_size = align_up(align_up(size_of::<Segment>(), align) + size, self.page_size);
            let min_pages = min_size / self.page_size;
            self.add_segment(min_pages.max(DEFAULT_NUM_PAGES));
            let head = self.head.get();
            start = align_up(unsafe { (*head).offset }, align);
            end = start + size;
            assert!(end <= unsafe { (*head).length }, "allocation exceeds segment");
        }

        let head = self.head.get();
        unsafe {
            (*head).offset = end;
            NonNull::new_unchecked((head as *mut u8).add(start))
        }
    }

    /// Move `value` into the arena.
    pub fn alloc_value<T>(&self, value: T) -> &mut T {
        let size = align_up(size_of::<T>(), align_of::<T>());
        let ptr = self.alloc(size, align_of::<T>()).as_ptr() as *mut T;
        unsafe {
            ptr.write(value);
            &mut *ptr
        }
    }

    /// Allocate a slice of `len` copies of `value`.
    pub fn alloc_slice_fill_copy<T: Copy>(&self, len: usize, value: T) -> &mut [T] {
        let size = align_up(len * size_of::<T>(), align_of::<T>());
        let ptr = self.alloc(size, align_of::<T>()).as_ptr() as *mut T;
        unsafe {
            for i in 0..len {
                ptr.add(i).write(value);
            }
            slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Allocate a slice of `len` elements produced by `fill`.
    pub fn alloc_slice_fill_with<T>(&self, len: usize, mut fill: impl FnMut() -> T) -> &mut [T] {
        let size = align_up(len * size_of::<T>(), align_of::<T>());
        let ptr = self.alloc(size, align_of::<T>()).as_ptr() as *mut T;
        unsafe {
            for i in 0..len {
                ptr.add(i).write(fill());
            }
            slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Copy `src` into the arena.
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        let size = align_up(src.len() * size_of::<T>(), align_of::<T>());
        let ptr = self.alloc(size, align_of::<T>()).as_ptr() as *mut T;
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
            slice::from_raw_parts_mut(ptr, src.len())
        }
    }

    /// Copy `bytes` into the arena.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> &mut [u8] {
        self.alloc_slice_copy(bytes)
    }

    /// Materialize a C-string view of `bytes` by copying them into the arena
    /// with a trailing null.
    pub fn alloc_cstr(&self, bytes: &[u8]) -> &CStr {
        let dst = self.alloc_slice_fill_copy(bytes.len() + 1, 0u8);
        dst[..bytes.len()].copy_from_slice(bytes);
        unsafe { CStr::from_bytes_with_nul_unchecked(&dst[..bytes.len() + 1]) }
    }

    fn add_segment(&self, num_pages: usize) {
        assert!(num_pages != 0, "invalid segment size");
        let length = num_pages * self.page_size;

        self.mapped.set(self.mapped.get() + length);
        assert!(self.mapped.get() < MAX_BYTES, "arena out of memory");

        let base = unsafe {
            sys::mmap(
                core::ptr::null_mut(),
                length,
                sys::Prot::READ | sys::Prot::WRITE,
                sys::Map::ANONYMOUS | sys::Map::PRIVATE,
                -1,
                0,
            )
        }
        .expect("mmap failed");

        let segment = base.as_ptr() as *mut Segment;
        unsafe {
            (*segment).offset = size_of::<Segment>();
            (*segment).length = length;
            (*segment).next = self.head.get();
        }
        self.head.set(segment);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let mut current = self.head.get();
        while !current.is_null() {
            let (next, length) = unsafe { ((*current).next, (*current).length) };

            // A length that is not page-sized means the header was stomped.
            assert!(length % self.page_size == 0, "corrupted segment");
            unsafe {
                sys::munmap(current as *mut u8, length).expect("munmap failed");
            }
            current = next;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
