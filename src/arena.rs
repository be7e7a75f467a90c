//! Quota arena: one fixed, page-rounded anonymous mapping that backs every
//! interpreter allocation.
//!
//! The region is carved up by `dlmalloc`. The system allocator handed to
//! `dlmalloc` gives out the mapping exactly once and refuses every later
//! request, so the footprint can never grow past the requested capacity.

use std::cell::Cell;
use std::ptr::{self, NonNull};

use dlmalloc::{Allocator, Dlmalloc};

use crate::error::{Fatal, StatusCode};

/// One kibibyte
pub const KIB: usize = 1024;
/// One mebibyte
pub const MIB: usize = 1024 * KIB;

/// Smallest accepted capacity, after page rounding
pub const CAPACITY_MIN: usize = 256 * KIB;
/// Largest accepted capacity, after page rounding
pub const CAPACITY_MAX: usize = 256 * MIB;

/// Alignment of every block handed out; covers any Lua object.
pub const ALIGN: usize = 16;

/// `dlmalloc` flag: segment is owned by the caller, never unmap or merge it.
const EXTERN_SEGMENT: u32 = 1;

/// Diagnostic snapshot of arena occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    /// Page-rounded capacity of the mapping
    pub arena_size: usize,
    /// Bytes currently allocated to callers
    pub used: usize,
    /// `arena_size - used`
    pub free: usize,
}

/// The mapping as seen by `dlmalloc`.
struct Region {
    base: *mut u8,
    size: usize,
    page_size: usize,
    handed_out: Cell<bool>,
}

// SAFETY: the region is only ever touched from the thread owning the arena.
unsafe impl Send for Region {}

// SAFETY: the single segment we return is a live, writable mapping of `size`
// bytes that outlives the `Dlmalloc` instance (it is unmapped in
// `Arena::drop`, after which `dlmalloc` is never used again).
unsafe impl Allocator for Region {
    fn alloc(&self, size: usize) -> (*mut u8, usize, u32) {
        if self.handed_out.get() || size > self.size {
            return (ptr::null_mut(), 0, 0);
        }
        self.handed_out.set(true);
        (self.base, self.size, EXTERN_SEGMENT)
    }

    fn remap(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize, _can_move: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize) -> bool {
        false
    }

    fn free(&self, _ptr: *mut u8, _size: usize) -> bool {
        false
    }

    fn can_release_part(&self, _flags: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Fixed-capacity memory region with malloc-style operations.
///
/// Dropping the arena unmaps the region; ownership guarantees this happens
/// exactly once. Every pointer handed out becomes dangling at that point.
pub struct Arena {
    heap: Dlmalloc<Region>,
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl Arena {
    /// Map a new arena of at least `requested` bytes.
    ///
    /// # Errors
    /// `bad_capacity` when the page-rounded size falls outside
    /// [`CAPACITY_MIN`]..=[`CAPACITY_MAX`], `mmap_failed` when the mapping
    /// cannot be reserved.
    pub fn new(requested: usize) -> Result<Self, Fatal> {
        let page_size = page_size();
        let capacity = round_to_page(requested, page_size).ok_or(Fatal(StatusCode::BadCapacity))?;
        if !(CAPACITY_MIN..=CAPACITY_MAX).contains(&capacity) {
            return Err(Fatal(StatusCode::BadCapacity));
        }

        // SAFETY: anonymous private mapping with no address hint.
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(Fatal(StatusCode::MmapFailed));
        }
        let base = NonNull::new(mapped.cast::<u8>()).ok_or(Fatal(StatusCode::MmapFailed))?;

        let region = Region {
            base: base.as_ptr(),
            size: capacity,
            page_size,
            handed_out: Cell::new(false),
        };

        Ok(Self {
            heap: Dlmalloc::new_with_allocator(region),
            base,
            capacity,
            used: 0,
        })
    }

    /// Page-rounded capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy
    #[must_use]
    pub const fn usage(&self) -> Usage {
        Usage {
            arena_size: self.capacity,
            used: self.used,
            free: self.capacity - self.used,
        }
    }

    /// Whether `ptr` points into the mapping
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.capacity
    }

    /// Allocate `size` bytes aligned to [`ALIGN`]. `None` when the arena is
    /// exhausted; the arena never grows.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: ALIGN is a power of two no larger than dlmalloc's own
        // alignment, so this is a plain malloc.
        let block = NonNull::new(unsafe { self.heap.malloc(size, ALIGN) })?;
        self.used += size;
        Some(block)
    }

    /// Resize a block. On `None` the original block is untouched.
    ///
    /// # Safety
    /// `block` must come from this arena and currently hold `old_size` bytes.
    pub unsafe fn reallocate(
        &mut self,
        block: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let moved = NonNull::new(self.heap.realloc(block.as_ptr(), old_size, ALIGN, new_size))?;
        self.used = self.used.saturating_sub(old_size) + new_size;
        Some(moved)
    }

    /// Return a block to the arena.
    ///
    /// # Safety
    /// `block` must come from this arena, hold `size` bytes and not be used
    /// afterwards.
    pub unsafe fn free(&mut self, block: NonNull<u8>, size: usize) {
        self.heap.free(block.as_ptr(), size, ALIGN);
        self.used = self.used.saturating_sub(size);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.capacity);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|s| s.is_power_of_two()).unwrap_or(4 * KIB)
}

/// Round `size` up to a multiple of `page` (a power of two).
fn round_to_page(size: usize, page: usize) -> Option<usize> {
    let mask = page - 1;
    size.checked_add(mask).map(|s| s & !mask)
}
