//! Per-thread allocator instance and the global placeholder.
//!
//! `LocalAlloc` is a small stand-in for a slab allocator:
//! - Requests up to [`MAX_SMALL_SIZE`] are rounded to a power-of-two class
//!   (which also covers the alignment). Freed blocks go on an intrusive
//!   per-class free list; misses bump-allocate from a [`CHUNK_SIZE`] PAL
//!   reservation.
//! - Larger requests get their own page-rounded mapping, unmapped on free.
//!
//! The placeholder is an ordinary `LocalAlloc` that owns nothing. Its bump
//! window is empty and its free lists stay empty, so the first allocation
//! through it always reaches [`LocalAlloc`]'s slow path, which swaps in the
//! thread's real instance via [`lazy_replacement`]. No flag marks it; only
//! its address does.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use pinmalloc_pal::{DefaultPal, Pal, align_up, default_pal};

use crate::stats::AllocCounters;
use crate::thread_alloc::lazy_replacement;

/// Smallest size class.
pub const MIN_CLASS_SHIFT: u32 = 4;

/// Largest request served from a size class.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Number of small size classes (16 B ..= 32 KiB).
pub const NUM_SIZE_CLASSES: usize = (MAX_SMALL_SIZE.trailing_zeros() - MIN_CLASS_SHIFT + 1) as usize;

/// Size of each bump chunk reserved from the PAL.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Size class for a request, or `None` if it takes the large path.
#[inline]
#[must_use]
pub const fn size_class(size: usize, align: usize) -> Option<usize> {
    let need = if size > align { size } else { align };
    if need > MAX_SMALL_SIZE {
        return None;
    }
    let need = if need < (1 << MIN_CLASS_SHIFT) {
        1 << MIN_CLASS_SHIFT
    } else {
        need
    };
    Some((need.next_power_of_two().trailing_zeros() - MIN_CLASS_SHIFT) as usize)
}

/// Block size of a size class.
#[inline]
#[must_use]
pub const fn class_size(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

/// Mapping length used for a large request.
#[inline]
#[must_use]
pub const fn large_size(size: usize) -> usize {
    align_up(size, <DefaultPal as Pal>::PAGE_SIZE)
}

struct FreeBlock {
    next: *mut FreeBlock,
}

/// An allocator instance, owned by at most one thread slot at a time.
pub struct LocalAlloc {
    id: u32,
    bump: Cell<usize>,
    bump_end: Cell<usize>,
    free_lists: [Cell<*mut FreeBlock>; NUM_SIZE_CLASSES],
    counters: AllocCounters,
    // Pool linkage; only touched with the pool lock held.
    pub(crate) next_free: Cell<*mut LocalAlloc>,
    pub(crate) next_all: Cell<*mut LocalAlloc>,
    pub(crate) in_pool: Cell<bool>,
}

// SAFETY: the `Cell` state is mutated only by the single thread whose slot
// owns the instance, or under the pool lock while no slot owns it. The
// placeholder is never mutated. Counters are atomics.
unsafe impl Sync for LocalAlloc {}
// SAFETY: see above; ownership moves between threads only through the pool.
unsafe impl Send for LocalAlloc {}

/// The process-wide placeholder. Never allocates, never released.
static GLOBAL_PLACEHOLDER: LocalAlloc = LocalAlloc::new(0);

/// Address of the placeholder, the initial value of every thread slot.
#[inline]
#[must_use]
pub const fn placeholder_ptr() -> *mut LocalAlloc {
    ptr::from_ref(&GLOBAL_PLACEHOLDER).cast_mut()
}

/// True if `alloc` is the placeholder.
#[inline]
#[must_use]
pub fn is_placeholder(alloc: *const LocalAlloc) -> bool {
    ptr::eq(alloc, &GLOBAL_PLACEHOLDER)
}

impl LocalAlloc {
    /// An empty instance. Id 0 is reserved for the placeholder.
    pub(crate) const fn new(id: u32) -> Self {
        Self {
            id,
            bump: Cell::new(0),
            bump_end: Cell::new(0),
            free_lists: [const { Cell::new(ptr::null_mut()) }; NUM_SIZE_CLASSES],
            counters: AllocCounters::new(),
            next_free: Cell::new(ptr::null_mut()),
            next_all: Cell::new(ptr::null_mut()),
            in_pool: Cell::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn counters(&self) -> &AllocCounters {
        &self.counters
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns null only for large requests aligned beyond a page.
    #[inline]
    pub fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        match size_class(size, align) {
            Some(class) => self.alloc_small(class).0.as_ptr(),
            None => self.alloc_large(size, align),
        }
    }

    /// Like [`LocalAlloc::alloc`], but the block reads as zero.
    pub fn alloc_zeroed(&self, size: usize, align: usize) -> *mut u8 {
        match size_class(size, align) {
            Some(class) => {
                let (p, recycled) = self.alloc_small(class);
                if recycled {
                    // SAFETY: the block was just popped and is exclusively ours.
                    unsafe { default_pal().zero(p, class_size(class), false) };
                }
                p.as_ptr()
            }
            // Fresh mappings are zero.
            None => self.alloc_large(size, align),
        }
    }

    /// Return a block obtained from any instance's [`LocalAlloc::alloc`].
    ///
    /// # Safety
    ///
    /// `p` must be a live block allocated with the same `size` and `align`.
    pub unsafe fn dealloc(&self, p: *mut u8, size: usize, align: usize) {
        if let Some(real) = lazy_replacement(self) {
            // SAFETY: forwarded caller contract.
            return unsafe { real.dealloc(p, size, align) };
        }
        match size_class(size, align) {
            Some(class) => {
                let block = p.cast::<FreeBlock>();
                let list = &self.free_lists[class];
                // SAFETY: the block is at least 16 bytes, suitably aligned and dead.
                unsafe { block.write(FreeBlock { next: list.get() }) };
                list.set(block);
                AllocCounters::add(&self.counters.bytes_freed, class_size(class) as u64);
            }
            None => {
                let len = large_size(size);
                if let Some(p) = NonNull::new(p) {
                    // SAFETY: large blocks are whole mappings of `len` bytes.
                    unsafe { default_pal().release(p, len) };
                }
                AllocCounters::add(&self.counters.bytes_freed, len as u64);
            }
        }
        AllocCounters::add(&self.counters.deallocs, 1);
    }

    /// Pop or bump a block. The flag is true when it came off a free list.
    #[inline]
    fn alloc_small(&self, class: usize) -> (NonNull<u8>, bool) {
        let list = &self.free_lists[class];
        if let Some(head) = NonNull::new(list.get()) {
            // SAFETY: free-list entries are dead blocks holding a `FreeBlock`.
            list.set(unsafe { head.as_ref().next });
            self.count_alloc(class_size(class));
            return (head.cast(), true);
        }
        let size = class_size(class);
        let start = align_up(self.bump.get(), size);
        if start != 0 && start + size <= self.bump_end.get() {
            self.bump.set(start + size);
            self.count_alloc(size);
            // SAFETY: `start` lies inside a live chunk and is non-zero.
            return (unsafe { NonNull::new_unchecked(start as *mut u8) }, false);
        }
        self.alloc_small_slow(class)
    }

    #[cold]
    #[inline(never)]
    fn alloc_small_slow(&self, class: usize) -> (NonNull<u8>, bool) {
        if let Some(real) = lazy_replacement(self) {
            return real.alloc_small(class);
        }
        let chunk = default_pal().reserve(CHUNK_SIZE);
        AllocCounters::add(&self.counters.chunks_reserved, 1);
        self.bump.set(chunk.as_ptr() as usize);
        self.bump_end.set(chunk.as_ptr() as usize + CHUNK_SIZE);
        self.alloc_small(class)
    }

    #[cold]
    fn alloc_large(&self, size: usize, align: usize) -> *mut u8 {
        if let Some(real) = lazy_replacement(self) {
            return real.alloc_large(size, align);
        }
        if align > <DefaultPal as Pal>::PAGE_SIZE {
            return ptr::null_mut();
        }
        let len = large_size(size);
        let p = default_pal().reserve(len);
        AllocCounters::add(&self.counters.large_mappings, 1);
        self.count_alloc(len);
        p.as_ptr()
    }

    #[inline]
    fn count_alloc(&self, bytes: usize) {
        AllocCounters::add(&self.counters.allocs, 1);
        AllocCounters::add(&self.counters.bytes_allocated, bytes as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_cover_size_and_alignment() {
        assert_eq!(size_class(0, 1), Some(0));
        assert_eq!(size_class(16, 8), Some(0));
        assert_eq!(size_class(17, 8), Some(1));
        assert_eq!(size_class(8, 64), Some(2));
        assert_eq!(size_class(MAX_SMALL_SIZE, 8), Some(NUM_SIZE_CLASSES - 1));
        assert_eq!(size_class(MAX_SMALL_SIZE + 1, 8), None);
        assert_eq!(class_size(NUM_SIZE_CLASSES - 1), MAX_SMALL_SIZE);
    }

    #[test]
    fn placeholder_owns_nothing() {
        let p = unsafe { &*placeholder_ptr() };
        assert_eq!(p.id(), 0);
        assert_eq!(p.bump.get(), 0);
        assert_eq!(p.bump_end.get(), 0);
        assert!(p.free_lists.iter().all(|l| l.get().is_null()));
        assert!(is_placeholder(p));
    }

    #[test]
    fn placeholder_address_is_a_constant() {
        const SLOT_INIT: *mut LocalAlloc = placeholder_ptr();
        assert!(is_placeholder(SLOT_INIT));
        assert_eq!(SLOT_INIT, placeholder_ptr());
    }

    #[test]
    fn private_instance_reuses_freed_blocks() {
        let a = LocalAlloc::new(u32::MAX);
        let p = a.alloc(48, 8);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        unsafe { a.dealloc(p, 48, 8) };
        let q = a.alloc(40, 8);
        assert_eq!(p, q, "same class should pop the freed block");
        let snap = a.counters().snapshot();
        assert_eq!(snap.allocs, 2);
        assert_eq!(snap.deallocs, 1);
        assert_eq!(snap.chunks_reserved, 1);
    }

    #[test]
    fn recycled_block_is_zeroed_on_request() {
        let a = LocalAlloc::new(u32::MAX - 1);
        let p = a.alloc(256, 16);
        unsafe {
            ptr::write_bytes(p, 0xee, 256);
            a.dealloc(p, 256, 16);
        }
        let q = a.alloc_zeroed(256, 16);
        assert_eq!(p, q);
        let bytes = unsafe { core::slice::from_raw_parts(q, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn large_requests_map_and_unmap() {
        let a = LocalAlloc::new(u32::MAX - 2);
        let size = MAX_SMALL_SIZE * 3 + 1;
        let p = a.alloc_zeroed(size, 8);
        assert!(!p.is_null());
        assert_eq!(p as usize % <DefaultPal as Pal>::PAGE_SIZE, 0);
        unsafe {
            assert!(core::slice::from_raw_parts(p, size).iter().all(|&b| b == 0));
            a.dealloc(p, size, 8);
        }
        let snap = a.counters().snapshot();
        assert_eq!(snap.large_mappings, 1);
        assert_eq!(snap.live_bytes(), 0);
    }

    #[test]
    fn over_aligned_large_request_fails_cleanly() {
        let a = LocalAlloc::new(u32::MAX - 3);
        let align = <DefaultPal as Pal>::PAGE_SIZE * 2;
        assert!(a.alloc(MAX_SMALL_SIZE * 2, align).is_null());
    }
}
