//! `GlobalAlloc` front end.
//!
//! Each call loads the thread slot and goes straight to whatever instance it
//! holds. When that is the placeholder, the instance's own slow path performs
//! the lazy replacement, so the common path carries no identity check at
//! all. Only a torn-down (null) slot is diverted here.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use crate::local::{LocalAlloc, large_size, size_class};
use crate::thread_alloc::{ThreadAlloc, ThreadAllocStrategy, lazy_replacement_slow};

/// The pinmalloc global allocator.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: pinmalloc_core::PinMalloc = pinmalloc_core::PinMalloc;
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct PinMalloc;

#[inline]
fn with_current<R>(f: impl FnOnce(&LocalAlloc) -> R) -> R {
    match NonNull::new(ThreadAlloc::get()) {
        // SAFETY: a non-null slot holds the placeholder or this thread's bound
        // instance, both valid for the rest of the call.
        Some(p) => f(unsafe { p.as_ref() }),
        None => {
            let handle = lazy_replacement_slow::<ThreadAlloc>();
            f(&handle)
        }
    }
}

/// True when a resize from `old` to `new_size` can keep the block in place.
fn fits_in_place(old: Layout, new_size: usize) -> bool {
    match (
        size_class(old.size(), old.align()),
        size_class(new_size, old.align()),
    ) {
        (Some(a), Some(b)) => a == b,
        (None, None) => large_size(old.size()) == large_size(new_size),
        _ => false,
    }
}

unsafe impl GlobalAlloc for PinMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        with_current(|a| a.alloc(layout.size(), layout.align()))
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        with_current(|a| a.alloc_zeroed(layout.size(), layout.align()))
    }

    #[inline]
    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        // SAFETY: GlobalAlloc contract: `p` was allocated with `layout`.
        with_current(|a| unsafe { a.dealloc(p, layout.size(), layout.align()) });
    }

    unsafe fn realloc(&self, p: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if fits_in_place(layout, new_size) {
            return p;
        }
        // SAFETY: GlobalAlloc contract guarantees a valid size/align pair.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        // SAFETY: forwarded.
        let q = unsafe { self.alloc(new_layout) };
        if !q.is_null() {
            // SAFETY: both blocks are live and distinct.
            unsafe {
                ptr::copy_nonoverlapping(p, q, layout.size().min(new_size));
                self.dealloc(p, layout);
            }
        }
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MAX_SMALL_SIZE;
    use std::thread;

    #[test]
    fn in_place_resize_rules() {
        let small = Layout::from_size_align(40, 8).unwrap();
        assert!(fits_in_place(small, 64));
        assert!(!fits_in_place(small, 65));
        let large = Layout::from_size_align(MAX_SMALL_SIZE + 1, 8).unwrap();
        assert!(fits_in_place(large, MAX_SMALL_SIZE + 100));
        assert!(!fits_in_place(large, MAX_SMALL_SIZE));
    }

    #[test]
    fn alloc_write_realloc_free() {
        thread::spawn(|| unsafe {
            let layout = Layout::from_size_align(24, 8).unwrap();
            let p = PinMalloc.alloc(layout);
            assert!(!p.is_null());
            for i in 0..24 {
                p.add(i).write(i as u8);
            }
            let q = PinMalloc.realloc(p, layout, 1000);
            assert!(!q.is_null());
            for i in 0..24 {
                assert_eq!(q.add(i).read(), i as u8);
            }
            PinMalloc.dealloc(q, Layout::from_size_align(1000, 8).unwrap());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn alloc_zeroed_after_dirty_free() {
        thread::spawn(|| unsafe {
            let layout = Layout::from_size_align(512, 16).unwrap();
            let p = PinMalloc.alloc(layout);
            ptr::write_bytes(p, 0xcd, 512);
            PinMalloc.dealloc(p, layout);
            let q = PinMalloc.alloc_zeroed(layout);
            assert_eq!(p, q);
            assert!(core::slice::from_raw_parts(q, 512).iter().all(|&b| b == 0));
            PinMalloc.dealloc(q, layout);
        })
        .join()
        .unwrap();
    }
}
