//! XNU (macOS, iOS, watchOS, tvOS) PAL.
//!
//! Behaves like [`PalBsd`] except for two operations:
//!
//! - `reserve` tags each anonymous mapping so `vmmap` and friends can tell
//!   pinmalloc regions apart from other mappings in the process.
//! - `zero` replaces ranges aligned to the kernel's page size with a fresh
//!   anonymous mapping at the same address (`MAP_FIXED`), which drops the old physical pages instead of
//!   writing to them. Anything else, or a failed remap, falls back to a byte
//!   fill.
//!
//! The tag carries no meaning for the allocator. The variant builds on every
//! Unix target. Linux ignores the fd argument of anonymous mappings, so the tag
//! is passed there too; other kernels insist on `-1` and get that instead.

use core::ffi::c_int;
use core::ptr::{self, NonNull};

use crate::bsd::{PalBsd, map_anonymous};
use crate::error::PalError;
use crate::{Pal, PalFeatures, is_aligned_block};

/// Darwin's `VM_MAKE_TAG`: the tag lives in the top byte of the fd argument.
#[must_use]
pub const fn vm_make_tag(tag: u8) -> c_int {
    ((tag as u32) << 24) as c_int
}

/// Tag number for pinmalloc mappings.
///
/// 240..=255 are reserved for applications; LLVM sanitizers already use 99.
pub const VM_TAG_PINMALLOC: u8 = 241;

#[cfg(any(target_vendor = "apple", target_os = "linux", target_os = "android"))]
const ANON_FD: c_int = vm_make_tag(VM_TAG_PINMALLOC);

#[cfg(not(any(target_vendor = "apple", target_os = "linux", target_os = "android")))]
const ANON_FD: c_int = -1;

/// True when a fixed remap of `[p, p + size)` replaces exactly that range.
///
/// The kernel rounds a fixed mapping out to whole pages of its own size, so
/// both ends must sit on `kernel_page`, which may exceed [`Pal::PAGE_SIZE`].
fn remap_covers_exactly(p: *const u8, size: usize, kernel_page: usize) -> bool {
    size != 0 && is_aligned_block(p, size, kernel_page)
}

/// XNU platform.
#[derive(Debug, Clone, Copy)]
pub struct PalApple {
    base: PalBsd,
    anon_tag: c_int,
}

impl PalApple {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: PalBsd::new(),
            anon_tag: ANON_FD,
        }
    }

    /// The fd-encoded tag passed with every anonymous mapping.
    #[must_use]
    pub const fn anon_tag(&self) -> c_int {
        self.anon_tag
    }
}

impl Default for PalApple {
    fn default() -> Self {
        Self::new()
    }
}

impl Pal for PalApple {
    const FEATURES: PalFeatures = PalBsd::FEATURES.union(PalFeatures::FIXED_REMAP_ZERO);

    #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
    const PAGE_SIZE: usize = 0x4000;

    #[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
    const PAGE_SIZE: usize = crate::OS_PAGE_SIZE;

    fn try_reserve(&self, size: usize) -> Result<NonNull<u8>, PalError> {
        map_anonymous(ptr::null_mut(), size, 0, self.anon_tag)
            .map_err(|errno| PalError::OutOfMemory { size, errno })
    }

    unsafe fn zero(&self, p: NonNull<u8>, size: usize, page_aligned: bool) {
        debug_assert!(!page_aligned || is_aligned_block(p.as_ptr(), size, Self::PAGE_SIZE));
        if remap_covers_exactly(p.as_ptr(), size, self.page_size())
            && map_anonymous(p.as_ptr().cast(), size, libc::MAP_FIXED, self.anon_tag).is_ok()
        {
            return;
        }
        // SAFETY: caller owns the writable range.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
    }

    unsafe fn try_release(&self, p: NonNull<u8>, size: usize) -> Result<(), PalError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.base.try_release(p, size) }
    }

    unsafe fn notify_not_using(&self, p: NonNull<u8>, size: usize) -> Result<(), PalError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.base.notify_not_using(p, size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_encoding_matches_vm_make_tag() {
        assert_eq!(vm_make_tag(241), 241 << 24);
        assert_eq!(PalApple::new().anon_tag(), ANON_FD);
    }

    #[test]
    fn remap_requires_whole_kernel_pages() {
        let base = 0x10000 as *const u8;
        assert!(remap_covers_exactly(base, 0x1000, 0x1000));
        // 4 KiB-aligned ranges on a 64 KiB-page kernel take the fill path.
        assert!(!remap_covers_exactly(base, 0x1000, 0x10000));
        assert!(!remap_covers_exactly(base.wrapping_add(0x1000), 0x10000, 0x10000));
        assert!(remap_covers_exactly(base, 0x20000, 0x10000));
        assert!(!remap_covers_exactly(base, 0, 0x1000));
    }

    #[test]
    fn zero_of_a_sub_kernel_page_range_spares_the_rest() {
        let pal = PalApple::new();
        let page = pal.page_size();
        let p = pal.reserve(2 * page);
        // SAFETY: both windows stay inside the 2-page reservation.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0x3c, 2 * page);
            pal.zero(p, page / 2, false);
            let bytes = core::slice::from_raw_parts(p.as_ptr(), 2 * page);
            assert!(bytes[..page / 2].iter().all(|&b| b == 0));
            assert!(bytes[page / 2..].iter().all(|&b| b == 0x3c));
            pal.release(p, 2 * page);
        }
    }

    #[test]
    fn aligned_zero_keeps_the_same_address() {
        let pal = PalApple::new();
        let page = pal.page_size();
        let size = 8 * page;
        let p = pal.reserve(size);
        // SAFETY: freshly reserved range of `size` bytes.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0xa5, size);
            pal.zero(p, size, true);
            let bytes = core::slice::from_raw_parts(p.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0));
            // The range is still mapped and writable after the remap.
            ptr::write_bytes(p.as_ptr(), 0x01, size);
            pal.release(p, size);
        }
    }

    #[test]
    fn unaligned_zero_falls_back_to_fill() {
        let pal = PalApple::new();
        let page = pal.page_size();
        let p = pal.reserve(2 * page);
        // SAFETY: all offsets stay inside the 2-page reservation.
        unsafe {
            ptr::write_bytes(p.as_ptr(), 0x7f, 2 * page);
            pal.zero(p.add(3), page, false);
            let bytes = core::slice::from_raw_parts(p.as_ptr(), 2 * page);
            assert!(bytes[..3].iter().all(|&b| b == 0x7f));
            assert!(bytes[3..3 + page].iter().all(|&b| b == 0));
            assert!(bytes[3 + page..].iter().all(|&b| b == 0x7f));
            pal.release(p, 2 * page);
        }
    }
}
