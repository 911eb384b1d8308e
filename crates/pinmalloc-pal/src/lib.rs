//! # pinmalloc-pal
//!
//! Platform abstraction layer for the pinmalloc allocator.
//!
//! A PAL turns "give me N bytes of address space" and "make these bytes read
//! as zero" into the fewest OS calls a platform allows. The family is closed
//! and selected at build time:
//!
//! - [`PalBsd`]: generic BSD/POSIX-like base built on anonymous `mmap` and byte fill.
//! - [`PalApple`]: XNU specialization. Zeroes aligned ranges by remapping
//!   fresh anonymous pages in place and tags every mapping for `vmmap`.
//!
//! [`DefaultPal`] names the variant for the compile target. Every variant is a
//! strict behavioural refinement of [`PalBsd`]: same postconditions, different
//! cost.
//!
//! Failures are fatal. See [`PalError`] and [`fatal`].

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

mod apple;
mod bsd;
mod error;
mod features;

pub use apple::{PalApple, VM_TAG_PINMALLOC};
pub use bsd::PalBsd;
pub use error::{PalError, StackWriter, fatal, pal_error};
pub use features::PalFeatures;

/// Page size assumed by PAL variants that do not override it.
pub const OS_PAGE_SIZE: usize = 0x1000;

/// The operation contract shared by every PAL variant.
///
/// Implementations are stateless or near-stateless and safe to call from any
/// thread concurrently.
pub trait Pal: Sync {
    /// Optional capabilities of this variant.
    const FEATURES: PalFeatures;

    /// Page size this variant is built for. Ranges handed to the PAL are
    /// rounded to it.
    const PAGE_SIZE: usize;

    /// Granularity the running kernel maps and advises at: the larger of
    /// [`Pal::PAGE_SIZE`] and [`kernel_page_size`].
    ///
    /// Anything that makes the kernel act on whole pages (fixed remaps,
    /// discard hints) must align to this, not to the compile-time constant.
    #[inline]
    fn page_size(&self) -> usize {
        Self::PAGE_SIZE.max(kernel_page_size())
    }

    /// Map `size` bytes of fresh anonymous read/write memory.
    ///
    /// `size` must already be a multiple of the allocation granularity; it is
    /// not re-rounded here.
    fn try_reserve(&self, size: usize) -> Result<NonNull<u8>, PalError>;

    /// Like [`Pal::try_reserve`], but address-space exhaustion aborts the process.
    #[inline]
    fn reserve(&self, size: usize) -> NonNull<u8> {
        match self.try_reserve(size) {
            Ok(p) => p,
            Err(err) => fatal(&err),
        }
    }

    /// Make `[ptr, ptr + size)` read as zero.
    ///
    /// When `page_aligned` is true the range must start and end on page
    /// boundaries; variants are free to skip their own alignment check.
    ///
    /// # Safety
    ///
    /// The range must be mapped read/write memory owned by the caller, with no
    /// live references into it.
    unsafe fn zero(&self, ptr: NonNull<u8>, size: usize, page_aligned: bool);

    /// Unmap a range previously returned by [`Pal::reserve`].
    ///
    /// # Safety
    ///
    /// The range must come from this PAL and must not be accessed afterwards.
    unsafe fn try_release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PalError>;

    /// Like [`Pal::try_release`], but failure aborts the process.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pal::try_release`].
    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        if let Err(err) = unsafe { self.try_release(ptr, size) } {
            fatal(&err);
        }
    }

    /// Tell the OS the page-aligned range may be discarded.
    ///
    /// The contents are unspecified afterwards.
    ///
    /// # Safety
    ///
    /// The range must be owned by the caller and page aligned.
    unsafe fn notify_not_using(&self, ptr: NonNull<u8>, size: usize) -> Result<(), PalError>;

    /// Bring a page-aligned range back into use, zeroing it when `zero` is set.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pal::zero`] with `page_aligned == true`.
    #[inline]
    unsafe fn notify_using(&self, ptr: NonNull<u8>, size: usize, zero: bool) {
        if zero {
            // SAFETY: forwarded caller contract.
            unsafe { self.zero(ptr, size, true) };
        }
    }

    /// Report an unrecoverable condition and abort.
    fn error(&self, msg: &str) -> ! {
        pal_error(msg)
    }
}

/// The PAL variant for the compile target.
#[cfg(target_vendor = "apple")]
pub type DefaultPal = PalApple;

/// The PAL variant for the compile target.
#[cfg(not(target_vendor = "apple"))]
pub type DefaultPal = PalBsd;

static DEFAULT_PAL: DefaultPal = DefaultPal::new();

/// Process-wide instance of [`DefaultPal`].
#[inline]
#[must_use]
pub fn default_pal() -> &'static DefaultPal {
    &DEFAULT_PAL
}

static KERNEL_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Page size reported by the running kernel, read once through `sysconf`.
///
/// Falls back to [`OS_PAGE_SIZE`] if the query fails.
#[must_use]
pub fn kernel_page_size() -> usize {
    let cached = KERNEL_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = match usize::try_from(raw) {
        Ok(n) if n.is_power_of_two() => n,
        _ => OS_PAGE_SIZE,
    };
    KERNEL_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// True when `value` is a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// True when both ends of `[ptr, ptr + size)` sit on `align` boundaries.
#[inline]
#[must_use]
pub fn is_aligned_block(ptr: *const u8, size: usize, align: usize) -> bool {
    is_aligned(ptr as usize | size, align)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(8191, 4096));
        assert_eq!(align_down(8191, 4096), 4096);
        assert_eq!(align_down(8192, 4096), 8192);
    }

    #[test]
    fn aligned_block_checks_both_ends() {
        let base = 0x10000 as *const u8;
        assert!(is_aligned_block(base, 0x2000, 0x1000));
        assert!(!is_aligned_block(base, 0x2001, 0x1000));
        assert!(!is_aligned_block(base.wrapping_add(8), 0x1000, 0x1000));
    }

    #[test]
    fn default_pal_page_size_is_power_of_two() {
        let pal = default_pal();
        assert!(pal.page_size().is_power_of_two());
        assert!(pal.page_size() >= OS_PAGE_SIZE);
        assert!(pal.page_size() >= kernel_page_size());
    }

    #[test]
    fn kernel_page_size_matches_sysconf() {
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(raw > 0);
        assert_eq!(kernel_page_size(), raw as usize);
        assert!(kernel_page_size().is_power_of_two());
        // Cached after the first query.
        assert_eq!(kernel_page_size(), raw as usize);
    }

    #[test]
    fn every_variant_commits_lazily() {
        assert!(PalBsd::FEATURES.contains(PalFeatures::LAZY_COMMIT));
        assert!(PalApple::FEATURES.contains(PalFeatures::LAZY_COMMIT));
        assert!(PalApple::FEATURES.contains(PalBsd::FEATURES));
        assert!(!PalBsd::FEATURES.contains(PalFeatures::FIXED_REMAP_ZERO));
    }
}
