//! Generic BSD/POSIX-like PAL.
//!
//! Reservation is a plain anonymous private mapping and zeroing is a byte
//! fill. Specializations may be cheaper but never weaker than this.

use core::ffi::{c_int, c_void};
use core::ptr::{self, NonNull};

use crate::error::{PalError, last_errno};
use crate::{OS_PAGE_SIZE, Pal, PalFeatures, align_down, align_up, is_aligned_block};

#[cfg(any(target_os = "linux", target_os = "android"))]
const DISCARD_ADVICE: c_int = libc::MADV_DONTNEED;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const DISCARD_ADVICE: c_int = libc::MADV_FREE;

/// Generic BSD/POSIX platform.
#[derive(Debug, Default, Clone, Copy)]
pub struct PalBsd;

impl PalBsd {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Anonymous private read/write `mmap`.
///
/// `fd` is `-1` on the generic path; XNU reads a mapping tag from it.
pub(crate) fn map_anonymous(
    hint: *mut c_void,
    size: usize,
    extra_flags: c_int,
    fd: c_int,
) -> Result<NonNull<u8>, i32> {
    // SAFETY: anonymous mappings do not alias existing memory unless the caller
    // passes MAP_FIXED, in which case it owns the target range.
    let p = unsafe {
        libc::mmap(
            hint,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            fd,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(last_errno());
    }
    NonNull::new(p.cast::<u8>()).ok_or(libc::ENOMEM)
}

/// The whole kernel pages inside `[addr, addr + size)`, as `(start, len)`.
///
/// `None` when the range covers no complete page.
pub(crate) fn page_interior(addr: usize, size: usize, page: usize) -> Option<(usize, usize)> {
    let start = align_up(addr, page);
    let end = align_down(addr + size, page);
    (end > start).then(|| (start, end - start))
}

impl Pal for PalBsd {
    const FEATURES: PalFeatures = PalFeatures::LAZY_COMMIT;
    const PAGE_SIZE: usize = OS_PAGE_SIZE;

    fn try_reserve(&self, size: usize) -> Result<NonNull<u8>, PalError> {
        map_anonymous(ptr::null_mut(), size, 0, -1)
            .map_err(|errno| PalError::OutOfMemory { size, errno })
    }

    unsafe fn zero(&self, p: NonNull<u8>, size: usize, page_aligned: bool) {
        debug_assert!(!page_aligned || is_aligned_block(p.as_ptr(), size, Self::PAGE_SIZE));
        // SAFETY: caller owns the writable range.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
    }

    unsafe fn try_release(&self, p: NonNull<u8>, size: usize) -> Result<(), PalError> {
        // SAFETY: caller guarantees the range came from `reserve` and is dead.
        let rc = unsafe { libc::munmap(p.as_ptr().cast(), size) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PalError::Unmap {
                addr: p.as_ptr() as usize,
                size,
                errno: last_errno(),
            })
        }
    }

    unsafe fn notify_not_using(&self, p: NonNull<u8>, size: usize) -> Result<(), PalError> {
        debug_assert!(is_aligned_block(p.as_ptr(), size, Self::PAGE_SIZE));
        // The kernel discards whole pages; never let that reach past the range.
        let Some((start, len)) = page_interior(p.as_ptr() as usize, size, self.page_size()) else {
            return Ok(());
        };
        // SAFETY: `[start, start + len)` lies inside the caller's range.
        let rc = unsafe { libc::madvise(start as *mut c_void, len, DISCARD_ADVICE) };
        if rc == 0 {
            Ok(())
        } else {
            Err(PalError::Advise {
                addr: start,
                size: len,
                errno: last_errno(),
            })
        }
    }
}
