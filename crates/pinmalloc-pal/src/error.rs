//! PAL failure taxonomy and the allocation-free fatal reporter.
//!
//! Every PAL failure is terminal for the allocator: callers above the PAL are
//! written to assume success or abort. The `try_*` operations surface a
//! [`PalError`] so diagnostics and tests can observe the condition; the
//! plain operations route it through [`fatal`].

use core::fmt::{self, Write};

use thiserror::Error;

/// An OS-level failure reported by a PAL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PalError {
    /// The OS could not provide `size` bytes of address space.
    #[error("out of memory: reserving {size} bytes failed (errno {errno})")]
    OutOfMemory { size: usize, errno: i32 },
    /// `munmap` rejected a range the allocator believed it owned.
    #[error("unmapping {size} bytes at {addr:#x} failed (errno {errno})")]
    Unmap { addr: usize, size: usize, errno: i32 },
    /// The kernel rejected a usage hint.
    #[error("madvise on {size} bytes at {addr:#x} failed (errno {errno})")]
    Advise { addr: usize, size: usize, errno: i32 },
}

impl PalError {
    /// The errno captured when the failure was observed.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match *self {
            Self::OutOfMemory { errno, .. }
            | Self::Unmap { errno, .. }
            | Self::Advise { errno, .. } => errno,
        }
    }
}

/// Read the calling thread's errno without allocating.
#[inline]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Capacity of the fatal-report buffer. Longer messages are truncated.
const REPORT_CAPACITY: usize = 256;

/// Fixed-capacity, stack-allocated text sink.
///
/// Used for every message the allocator writes itself, because formatting
/// through `String` could re-enter the allocator.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Write the buffered bytes to stderr. Short writes are retried; errors are dropped.
    pub fn flush_to_stderr(&self) {
        let mut rest = self.as_bytes();
        while !rest.is_empty() {
            // SAFETY: `rest` is a valid initialized slice for its length.
            let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
            if n <= 0 {
                return;
            }
            rest = &rest[n as usize..];
        }
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}

/// Report `msg` on stderr and abort the process.
pub fn pal_error(msg: &str) -> ! {
    let mut out = StackWriter::<REPORT_CAPACITY>::new();
    let _ = writeln!(out, "pinmalloc: fatal: {msg}");
    out.flush_to_stderr();
    // SAFETY: abort never returns and has no preconditions.
    unsafe { libc::abort() }
}

/// Report a [`PalError`] on stderr and abort the process.
pub fn fatal(err: &PalError) -> ! {
    let mut out = StackWriter::<REPORT_CAPACITY>::new();
    let _ = writeln!(out, "pinmalloc: fatal: {err}");
    out.flush_to_stderr();
    // SAFETY: abort never returns and has no preconditions.
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_message_names_size_and_errno() {
        let err = PalError::OutOfMemory {
            size: 1 << 20,
            errno: libc::ENOMEM,
        };
        let mut out = StackWriter::<128>::new();
        write!(out, "{err}").unwrap();
        let text = std::str::from_utf8(out.as_bytes()).unwrap();
        assert!(text.starts_with("out of memory"));
        assert!(text.contains("1048576"));
        assert_eq!(err.errno(), libc::ENOMEM);
    }

    #[test]
    fn stack_writer_truncates_instead_of_growing() {
        let mut out = StackWriter::<8>::new();
        assert!(out.write_str("0123456789").is_err());
        assert_eq!(out.as_bytes(), b"01234567");
        assert!(out.write_str("x").is_err());
    }

    #[test]
    fn unmap_message_formats_address_in_hex() {
        let err = PalError::Unmap {
            addr: 0x1000,
            size: 4096,
            errno: libc::EINVAL,
        };
        let mut out = StackWriter::<128>::new();
        write!(out, "{err}").unwrap();
        assert!(std::str::from_utf8(out.as_bytes()).unwrap().contains("0x1000"));
    }
}
