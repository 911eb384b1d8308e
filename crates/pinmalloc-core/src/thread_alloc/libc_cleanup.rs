//! Cleanup through the libc "about to destroy thread-locals" hook.
//!
//! A compatible libc (FreeBSD's, for one) calls `_malloc_thread_cleanup`
//! exactly once per thread, after every other thread-local destructor has
//! run. Nothing that allocates can follow it, so `register_cleanup` has
//! nothing to do. If something allocates after it anyway, the hook cannot
//! fire again and the request gets a transient instance.

use core::cell::Cell;

use super::{AllocHandle, ThreadAllocStrategy, lease_transient, release_slot};
use crate::local::{LocalAlloc, placeholder_ptr};

thread_local! {
    static SLOT: Cell<*mut LocalAlloc> = const { Cell::new(placeholder_ptr()) };
}

/// Strategy driven by the libc thread-exit hook.
pub struct LibcCleanup;

impl LibcCleanup {
    /// Thread-exit entry point. Releases the bound instance, if any.
    ///
    /// # Safety
    ///
    /// No [`AllocHandle`] obtained on this thread before the call may be used
    /// afterwards; the instance may already belong to another thread.
    pub unsafe fn thread_exit() {
        release_slot::<Self>();
    }
}

impl ThreadAllocStrategy for LibcCleanup {
    const NAME: &'static str = "libc_cleanup";

    #[inline]
    fn get() -> *mut LocalAlloc {
        SLOT.with(Cell::get)
    }

    #[inline]
    fn set(alloc: *mut LocalAlloc) {
        SLOT.with(|slot| slot.set(alloc));
    }

    fn register_cleanup() {}

    fn rebind_after_teardown() -> AllocHandle {
        lease_transient::<Self>()
    }
}

/// Called by libc just before the thread's thread-locals are destroyed.
#[cfg(feature = "libc-cleanup")]
#[unsafe(no_mangle)]
pub extern "C" fn _malloc_thread_cleanup() {
    // SAFETY: libc calls this once, after every other thread-local destructor,
    // so nothing on this thread still holds a handle.
    unsafe { LibcCleanup::thread_exit() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::is_placeholder;
    use crate::thread_alloc::thread_alloc_for;
    use std::thread;

    #[test]
    fn exit_hook_releases_and_late_use_is_transient() {
        thread::spawn(|| {
            let bound = thread_alloc_for::<LibcCleanup>().as_ptr();
            assert!(!is_placeholder(bound));
            assert_eq!(thread_alloc_for::<LibcCleanup>().as_ptr(), bound);

            unsafe { LibcCleanup::thread_exit() };
            assert!(LibcCleanup::get().is_null());

            let late = thread_alloc_for::<LibcCleanup>();
            assert!(late.is_transient());
            drop(late);
            assert!(LibcCleanup::get().is_null());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn exit_hook_without_bind_is_a_no_op() {
        thread::spawn(|| {
            unsafe { LibcCleanup::thread_exit() };
            assert!(LibcCleanup::get().is_null());
        })
        .join()
        .unwrap();
    }
}
