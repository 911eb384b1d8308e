//! Cleanup through Rust thread-local destructors.
//!
//! Binding touches a `thread_local!` guard whose `Drop` releases the slot's
//! instance. Other thread-locals may still allocate while they are destroyed,
//! possibly after this guard already ran. Such a request finds the slot torn
//! down and is re-provisioned:
//!
//! 1. The first late request acquires a fresh instance, binds it, and arms a
//!    second guard that has not been touched before (so it can still register
//!    its destructor while teardown is in progress).
//! 2. Once that second guard is spent, later requests are served a transient
//!    instance that is released as soon as the request completes.
//!
//! Each path registers at most one further destructor and the second does
//! none, so teardown terminates. The cost is extra pool traffic: an instance
//! may be released and re-acquired on the way out.

use core::cell::Cell;

use super::{AllocHandle, ThreadAllocStrategy, lease_transient, release_slot};
use crate::local::{LocalAlloc, placeholder_ptr};
use crate::log::{self, EventKind, EventLevel};
use crate::pool::current_alloc_pool;

/// Releases the slot's instance when dropped.
struct OnDestruct;

impl Drop for OnDestruct {
    fn drop(&mut self) {
        ThreadDestructor::inner_release();
    }
}

thread_local! {
    static SLOT: Cell<*mut LocalAlloc> = const { Cell::new(placeholder_ptr()) };
    static TIDIER: OnDestruct = const { OnDestruct };
    static LATE_TIDIER: OnDestruct = const { OnDestruct };
    static LATE_ARMED: Cell<bool> = const { Cell::new(false) };
}

/// Strategy backed by `thread_local!` destructors.
pub struct ThreadDestructor;

impl ThreadDestructor {
    fn inner_release() {
        release_slot::<Self>();
        log::record(EventLevel::Debug, EventKind::ThreadExit, Self::NAME, None, "guard_ran");
    }

    /// Release this thread's instance now, exactly as its exit guard would.
    ///
    /// The slot is left torn down; a later allocation on this thread takes the
    /// late-rebind path. The exit guard still runs at thread exit and finds
    /// whatever the slot holds then.
    ///
    /// # Safety
    ///
    /// No [`AllocHandle`] obtained on this thread before the call may be used
    /// afterwards: the released instance can be bound to another thread at
    /// once. Blocks allocated through it stay valid and may be freed later.
    ///
    /// ```compile_fail
    /// // Releasing the slot requires an `unsafe` block.
    /// pinmalloc_core::thread_alloc::ThreadDestructor::teardown_now();
    /// ```
    pub unsafe fn teardown_now() {
        Self::inner_release();
    }

    /// True once a late rebind has armed the second guard on this thread.
    #[must_use]
    pub fn late_guard_armed() -> bool {
        LATE_ARMED.with(Cell::get)
    }
}

impl ThreadAllocStrategy for ThreadDestructor {
    const NAME: &'static str = "thread_destructor";

    #[inline]
    fn get() -> *mut LocalAlloc {
        SLOT.with(Cell::get)
    }

    #[inline]
    fn set(alloc: *mut LocalAlloc) {
        SLOT.with(|slot| slot.set(alloc));
    }

    fn register_cleanup() {
        // Touching the guard registers its destructor. If it has already been
        // destroyed the slot is torn down before the next exit hook anyway.
        let _ = TIDIER.try_with(|_| ());
    }

    fn rebind_after_teardown() -> AllocHandle {
        if LATE_ARMED.with(Cell::get) {
            return lease_transient::<Self>();
        }
        // Armed first: registering the guard may allocate and re-enter here.
        LATE_ARMED.with(|armed| armed.set(true));
        if LATE_TIDIER.try_with(|_| ()).is_err() {
            return lease_transient::<Self>();
        }
        let alloc = current_alloc_pool().acquire();
        Self::set(alloc.as_ptr());
        // SAFETY: just acquired and bound to this thread.
        let id = unsafe { alloc.as_ref() }.id();
        log::record(EventLevel::Warn, EventKind::LateRebind, Self::NAME, Some(id), "rebound");
        AllocHandle::Bound(alloc)
    }
}
