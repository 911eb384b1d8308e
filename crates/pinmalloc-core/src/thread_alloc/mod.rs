//! Thread slot management and lazy replacement.
//!
//! A thread slot holds one of:
//! - the placeholder (unbound; the initial value),
//! - a real instance acquired from the pool (bound),
//! - null (torn down; the thread-exit cleanup already released the instance).
//!
//! The fast path loads the slot and uses it. Only the placeholder and null
//! reach [`lazy_replacement_slow`], which binds a fresh instance and arms the
//! strategy's cleanup, or, for a torn-down slot, asks the strategy how to
//! serve a request arriving after its own teardown.
//!
//! Strategies (exactly one is [`ThreadAlloc`] in a given build):
//! - [`ThreadDestructor`]: a `thread_local!` guard releases the instance.
//!   Default, and the only one needing nothing from the host.
//! - [`LibcCleanup`]: libc calls `_malloc_thread_cleanup` after every other
//!   thread-local destructor. The strongest ordering guarantee.
//! - [`ExternalSlot`]: an embedding runtime owns the slot and its teardown.

use core::ops::Deref;
use core::ptr::NonNull;

use crate::local::{LocalAlloc, is_placeholder};
use crate::log::{self, EventKind, EventLevel};
use crate::pool::current_alloc_pool;

mod destructor;
mod external;
mod libc_cleanup;

pub use destructor::ThreadDestructor;
#[cfg(feature = "external-slot")]
pub use external::SymbolSlot;
pub use external::{ExternalSlot, SlotAccessor};
pub use libc_cleanup::LibcCleanup;

#[cfg(any(
    all(feature = "libc-cleanup", feature = "thread-destructor"),
    all(feature = "libc-cleanup", feature = "external-slot"),
    all(feature = "thread-destructor", feature = "external-slot"),
))]
compile_error!(
    "at most one of the `libc-cleanup`, `thread-destructor` and `external-slot` features may be enabled"
);

/// The cleanup strategy selected for this build.
#[cfg(feature = "libc-cleanup")]
pub type ThreadAlloc = LibcCleanup;

/// The cleanup strategy selected for this build.
#[cfg(feature = "external-slot")]
pub type ThreadAlloc = ExternalSlot<SymbolSlot>;

/// The cleanup strategy selected for this build.
#[cfg(not(any(feature = "libc-cleanup", feature = "external-slot")))]
pub type ThreadAlloc = ThreadDestructor;

/// The capability set every cleanup strategy provides.
///
/// All methods act on the calling thread's slot. Dispatch is static; the
/// fast path never goes through a vtable.
pub trait ThreadAllocStrategy {
    /// Label used in lifecycle events.
    const NAME: &'static str;

    /// Current slot value.
    fn get() -> *mut LocalAlloc;

    /// Overwrite the slot.
    fn set(alloc: *mut LocalAlloc);

    /// Arm the thread-exit release. Called once, right after the first bind.
    fn register_cleanup();

    /// Serve a request that found the slot torn down.
    fn rebind_after_teardown() -> AllocHandle;
}

/// Access to an allocator instance obtained from a thread slot.
///
/// `Bound` instances belong to the slot and stay valid until the thread's
/// cleanup runs. Releasing the slot early (for instance with
/// [`ThreadDestructor::teardown_now`]) is `unsafe` because it ends that
/// validity for every handle already taken. `Transient` instances were leased because the slot was
/// already torn down; they go back to the pool when the handle drops.
#[derive(Debug)]
#[must_use]
pub enum AllocHandle {
    Bound(NonNull<LocalAlloc>),
    Transient(NonNull<LocalAlloc>),
}

impl AllocHandle {
    #[must_use]
    pub fn as_ptr(&self) -> *mut LocalAlloc {
        match self {
            Self::Bound(p) | Self::Transient(p) => p.as_ptr(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl Deref for AllocHandle {
    type Target = LocalAlloc;

    fn deref(&self) -> &LocalAlloc {
        // SAFETY: a bound instance stays with its thread until the thread's
        // cleanup runs, and every public early-release entry point is `unsafe`
        // with the contract that no earlier handle is used afterwards.
        // Transient instances are owned by this handle until it drops.
        unsafe { &*self.as_ptr() }
    }
}

impl Drop for AllocHandle {
    fn drop(&mut self) {
        if let Self::Transient(p) = *self {
            // SAFETY: the lease is exclusive and ends here.
            let id = unsafe { p.as_ref() }.id();
            // SAFETY: `p` came from `acquire` and is not used after this.
            unsafe { current_alloc_pool().release(p) };
            log::record(EventLevel::Info, EventKind::Release, "transient", Some(id), "returned");
        }
    }
}

/// Bind a fresh instance into the slot of strategy `S` and arm its cleanup.
pub(crate) fn bind_fresh<S: ThreadAllocStrategy>() -> AllocHandle {
    let alloc = current_alloc_pool().acquire();
    debug_assert!(!is_placeholder(alloc.as_ptr()));
    S::set(alloc.as_ptr());
    S::register_cleanup();
    crate::stats::register_exit_report();
    // SAFETY: just acquired and bound to this thread.
    let id = unsafe { alloc.as_ref() }.id();
    log::record(EventLevel::Info, EventKind::Bind, S::NAME, Some(id), "bound");
    AllocHandle::Bound(alloc)
}

/// Lease a one-shot instance without touching the slot.
pub(crate) fn lease_transient<S: ThreadAllocStrategy>() -> AllocHandle {
    let alloc = current_alloc_pool().acquire();
    // SAFETY: just acquired; exclusively ours.
    let id = unsafe { alloc.as_ref() }.id();
    log::record(EventLevel::Warn, EventKind::Transient, S::NAME, Some(id), "leased");
    AllocHandle::Transient(alloc)
}

/// Release whatever real instance the slot holds and mark it torn down.
///
/// The slot is cleared before the release so anything the release itself
/// triggers observes "torn down". Returns true if an instance was released.
pub(crate) fn release_slot<S: ThreadAllocStrategy>() -> bool {
    let current = S::get();
    S::set(core::ptr::null_mut());
    match NonNull::new(current) {
        Some(alloc) if !is_placeholder(alloc.as_ptr()) => {
            // SAFETY: the slot owned this instance; nothing else refers to it.
            let id = unsafe { alloc.as_ref() }.id();
            // SAFETY: release happens once: the slot no longer holds `alloc`.
            unsafe { current_alloc_pool().release(alloc) };
            log::record(EventLevel::Info, EventKind::Release, S::NAME, Some(id), "released");
            true
        }
        _ => {
            log::record(EventLevel::Debug, EventKind::ThreadExit, S::NAME, None, "nothing_bound");
            false
        }
    }
}

/// Slow path of placeholder replacement.
#[cold]
#[inline(never)]
pub fn lazy_replacement_slow<S: ThreadAllocStrategy>() -> AllocHandle {
    match NonNull::new(S::get()) {
        None => S::rebind_after_teardown(),
        Some(p) if is_placeholder(p.as_ptr()) => bind_fresh::<S>(),
        Some(p) => AllocHandle::Bound(p),
    }
}

/// Called on every [`LocalAlloc`] slow path with the instance that took it.
///
/// Returns `None` when `existing` is a real instance (carry on with it), or
/// the thread's real instance when `existing` is the placeholder.
#[inline]
pub fn lazy_replacement(existing: &LocalAlloc) -> Option<AllocHandle> {
    if !is_placeholder(existing) {
        return None;
    }
    Some(lazy_replacement_slow::<ThreadAlloc>())
}

/// This thread's allocator under strategy `S`, binding one if needed.
#[inline]
pub fn thread_alloc_for<S: ThreadAllocStrategy>() -> AllocHandle {
    if let Some(p) = NonNull::new(S::get()) {
        if !is_placeholder(p.as_ptr()) {
            return AllocHandle::Bound(p);
        }
    }
    lazy_replacement_slow::<S>()
}

/// This thread's allocator, binding one if needed.
#[inline]
pub fn thread_alloc() -> AllocHandle {
    thread_alloc_for::<ThreadAlloc>()
}
