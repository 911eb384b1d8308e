//! Slot storage supplied by an embedding runtime.
//!
//! When pinmalloc is built into a runtime that already manages a per-thread
//! allocator pointer, that runtime owns the slot and decides when to release
//! it (by calling [`ExternalSlot::thread_exit`]). This strategy only makes the
//! lazy-provisioning decision; it registers nothing.
//!
//! The runtime should initialize each thread's slot to
//! [`placeholder_ptr`](crate::placeholder_ptr). A null slot is also accepted
//! and binds on first use.

use core::marker::PhantomData;

use super::{AllocHandle, ThreadAllocStrategy, bind_fresh, release_slot};
use crate::local::LocalAlloc;

/// Locates the calling thread's slot inside the embedding runtime.
pub trait SlotAccessor {
    /// Pointer to this thread's slot. Must be valid for the thread's lifetime
    /// and never shared with another thread.
    fn slot() -> *mut *mut LocalAlloc;
}

/// Strategy over a runtime-owned slot.
pub struct ExternalSlot<A>(PhantomData<A>);

impl<A: SlotAccessor> ExternalSlot<A> {
    /// Release the bound instance, if any. The runtime calls this once per
    /// thread from its own teardown.
    ///
    /// # Safety
    ///
    /// No [`AllocHandle`] obtained on this thread before the call may be used
    /// afterwards; the instance may already belong to another thread.
    pub unsafe fn thread_exit() {
        release_slot::<Self>();
    }
}

impl<A: SlotAccessor> ThreadAllocStrategy for ExternalSlot<A> {
    const NAME: &'static str = "external_slot";

    #[inline]
    fn get() -> *mut LocalAlloc {
        // SAFETY: the accessor contract makes the slot valid and thread-private.
        unsafe { *A::slot() }
    }

    #[inline]
    fn set(alloc: *mut LocalAlloc) {
        // SAFETY: as in `get`.
        unsafe { *A::slot() = alloc };
    }

    fn register_cleanup() {}

    fn rebind_after_teardown() -> AllocHandle {
        bind_fresh::<Self>()
    }
}

#[cfg(feature = "external-slot")]
unsafe extern "Rust" {
    /// Defined by the embedding runtime with `#[unsafe(no_mangle)]`.
    fn pinmalloc_thread_alloc_slot() -> *mut *mut LocalAlloc;
}

/// Accessor backed by the runtime's `pinmalloc_thread_alloc_slot` symbol.
#[cfg(feature = "external-slot")]
pub struct SymbolSlot;

#[cfg(feature = "external-slot")]
impl SlotAccessor for SymbolSlot {
    #[inline]
    fn slot() -> *mut *mut LocalAlloc {
        // SAFETY: the runtime promises a per-thread slot pointer.
        unsafe { pinmalloc_thread_alloc_slot() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{is_placeholder, placeholder_ptr};
    use crate::thread_alloc::thread_alloc_for;
    use core::cell::UnsafeCell;
    use std::thread;

    thread_local! {
        static RUNTIME_SLOT: UnsafeCell<*mut LocalAlloc> = const { UnsafeCell::new(placeholder_ptr()) };
    }

    struct TestSlot;

    impl SlotAccessor for TestSlot {
        fn slot() -> *mut *mut LocalAlloc {
            RUNTIME_SLOT.with(UnsafeCell::get)
        }
    }

    type Runtime = ExternalSlot<TestSlot>;

    #[test]
    fn binds_into_runtime_storage() {
        thread::spawn(|| {
            assert!(is_placeholder(Runtime::get()));
            let a = thread_alloc_for::<Runtime>().as_ptr();
            assert!(!is_placeholder(a));
            assert_eq!(RUNTIME_SLOT.with(|s| unsafe { *s.get() }), a);
            assert_eq!(thread_alloc_for::<Runtime>().as_ptr(), a);
            unsafe { Runtime::thread_exit() };
        })
        .join()
        .unwrap();
    }

    #[test]
    fn torn_down_runtime_slot_binds_again() {
        thread::spawn(|| {
            let _ = thread_alloc_for::<Runtime>();
            unsafe { Runtime::thread_exit() };
            assert!(Runtime::get().is_null());
            let again = thread_alloc_for::<Runtime>();
            assert!(!again.is_transient());
            assert_eq!(Runtime::get(), again.as_ptr());
            drop(again);
            unsafe { Runtime::thread_exit() };
        })
        .join()
        .unwrap();
    }
}
