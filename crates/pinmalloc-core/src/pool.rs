//! Shared pool of allocator instances not bound to any thread.
//!
//! Instances are constructed in place inside PAL reservations, so growing the
//! pool never calls back into a global allocator (which may be pinmalloc
//! itself). Every instance ever created stays linked on an append-only list
//! for statistics; the free stack threads through `next_free`.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pinmalloc_pal::{Pal, align_up, default_pal};

use crate::local::{LocalAlloc, is_placeholder};
use crate::stats::AllocStats;

/// Bytes reserved at a time for instance storage.
const INSTANCE_SLAB_SIZE: usize = 64 * 1024;

struct PoolState {
    free_head: *mut LocalAlloc,
    all_head: *mut LocalAlloc,
    next_id: u32,
    slab_cursor: usize,
    slab_end: usize,
}

// SAFETY: the raw pointers refer to pool-owned instances and are only
// dereferenced with the pool lock held.
unsafe impl Send for PoolState {}

/// Acquire/release accounting snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounters {
    /// Total successful `acquire` calls.
    pub acquired: u64,
    /// Total `release` calls.
    pub released: u64,
    /// Distinct instances ever constructed.
    pub created: u64,
}

impl PoolCounters {
    /// Instances currently bound to some thread (or leased transiently).
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        // The two counters are loaded independently and may be momentarily
        // out of order.
        self.acquired.saturating_sub(self.released)
    }
}

/// The pool. See [`current_alloc_pool`] for the process-wide instance.
pub struct AllocPool {
    state: Mutex<PoolState>,
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
}

impl AllocPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(PoolState {
                free_head: ptr::null_mut(),
                all_head: ptr::null_mut(),
                next_id: 1,
                slab_cursor: 0,
                slab_end: 0,
            }),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    /// Hand out exclusive ownership of an instance, creating one if the free
    /// stack is empty.
    pub fn acquire(&self) -> NonNull<LocalAlloc> {
        let mut state = self.state.lock();
        let alloc = match NonNull::new(state.free_head) {
            Some(head) => {
                // SAFETY: free-stack entries are live pool-owned instances.
                let a = unsafe { head.as_ref() };
                state.free_head = a.next_free.replace(ptr::null_mut());
                a.in_pool.set(false);
                head
            }
            None => self.create(&mut state),
        };
        drop(state);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        alloc
    }

    /// Take ownership back.
    ///
    /// # Safety
    ///
    /// `alloc` must come from [`AllocPool::acquire`] on this pool and must not
    /// be used by the caller afterwards.
    pub unsafe fn release(&self, alloc: NonNull<LocalAlloc>) {
        debug_assert!(!is_placeholder(alloc.as_ptr()), "placeholder released to pool");
        // SAFETY: caller guarantees `alloc` is a live pool instance.
        let a = unsafe { alloc.as_ref() };
        let mut state = self.state.lock();
        debug_assert!(!a.in_pool.get(), "instance {} released twice", a.id());
        a.in_pool.set(true);
        a.next_free.set(state.free_head);
        state.free_head = alloc.as_ptr();
        drop(state);
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the counters of every instance this pool ever created into `out`.
    pub fn aggregate_stats(&self, out: &mut AllocStats) {
        let state = self.state.lock();
        let mut cursor = state.all_head;
        while let Some(p) = NonNull::new(cursor) {
            // SAFETY: instances are never destroyed once created.
            let a = unsafe { p.as_ref() };
            out.accumulate(&a.counters().snapshot());
            cursor = a.next_all.get();
        }
    }

    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
        }
    }

    fn create(&self, state: &mut PoolState) -> NonNull<LocalAlloc> {
        let size = align_up(size_of::<LocalAlloc>(), align_of::<LocalAlloc>());
        let mut start = align_up(state.slab_cursor, align_of::<LocalAlloc>());
        if state.slab_cursor == 0 || start + size > state.slab_end {
            let slab = default_pal().reserve(INSTANCE_SLAB_SIZE);
            start = slab.as_ptr() as usize;
            state.slab_end = start + INSTANCE_SLAB_SIZE;
        }
        state.slab_cursor = start + size;

        let id = state.next_id;
        state.next_id += 1;
        let slot = start as *mut LocalAlloc;
        // SAFETY: `slot` is aligned, inside a fresh reservation, and unused.
        unsafe { slot.write(LocalAlloc::new(id)) };
        // SAFETY: just initialized above.
        let a = unsafe { &*slot };
        a.next_all.set(state.all_head);
        state.all_head = slot;
        self.created.fetch_add(1, Ordering::Relaxed);
        // SAFETY: derived from a non-null reservation.
        unsafe { NonNull::new_unchecked(slot) }
    }
}

impl Default for AllocPool {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_POOL: AllocPool = AllocPool::new();

/// The process-wide pool used by every thread slot.
#[inline]
#[must_use]
pub fn current_alloc_pool() -> &'static AllocPool {
    &GLOBAL_POOL
}
