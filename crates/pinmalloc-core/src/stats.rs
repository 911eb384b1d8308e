//! Allocator counters and the aggregated statistics snapshot.
//!
//! Counters are written only by the thread that owns an instance, but the pool
//! reads them from any thread while aggregating, so they are relaxed atomics.
//! They are diagnostic, not synchronization.

use core::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pinmalloc_pal::StackWriter;
use serde::Serialize;

/// Per-instance operation counters.
#[derive(Debug)]
pub struct AllocCounters {
    pub allocs: AtomicU64,
    pub deallocs: AtomicU64,
    pub bytes_allocated: AtomicU64,
    pub bytes_freed: AtomicU64,
    /// Bump chunks reserved from the PAL.
    pub chunks_reserved: AtomicU64,
    /// Large requests served by a dedicated mapping.
    pub large_mappings: AtomicU64,
}

impl AllocCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            deallocs: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            chunks_reserved: AtomicU64::new(0),
            large_mappings: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot these counters as a single-instance [`AllocStats`].
    #[must_use]
    pub fn snapshot(&self) -> AllocStats {
        AllocStats {
            instances: 1,
            allocs: Self::get(&self.allocs),
            deallocs: Self::get(&self.deallocs),
            bytes_allocated: Self::get(&self.bytes_allocated),
            bytes_freed: Self::get(&self.bytes_freed),
            chunks_reserved: Self::get(&self.chunks_reserved),
            large_mappings: Self::get(&self.large_mappings),
        }
    }
}

impl Default for AllocCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated statistics over one or more allocator instances.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    pub instances: u64,
    pub allocs: u64,
    pub deallocs: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub chunks_reserved: u64,
    pub large_mappings: u64,
}

impl AllocStats {
    /// Fold `other` into `self`.
    pub fn accumulate(&mut self, other: &Self) {
        self.instances += other.instances;
        self.allocs += other.allocs;
        self.deallocs += other.deallocs;
        self.bytes_allocated += other.bytes_allocated;
        self.bytes_freed += other.bytes_freed;
        self.chunks_reserved += other.chunks_reserved;
        self.large_mappings += other.large_mappings;
    }

    /// Bytes handed out and not yet returned, as seen by the counters.
    ///
    /// Frees land on whichever instance the freeing thread owns, so this is
    /// only meaningful across the whole pool.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated.saturating_sub(self.bytes_freed)
    }

    /// Write a one-line summary to stderr without allocating.
    pub fn print_to_stderr(&self) {
        let mut out = StackWriter::<512>::new();
        let _ = writeln!(
            out,
            "pinmalloc stats: instances={} allocs={} deallocs={} bytes_allocated={} \
             bytes_freed={} live_bytes={} chunks={} large_mappings={}",
            self.instances,
            self.allocs,
            self.deallocs,
            self.bytes_allocated,
            self.bytes_freed,
            self.live_bytes(),
            self.chunks_reserved,
            self.large_mappings,
        );
        out.flush_to_stderr();
    }
}

static EXIT_REPORT_REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn print_pool_stats() {
    let mut stats = AllocStats::default();
    crate::pool::current_alloc_pool().aggregate_stats(&mut stats);
    stats.print_to_stderr();
    crate::log::record(
        crate::log::EventLevel::Debug,
        crate::log::EventKind::Stats,
        "atexit",
        None,
        "printed",
    );
}

/// Register the exit-time report once per process, if `PINMALLOC_STATS` asks for it.
pub(crate) fn register_exit_report() {
    if !crate::config::stats_at_exit() || EXIT_REPORT_REGISTERED.swap(true, Ordering::AcqRel) {
        return;
    }
    // SAFETY: `print_pool_stats` is a plain extern "C" fn with no arguments.
    unsafe { libc::atexit(print_pool_stats) };
}
