//! # pinmalloc-core
//!
//! Binds each thread to an allocator instance without paying for it on the
//! fast path.
//!
//! Every thread slot starts out pointing at a shared, never-used placeholder
//! allocator. The placeholder owns no memory, so the first allocation through
//! it falls onto a slow path that notices (by pointer identity, not a flag)
//! that it is the placeholder, acquires a real instance from the shared pool,
//! stores it in the slot and arms a thread-exit cleanup. After that the fast
//! path is a single load through the slot.
//!
//! # Architecture
//!
//! ```text
//! PinMalloc (GlobalAlloc) -> thread slot -> LocalAlloc -> pinmalloc-pal
//!                                 |              ^
//!                                 v              |
//!                          lazy replacement -> AllocPool
//! ```
//!
//! The thread-exit strategy is chosen at build time with exactly one of the
//! `thread-destructor` (default), `libc-cleanup` or `external-slot` features.
//! See [`thread_alloc`].

pub mod config;
pub mod global;
pub mod local;
pub mod log;
pub mod pool;
pub mod stats;
pub mod thread_alloc;

pub use global::PinMalloc;
pub use local::{LocalAlloc, is_placeholder, placeholder_ptr};
pub use pool::{AllocPool, PoolCounters, current_alloc_pool};
pub use stats::AllocStats;
pub use thread_alloc::{
    AllocHandle, ThreadAlloc, ThreadAllocStrategy, lazy_replacement, lazy_replacement_slow,
    thread_alloc,
};
