//! Runtime configuration.
//!
//! Two environment variables are consulted, each once per process:
//! - `PINMALLOC_TRACE`: `off` (default), `lifecycle` or `verbose`. Controls
//!   which binding events reach the ring in [`crate::log`].
//! - `PINMALLOC_STATS`: when truthy, the first thread bind registers an
//!   exit-time report of the aggregated pool statistics on stderr.
//!
//! Resolution runs inside the allocator, so it reads the environment through
//! `libc::getenv` (no allocation) and caches the result in an atomic state
//! machine rather than a `OnceLock`: a reentrant call that arrives while the
//! value is being resolved gets the default instead of blocking.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::log::EventLevel;

/// How much of the binding lifecycle is recorded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceLevel {
    /// Nothing is recorded.
    #[default]
    Off,
    /// Binds, releases, late rebinds and transient leases.
    Lifecycle,
    /// Everything, including no-op teardowns and stats dumps.
    Verbose,
}

impl TraceLevel {
    /// Parse from raw bytes (ASCII, case-insensitive). Unknown values are `Off`.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        const LIFECYCLE: [&[u8]; 4] = [b"lifecycle", b"events", b"info", b"1"];
        const VERBOSE: [&[u8]; 4] = [b"verbose", b"all", b"debug", b"2"];
        if LIFECYCLE.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
            Self::Lifecycle
        } else if VERBOSE.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
            Self::Verbose
        } else {
            Self::Off
        }
    }

    /// Returns true if events at `level` are recorded.
    #[must_use]
    pub const fn records(self, level: EventLevel) -> bool {
        match self {
            Self::Off => false,
            Self::Lifecycle => !matches!(level, EventLevel::Debug),
            Self::Verbose => true,
        }
    }
}

// 0=unresolved, 1=Off, 2=Lifecycle, 3=Verbose, 255=resolving.
static CACHED_TRACE: AtomicU8 = AtomicU8::new(0);

// 0=unresolved, 1=disabled, 2=enabled, 255=resolving.
static CACHED_STATS: AtomicU8 = AtomicU8::new(0);

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

const TRACE_OFF: u8 = 1;
const TRACE_LIFECYCLE: u8 = 2;
const TRACE_VERBOSE: u8 = 3;

const STATS_DISABLED: u8 = 1;
const STATS_ENABLED: u8 = 2;

fn trace_to_u8(level: TraceLevel) -> u8 {
    match level {
        TraceLevel::Off => TRACE_OFF,
        TraceLevel::Lifecycle => TRACE_LIFECYCLE,
        TraceLevel::Verbose => TRACE_VERBOSE,
    }
}

fn u8_to_trace(v: u8) -> TraceLevel {
    match v {
        TRACE_LIFECYCLE => TraceLevel::Lifecycle,
        TRACE_VERBOSE => TraceLevel::Verbose,
        _ => TraceLevel::Off,
    }
}

fn parse_flag(raw: &[u8]) -> bool {
    [b"1".as_slice(), b"true", b"yes", b"on"]
        .iter()
        .any(|v| raw.eq_ignore_ascii_case(v))
}

/// Read an environment variable without allocating.
fn getenv_bytes(name: &CStr) -> Option<&'static [u8]> {
    // SAFETY: `name` is NUL-terminated. The returned pointer stays valid
    // until the environment is modified, which this process does not do
    // concurrently with allocator start-up.
    let p = unsafe { libc::getenv(name.as_ptr()) };
    if p.is_null() {
        None
    } else {
        // SAFETY: getenv returned a NUL-terminated string.
        Some(unsafe { CStr::from_ptr(p) }.to_bytes())
    }
}

/// Resolve a cached setting through the non-blocking state machine.
fn resolve(cache: &AtomicU8, default: u8, compute: impl FnOnce() -> u8) -> u8 {
    let cached = cache.load(Ordering::Relaxed);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return default;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = cache.load(Ordering::Relaxed);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            default
        };
    }
    let v = compute();
    // A concurrent `set_*` override wins over the environment.
    let _ = cache.compare_exchange(RESOLVING, v, Ordering::Release, Ordering::Relaxed);
    cache.load(Ordering::Acquire)
}

/// The configured trace level (reads `PINMALLOC_TRACE` on first call).
#[must_use]
pub fn trace_level() -> TraceLevel {
    u8_to_trace(resolve(&CACHED_TRACE, TRACE_OFF, || {
        getenv_bytes(c"PINMALLOC_TRACE")
            .map_or(TRACE_OFF, |raw| trace_to_u8(TraceLevel::from_bytes_loose(raw)))
    }))
}

/// Override the trace level for the rest of the process.
pub fn set_trace_level(level: TraceLevel) {
    CACHED_TRACE.store(trace_to_u8(level), Ordering::Release);
}

/// Whether the exit-time statistics report is enabled (reads `PINMALLOC_STATS`).
#[must_use]
pub fn stats_at_exit() -> bool {
    resolve(&CACHED_STATS, STATS_DISABLED, || {
        if getenv_bytes(c"PINMALLOC_STATS").is_some_and(parse_flag) {
            STATS_ENABLED
        } else {
            STATS_DISABLED
        }
    }) == STATS_ENABLED
}

/// Override [`stats_at_exit`] for the rest of the process.
///
/// Takes effect for threads that bind after the call.
pub fn set_stats_at_exit(enabled: bool) {
    let v = if enabled { STATS_ENABLED } else { STATS_DISABLED };
    CACHED_STATS.store(v, Ordering::Release);
}
