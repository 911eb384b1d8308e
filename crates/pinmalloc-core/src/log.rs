//! Structured binding-lifecycle records.
//!
//! Events are kept in a fixed-capacity ring so recording never allocates;
//! it runs inside the allocator. Export ([`recent_events`], [`to_jsonl`])
//! allocates and is meant for harnesses and tests running outside it.
//!
//! Recording is filtered by [`crate::config::trace_level`].

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Ring capacity.
pub const EVENT_RING_CAPACITY: usize = 256;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
}

/// What happened to a thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A placeholder slot acquired a real instance.
    Bind,
    /// A bound instance went back to the pool.
    Release,
    /// A torn-down slot was re-provisioned.
    LateRebind,
    /// A one-shot instance was leased during teardown.
    Transient,
    /// A thread-exit hook ran.
    ThreadExit,
    /// Statistics were reported.
    Stats,
}

/// One lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindingEvent {
    /// Monotonic record id.
    pub seq: u64,
    pub level: EventLevel,
    pub event: EventKind,
    /// Strategy (or hook) that produced the event.
    pub strategy: &'static str,
    /// Allocator instance involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_id: Option<u32>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
}

struct EventRing {
    entries: [Option<BindingEvent>; EVENT_RING_CAPACITY],
    next: usize,
}

impl EventRing {
    const fn new() -> Self {
        Self {
            entries: [None; EVENT_RING_CAPACITY],
            next: 0,
        }
    }

    fn push(&mut self, event: BindingEvent) {
        self.entries[self.next] = Some(event);
        self.next = (self.next + 1) % EVENT_RING_CAPACITY;
    }
}

static RING: Mutex<EventRing> = parking_lot::const_mutex(EventRing::new());
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Record an event if the configured trace level admits it.
pub fn record(
    level: EventLevel,
    event: EventKind,
    strategy: &'static str,
    alloc_id: Option<u32>,
    outcome: &'static str,
) {
    if !crate::config::trace_level().records(level) {
        return;
    }
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    RING.lock().push(BindingEvent {
        seq,
        level,
        event,
        strategy,
        alloc_id,
        outcome,
    });
}

/// Copy out the retained events, oldest first.
#[must_use]
pub fn recent_events() -> Vec<BindingEvent> {
    let ring = RING.lock();
    let mut out: Vec<BindingEvent> = ring.entries.iter().flatten().copied().collect();
    drop(ring);
    out.sort_unstable_by_key(|e| e.seq);
    out
}

/// Drop every retained event.
pub fn clear_events() {
    let mut ring = RING.lock();
    ring.entries = [None; EVENT_RING_CAPACITY];
    ring.next = 0;
}

/// Serialize events as JSON Lines (one object per line, trailing newline).
pub fn to_jsonl(events: &[BindingEvent]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> BindingEvent {
        BindingEvent {
            seq,
            level: EventLevel::Info,
            event: EventKind::Bind,
            strategy: "test",
            alloc_id: Some(seq as u32),
            outcome: "bound",
        }
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut ring = EventRing::new();
        for seq in 0..(EVENT_RING_CAPACITY as u64 + 10) {
            ring.push(event(seq));
        }
        let min = ring.entries.iter().flatten().map(|e| e.seq).min().unwrap();
        assert_eq!(min, 10);
        assert_eq!(ring.entries.iter().flatten().count(), EVENT_RING_CAPACITY);
    }

    #[test]
    fn jsonl_has_one_object_per_line() {
        let text = to_jsonl(&[event(1), event(2)]).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["event"], "bind");
        assert_eq!(v["level"], "info");
        assert_eq!(v["alloc_id"], 1);
    }

    #[test]
    fn missing_alloc_id_is_omitted() {
        let mut e = event(3);
        e.alloc_id = None;
        e.event = EventKind::LateRebind;
        let text = to_jsonl(&[e]).unwrap();
        assert!(!text.contains("alloc_id"));
        assert!(text.contains("\"late_rebind\""));
    }
}
