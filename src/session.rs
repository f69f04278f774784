//! Per-(service, method) session-id sequencing.
//!
//! Session IDs are 16-bit, start at 1 for a fresh stream and wrap from
//! 0xFFFF back to 1; 0 is reserved for "session handling disabled" and is
//! never handed out. The registry is scoped to a runtime instance and is a
//! hot path on every outgoing request, so it shards by key instead of
//! taking one global lock.

use dashmap::DashMap;

/// Monotonic session-id counters, one per (service_id, method_id)
#[derive(Debug, Default)]
pub struct SessionRegistry {
    counters: DashMap<(u16, u16), u16>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current session id for the stream and advance it.
    /// Sequence: 1, 2, .., 0xFFFF, 1, ..
    pub fn next(&self, service_id: u16, method_id: u16) -> u16 {
        let mut entry = self.counters.entry((service_id, method_id)).or_insert(1);
        let current = *entry;
        *entry = if current == 0xFFFF { 1 } else { current + 1 };
        current
    }

    /// Forget the counter of one stream; the next id will be 1 again
    pub fn reset(&self, service_id: u16, method_id: u16) {
        self.counters.remove(&(service_id, method_id));
    }
}
