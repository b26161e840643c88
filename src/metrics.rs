use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Relay-wide counters, incremented from the hot path and read by the
/// status endpoint. Instance-scoped so concurrently running relays (tests)
/// do not share state.
#[derive(Default)]
pub struct RelayCounters {
    dropped_events: AtomicU64,
    timed_out_commands: AtomicU64,
    extension_replacements: AtomicU64,
    unknown_responses: AtomicU64,
    unowned_events: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub dropped_events: u64,
    pub timed_out_commands: u64,
    pub extension_replacements: u64,
    pub unknown_responses: u64,
    pub unowned_events: u64,
}

impl RelayCounters {
    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out_commands(&self, count: u64) {
        self.timed_out_commands.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_extension_replacement(&self) {
        self.extension_replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_response(&self) {
        self.unknown_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unowned_event(&self) {
        self.unowned_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            timed_out_commands: self.timed_out_commands.load(Ordering::Relaxed),
            extension_replacements: self.extension_replacements.load(Ordering::Relaxed),
            unknown_responses: self.unknown_responses.load(Ordering::Relaxed),
            unowned_events: self.unowned_events.load(Ordering::Relaxed),
        }
    }
}
