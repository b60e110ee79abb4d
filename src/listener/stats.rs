//! Listener counters.
//!
//! Written by the reader thread with relaxed atomics and read from any thread
//! through [`ListenerStats::snapshot`]. Counters accumulate across restarts
//! of the same [`PacketListener`](crate::PacketListener).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters shared with the reader thread.
#[derive(Debug, Default)]
pub struct ListenerStats {
    connections: AtomicU64,
    records: AtomicU64,
    events: AtomicU64,
    framing_errors: AtomicU64,
    sink_failures: AtomicU64,
    bytes_consumed: AtomicU64,
    last_drop_count: AtomicI64,
}

/// Point-in-time copy of [`ListenerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Producers accepted.
    pub connections: u64,
    /// Record headers read.
    pub records: u64,
    /// Events handed to the sink.
    pub events: u64,
    /// Records dropped for framing errors.
    pub framing_errors: u64,
    /// Sink calls that returned an error or panicked.
    pub sink_failures: u64,
    /// Bytes read from producers.
    pub bytes_consumed: u64,
    /// `drop_count` of the most recent record.
    pub last_drop_count: i64,
}

impl ListenerStats {
    pub(crate) fn connection_accepted(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, drop_count: i32) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.last_drop_count
            .store(i64::from(drop_count), Ordering::Relaxed);
    }

    pub(crate) fn event_emitted(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sink_failed(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            last_drop_count: self.last_drop_count.load(Ordering::Relaxed),
        }
    }
}
