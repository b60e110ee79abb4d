//! Event sinks: where decoded packets go.
//!
//! The reader thread calls [`EventSink::on_packet`] once per decoded record,
//! in stream order. A sink runs on the reader thread, so it must not block
//! for long; any error it returns (or panic it raises) is logged and the
//! loop moves on to the next record.
//!
//! Provided sinks:
//!
//! - any `Fn(&PacketEvent) -> anyhow::Result<()>` closure,
//! - [`ChannelSink`] for async hosts (tokio unbounded channel),
//! - [`EventBuffer`], a bounded buffer that drops the oldest events,
//! - [`LogSink`], which logs one line per packet.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;

use crate::constants::DEFAULT_EVENT_BUFFER_CAPACITY;
use crate::event::PacketEvent;
use crate::socket::framing::protocol_name;

/// Consumer of decoded packet metadata.
pub trait EventSink: Send + Sync {
    /// Handle one packet.
    ///
    /// # Errors
    ///
    /// Errors are logged by the reader loop and otherwise ignored.
    fn on_packet(&self, event: &PacketEvent) -> Result<()>;
}

impl<F> EventSink for F
where
    F: Fn(&PacketEvent) -> Result<()> + Send + Sync,
{
    fn on_packet(&self, event: &PacketEvent) -> Result<()> {
        self(event)
    }
}

/// Forwards events into a tokio unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<PacketEvent>,
}

impl ChannelSink {
    /// Wrap the sending half of a channel.
    pub fn new(tx: UnboundedSender<PacketEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn on_packet(&self, event: &PacketEvent) -> Result<()> {
        self.tx.send(*event).context("event receiver dropped")
    }
}

/// Fixed-capacity event buffer.
///
/// When full, pushing a new event evicts the oldest one, so a slow consumer
/// sees the most recent traffic instead of stalling the reader thread.
#[derive(Debug)]
pub struct EventBuffer {
    events: Mutex<VecDeque<PacketEvent>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl EventBuffer {
    /// Create a buffer holding at most `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "EventBuffer capacity must be > 0");
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Create a buffer with [`DEFAULT_EVENT_BUFFER_CAPACITY`] slots.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_CAPACITY)
    }

    /// Append an event, evicting the oldest one if the buffer is full.
    pub fn push(&self, event: PacketEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            if evicted.is_power_of_two() {
                log::warn!("[sink] event buffer full, {evicted} event(s) dropped so far");
            }
        }
        events.push_back(event);
    }

    /// Remove and return all buffered events, oldest first.
    pub fn drain(&self) -> Vec<PacketEvent> {
        self.lock().drain(..).collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no events are buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PacketEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl EventSink for EventBuffer {
    fn on_packet(&self, event: &PacketEvent) -> Result<()> {
        self.push(*event);
        Ok(())
    }
}

/// Logs every packet at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn on_packet(&self, event: &PacketEvent) -> Result<()> {
        let ts = event
            .timestamp()
            .map_or_else(|| format!("{}.{:06}", event.ts_sec, event.ts_usec), |t| t.to_rfc3339());
        log::info!(
            "[sink] uid={} len={} ip_len={} proto={}({}) {} ts={} drops={} if={}",
            event.subject_id,
            event.frame_length,
            event.ip_payload_length,
            event.protocol_code,
            protocol_name(u8::try_from(event.protocol_code).unwrap_or(0)),
            if event.is_uplink { "UL" } else { "DL" },
            ts,
            event.drop_count,
            event.interface_id,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::RecordHeader;

    fn event(subject_id: i32) -> PacketEvent {
        let header = RecordHeader {
            subject_id,
            frame_length: 60,
            ..RecordHeader::default()
        };
        PacketEvent::new(&header, 60, 6)
    }

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |e: &PacketEvent| -> Result<()> {
            seen.lock().unwrap().push(e.subject_id);
            Ok(())
        };
        sink.on_packet(&event(1)).unwrap();
        sink.on_packet(&event(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_buffer_keeps_order() {
        let buffer = EventBuffer::new(8);
        for id in 0..5 {
            buffer.on_packet(&event(id)).unwrap();
        }
        assert_eq!(buffer.len(), 5);
        let ids: Vec<i32> = buffer.drain().iter().map(|e| e.subject_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_buffer_evicts_oldest_when_full() {
        let buffer = EventBuffer::new(3);
        for id in 0..5 {
            buffer.push(event(id));
        }
        assert_eq!(buffer.evicted(), 2);
        let ids: Vec<i32> = buffer.drain().iter().map(|e| e.subject_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = EventBuffer::new(0);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(EventBuffer::default().capacity(), DEFAULT_EVENT_BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.on_packet(&event(7)).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject_id, 7);
    }

    #[test]
    fn test_channel_sink_errors_after_receiver_drop() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let sink = ChannelSink::new(tx);
        let err = sink.on_packet(&event(1)).unwrap_err();
        assert!(err.to_string().contains("receiver dropped"));
    }

    #[test]
    fn test_log_sink_never_fails() {
        LogSink.on_packet(&event(1)).unwrap();
    }
}
