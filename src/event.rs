//! Decoded per-packet metadata handed to the event sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::socket::framing::RecordHeader;

/// Metadata for one captured packet.
///
/// Field widths follow the host callback contract, which is why lengths are
/// widened to `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEvent {
    /// Owning UID as reported by the producer.
    pub subject_id: i32,
    /// Captured frame length, link layer included.
    pub frame_length: i64,
    /// Length from the IP header to the end of the frame.
    pub ip_payload_length: i64,
    /// IP protocol number (6 = TCP, 17 = UDP, ...), 0 when unknown.
    pub protocol_code: i32,
    /// `true` for transmitted packets.
    pub is_uplink: bool,
    /// Capture time, seconds.
    pub ts_sec: i64,
    /// Capture time, microseconds.
    pub ts_usec: i64,
    /// Producer-side drops before this packet.
    pub drop_count: i32,
    /// Producer interface index.
    pub interface_id: i32,
}

impl PacketEvent {
    /// Build an event from a header and the values derived from its frame.
    pub fn new(header: &RecordHeader, ip_payload_length: usize, protocol_code: u8) -> Self {
        Self {
            subject_id: header.subject_id,
            frame_length: i64::from(header.frame_length),
            ip_payload_length: ip_payload_length as i64,
            protocol_code: i32::from(protocol_code),
            is_uplink: header.is_uplink(),
            ts_sec: header.ts_sec,
            ts_usec: header.ts_usec,
            drop_count: header.drop_count,
            interface_id: header.interface_id,
        }
    }

    /// Capture time as a UTC timestamp, if representable.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.ts_usec.checked_mul(1000)?).ok()?;
        DateTime::from_timestamp(self.ts_sec, nanos)
    }
}
