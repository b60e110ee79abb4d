//! Record codec for the pcapd metadata stream.
//!
//! Every record is a fixed 40-byte header in native byte order followed by
//! `frame_length` bytes of captured frame:
//!
//! ```text
//! [i32 subject_id][u32 frame_length][i32 link_type][u32 flags]
//! [i64 ts_sec][i64 ts_usec][i32 drop_count][i32 interface_id]
//! [frame_length bytes of frame]
//! ```
//!
//! There is no magic or resync marker, so the reader must consume exactly
//! `RECORD_HEADER_SIZE + frame_length` bytes per record no matter how the
//! record is judged. Everything here is pure; I/O lives in
//! [`super::stream`].

use crate::constants::{IP_SNIFF_LEN, MAX_SNAPLEN, RECORD_HEADER_SIZE};
use crate::error::FramingError;

/// Raw link-type codes as returned by `pcap_datalink()`.
pub mod link_type {
    /// `DLT_EN10MB`.
    pub const ETHERNET: i32 = 1;
    /// `DLT_RAW` (Linux numbering).
    pub const RAW: i32 = 12;
    /// `DLT_LINUX_SLL`.
    pub const LINUX_SLL: i32 = 113;
    /// `DLT_LINUX_SLL2`.
    pub const LINUX_SLL2: i32 = 276;
}

/// Header flag bit set on transmitted (uplink) packets.
pub const FLAG_TX: u32 = 1 << 0;

/// Link layer of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Frame starts with the IP header.
    Raw,
    /// 14-byte Ethernet II header.
    Ethernet,
    /// 16-byte Linux cooked capture v1 header.
    LinuxCookedV1,
    /// 20-byte Linux cooked capture v2 header.
    LinuxCookedV2,
    /// Anything else; treated as raw IP.
    Unknown(i32),
}

impl LinkType {
    /// Map a raw `link_type` header field.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            link_type::RAW => Self::Raw,
            link_type::ETHERNET => Self::Ethernet,
            link_type::LINUX_SLL => Self::LinuxCookedV1,
            link_type::LINUX_SLL2 => Self::LinuxCookedV2,
            other => Self::Unknown(other),
        }
    }

    /// Raw header value for this link type.
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Raw => link_type::RAW,
            Self::Ethernet => link_type::ETHERNET,
            Self::LinuxCookedV1 => link_type::LINUX_SLL,
            Self::LinuxCookedV2 => link_type::LINUX_SLL2,
            Self::Unknown(raw) => raw,
        }
    }

    /// Bytes preceding the IP header.
    pub fn header_offset(self) -> usize {
        match self {
            Self::Raw | Self::Unknown(_) => 0,
            Self::Ethernet => 14,
            Self::LinuxCookedV1 => 16,
            Self::LinuxCookedV2 => 20,
        }
    }
}

/// Link-layer offset for a raw `link_type` value.
///
/// Unknown link types are logged and assumed to carry raw IP.
pub fn link_header_offset(raw: i32) -> usize {
    let link = LinkType::from_raw(raw);
    if let LinkType::Unknown(code) = link {
        log::warn!("[framing] unknown link type {code}, assuming IP offset 0");
    }
    link.header_offset()
}

/// Transport protocol number from the leading bytes of an IP packet.
///
/// Looks at no more than [`IP_SNIFF_LEN`] bytes. Returns 0 when the version
/// nibble is neither 4 nor 6, or when too few bytes are available to reach
/// the protocol field (10 for IPv4, 7 for IPv6).
pub fn derive_protocol(ip: &[u8]) -> u8 {
    let ip = &ip[..ip.len().min(IP_SNIFF_LEN)];
    let Some(&first) = ip.first() else {
        return 0;
    };
    match first >> 4 {
        4 if ip.len() >= 10 => ip[9],
        6 if ip.len() >= 7 => ip[6],
        _ => 0,
    }
}

/// Short name of an IP protocol number, for log lines.
pub fn protocol_name(code: u8) -> &'static str {
    match code {
        0 => "unknown",
        1 => "ICMP",
        2 => "IGMP",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6-in-IP",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        132 => "SCTP",
        136 => "UDPLite",
        _ => "other",
    }
}

/// One decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Owning UID as reported by the producer.
    pub subject_id: i32,
    /// Captured frame length in bytes.
    pub frame_length: u32,
    /// Raw link-type code (see [`link_type`]).
    pub link_type: i32,
    /// Flag bits; bit 0 is [`FLAG_TX`].
    pub flags: u32,
    /// Capture time, seconds.
    pub ts_sec: i64,
    /// Capture time, microseconds.
    pub ts_usec: i64,
    /// Packets the producer dropped before this one.
    pub drop_count: i32,
    /// Producer interface index.
    pub interface_id: i32,
}

/// How the payload following a header has to be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Zero-length frame: nothing follows, nothing is emitted.
    Empty,
    /// Malformed record: skip `length` bytes, emit nothing.
    Skip {
        /// Payload bytes to discard.
        length: usize,
        /// Why the record was rejected.
        reason: FramingError,
    },
    /// Well-formed frame.
    Packet {
        /// Link-layer bytes to discard before the IP header.
        link_offset: usize,
        /// Bytes from the IP header to the end of the frame.
        ip_length: usize,
    },
}

impl RecordHeader {
    /// Decode a header from its wire bytes.
    pub fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            subject_id: i32::from_ne_bytes(field(bytes, 0)),
            frame_length: u32::from_ne_bytes(field(bytes, 4)),
            link_type: i32::from_ne_bytes(field(bytes, 8)),
            flags: u32::from_ne_bytes(field(bytes, 12)),
            ts_sec: i64::from_ne_bytes(field(bytes, 16)),
            ts_usec: i64::from_ne_bytes(field(bytes, 24)),
            drop_count: i32::from_ne_bytes(field(bytes, 32)),
            interface_id: i32::from_ne_bytes(field(bytes, 36)),
        }
    }

    /// Encode into wire bytes, as the producer writes them.
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.subject_id.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.frame_length.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.link_type.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.ts_sec.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.ts_usec.to_ne_bytes());
        buf[32..36].copy_from_slice(&self.drop_count.to_ne_bytes());
        buf[36..40].copy_from_slice(&self.interface_id.to_ne_bytes());
        buf
    }

    /// Whether the packet was transmitted by the device.
    pub fn is_uplink(&self) -> bool {
        self.flags & FLAG_TX != 0
    }

    /// Decide how the payload after this header is consumed.
    pub fn layout(&self) -> RecordLayout {
        let length = self.frame_length as usize;
        if self.frame_length > MAX_SNAPLEN {
            return RecordLayout::Skip {
                length,
                reason: FramingError::LengthOutOfRange {
                    length: self.frame_length,
                    max: MAX_SNAPLEN,
                },
            };
        }
        if length == 0 {
            return RecordLayout::Empty;
        }

        let link_offset = link_header_offset(self.link_type);
        match length.checked_sub(link_offset) {
            Some(ip_length) => RecordLayout::Packet { link_offset, ip_length },
            None => RecordLayout::Skip {
                length,
                reason: FramingError::ShorterThanLinkHeader {
                    length: self.frame_length,
                    offset: link_offset,
                },
            },
        }
    }
}

/// Copy `N` bytes starting at `at` out of the header buffer.
fn field<const N: usize>(bytes: &[u8; RECORD_HEADER_SIZE], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(frame_length: u32, link_type: i32) -> RecordHeader {
        RecordHeader {
            subject_id: 10_123,
            frame_length,
            link_type,
            flags: 0,
            ts_sec: 1_700_000_000,
            ts_usec: 250_000,
            drop_count: 3,
            interface_id: 2,
        }
    }

    #[test]
    fn test_link_header_offsets() {
        assert_eq!(link_header_offset(link_type::RAW), 0);
        assert_eq!(link_header_offset(link_type::ETHERNET), 14);
        assert_eq!(link_header_offset(link_type::LINUX_SLL), 16);
        assert_eq!(link_header_offset(link_type::LINUX_SLL2), 20);
    }

    #[test]
    fn test_unknown_link_type_has_zero_offset() {
        for raw in [-1, 0, 2, 228, 9999] {
            assert_eq!(link_header_offset(raw), 0, "link type {raw}");
            assert_eq!(LinkType::from_raw(raw), LinkType::Unknown(raw));
        }
    }

    #[test]
    fn test_link_type_raw_mapping_is_stable() {
        for link in [
            LinkType::Raw,
            LinkType::Ethernet,
            LinkType::LinuxCookedV1,
            LinkType::LinuxCookedV2,
        ] {
            assert_eq!(LinkType::from_raw(link.to_raw()), link);
        }
    }

    #[test]
    fn test_derive_protocol_ipv4_tcp() {
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6;
        assert_eq!(derive_protocol(&ip), 6);
        assert_eq!(derive_protocol(&ip[..10]), 6);
    }

    #[test]
    fn test_derive_protocol_ipv4_too_short() {
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[9] = 6;
        assert_eq!(derive_protocol(&ip[..9]), 0);
    }

    #[test]
    fn test_derive_protocol_ipv6_udp() {
        let mut ip = [0u8; 20];
        ip[0] = 0x60;
        ip[6] = 17;
        assert_eq!(derive_protocol(&ip), 17);
        assert_eq!(derive_protocol(&ip[..7]), 17);
        assert_eq!(derive_protocol(&ip[..6]), 0);
    }

    #[test]
    fn test_derive_protocol_unknown_version_and_empty() {
        assert_eq!(derive_protocol(&[]), 0);
        let mut ip = [0u8; 20];
        ip[0] = 0x55;
        ip[9] = 6;
        ip[6] = 17;
        assert_eq!(derive_protocol(&ip), 0);
    }

    #[test]
    fn test_derive_protocol_ignores_bytes_past_sniff_window() {
        let mut ip = vec![0u8; 64];
        ip[0] = 0x45;
        ip[9] = 1;
        assert_eq!(derive_protocol(&ip), 1);
    }

    #[test]
    fn test_decode_reads_fields_at_fixed_offsets() {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&10_050i32.to_ne_bytes());
        bytes[4..8].copy_from_slice(&1500u32.to_ne_bytes());
        bytes[8..12].copy_from_slice(&link_type::LINUX_SLL2.to_ne_bytes());
        bytes[12..16].copy_from_slice(&FLAG_TX.to_ne_bytes());
        bytes[16..24].copy_from_slice(&1_699_999_999i64.to_ne_bytes());
        bytes[24..32].copy_from_slice(&999_999i64.to_ne_bytes());
        bytes[32..36].copy_from_slice(&7i32.to_ne_bytes());
        bytes[36..40].copy_from_slice(&(-1i32).to_ne_bytes());

        let hdr = RecordHeader::decode(&bytes);
        assert_eq!(hdr.subject_id, 10_050);
        assert_eq!(hdr.frame_length, 1500);
        assert_eq!(hdr.link_type, link_type::LINUX_SLL2);
        assert!(hdr.is_uplink());
        assert_eq!(hdr.ts_sec, 1_699_999_999);
        assert_eq!(hdr.ts_usec, 999_999);
        assert_eq!(hdr.drop_count, 7);
        assert_eq!(hdr.interface_id, -1);
        assert_eq!(hdr.encode(), bytes);
    }

    #[test]
    fn test_reserved_flag_bits_do_not_mark_uplink() {
        let mut hdr = header(60, link_type::RAW);
        hdr.flags = 0xFFFF_FFFE;
        assert!(!hdr.is_uplink());
    }

    #[test]
    fn test_layout_zero_length_is_empty() {
        assert_eq!(header(0, link_type::ETHERNET).layout(), RecordLayout::Empty);
    }

    #[test]
    fn test_layout_oversized_frame_is_skipped_in_full() {
        let layout = header(MAX_SNAPLEN + 1, link_type::ETHERNET).layout();
        assert_eq!(
            layout,
            RecordLayout::Skip {
                length: MAX_SNAPLEN as usize + 1,
                reason: FramingError::LengthOutOfRange {
                    length: MAX_SNAPLEN + 1,
                    max: MAX_SNAPLEN,
                },
            }
        );
    }

    #[test]
    fn test_layout_snaplen_frame_is_valid() {
        assert_eq!(
            header(MAX_SNAPLEN, link_type::RAW).layout(),
            RecordLayout::Packet {
                link_offset: 0,
                ip_length: MAX_SNAPLEN as usize,
            }
        );
    }

    #[test]
    fn test_layout_frame_shorter_than_link_header() {
        let layout = header(10, link_type::ETHERNET).layout();
        assert_eq!(
            layout,
            RecordLayout::Skip {
                length: 10,
                reason: FramingError::ShorterThanLinkHeader { length: 10, offset: 14 },
            }
        );
    }

    #[test]
    fn test_layout_frame_equal_to_link_header_has_empty_ip() {
        assert_eq!(
            header(16, link_type::LINUX_SLL).layout(),
            RecordLayout::Packet { link_offset: 16, ip_length: 0 }
        );
    }

    #[test]
    fn test_layout_ethernet_frame() {
        assert_eq!(
            header(54, link_type::ETHERNET).layout(),
            RecordLayout::Packet { link_offset: 14, ip_length: 40 }
        );
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_name(6), "TCP");
        assert_eq!(protocol_name(17), "UDP");
        assert_eq!(protocol_name(58), "ICMPv6");
        assert_eq!(protocol_name(0), "unknown");
        assert_eq!(protocol_name(253), "other");
    }
}
