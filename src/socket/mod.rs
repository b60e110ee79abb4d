//! Unix domain socket plumbing for the pcapd record stream.
//!
//! # Architecture
//!
//! ```text
//! pcapd (root)                          pcapsock
//! ┌──────────────────┐                ┌──────────────────────────┐
//! │ capture loop     │   records on   │ ServerSocket (backlog 1) │
//! │  UnixStream      │───────────────►│  accept → UnixStream     │
//! │                  │  Unix socket   │  StreamReader + framing  │
//! └──────────────────┘                └────────────┬─────────────┘
//!                                                  │ PacketEvent
//!                                                  ▼
//!                                              EventSink
//! ```
//!
//! # Wire Protocol
//!
//! Fixed 40-byte native-endian header followed by `frame_length` frame bytes.
//! See [`framing`] for the layout and validation rules.

pub mod framing;
pub mod poll;
pub mod server;
pub mod slot;
pub mod stream;
