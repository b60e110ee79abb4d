//! pcapsock - packet-stream listener for pcapd.
//!
//! A privileged capture helper (pcapd) connects to a Unix socket owned by
//! this crate and streams fixed-size record headers, each followed by the
//! captured frame. pcapsock frames the stream, skips the link-layer header,
//! sniffs the transport protocol from the IP header and hands one
//! [`PacketEvent`] per packet to an [`EventSink`].
//!
//! # Architecture
//!
//! - **PacketListener** - owns the server socket and the reader thread
//! - **Reader loop** - accept one producer, frame records, emit events
//! - **Framing** - record header codec and link-layer offsets
//! - **Sinks** - closures, channels, bounded buffers, logging
//!
//! # Modules
//!
//! - [`listener`] - lifecycle (`start`/`stop`/`teardown`) and statistics
//! - [`socket`] - server socket, framing codec, cancellable reads
//! - [`sink`] - the [`EventSink`] trait and stock sinks
//! - [`config`] - configuration loading

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod listener;
pub mod sink;
pub mod socket;

// Re-export commonly used types
pub use config::ListenerConfig;
pub use error::{FramingError, ReaderError, SetupError, StreamError};
pub use event::PacketEvent;
pub use listener::stats::StatsSnapshot;
pub use listener::PacketListener;
pub use sink::EventSink;
