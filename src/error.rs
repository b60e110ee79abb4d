//! Error types for pcapsock.
//!
//! Only [`SetupError`] ever reaches the caller of
//! [`PacketListener::start`](crate::PacketListener::start). The other
//! types stay inside the reader thread and surface through logs and
//! [`StatsSnapshot`](crate::StatsSnapshot) counters.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to bring the listener up. Nothing is left running.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Socket path does not fit into `sun_path`.
    #[error("socket path too long ({len} bytes, max {max}): {}", .path.display())]
    PathTooLong {
        /// Offending path.
        path: PathBuf,
        /// Path length in bytes.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// Socket path contains an interior NUL byte.
    #[error("socket path contains a NUL byte: {}", .0.display())]
    InvalidPath(PathBuf),

    /// `socket(2)` failed.
    #[error("failed to create socket")]
    Socket(#[source] io::Error),

    /// A stale entry at the socket path could not be removed.
    #[error("failed to remove stale socket {}", .path.display())]
    RemoveStale {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `bind(2)` failed.
    #[error("failed to bind socket {}", .path.display())]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `listen(2)` failed.
    #[error("failed to listen on socket {}", .path.display())]
    Listen {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The reader thread could not be spawned.
    #[error("failed to spawn reader thread")]
    Spawn(#[source] io::Error),

    /// `teardown()` already released the event sink.
    #[error("event sink has been released by teardown")]
    SinkReleased,
}

/// A malformed record. The record is dropped; the stream stays in sync.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// `frame_length` exceeds the producer snaplen.
    #[error("frame length {length} exceeds snaplen {max}")]
    LengthOutOfRange {
        /// Declared frame length.
        length: u32,
        /// Largest valid frame length.
        max: u32,
    },

    /// Frame is too short to contain its link-layer header.
    #[error("frame length {length} is shorter than link header ({offset} bytes)")]
    ShorterThanLinkHeader {
        /// Declared frame length.
        length: u32,
        /// Link-layer header size for the record's link type.
        offset: usize,
    },
}

/// Result of a blocking read that did not complete.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Cancellation was requested while the read was in progress.
    #[error("read cancelled")]
    Cancelled,

    /// Peer closed the stream before the requested bytes arrived.
    #[error("stream closed after {read} of {expected} bytes")]
    Closed {
        /// Bytes requested.
        expected: usize,
        /// Bytes received before end of stream.
        read: usize,
    },

    /// Hard I/O error.
    #[error("stream read failed")]
    Io(#[from] io::Error),
}

/// Why the reader loop stopped.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// Read-level failure or cancellation.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// `accept(2)` failed.
    #[error("accept failed")]
    Accept(#[source] io::Error),

    /// `poll(2)` failed.
    #[error("poll failed")]
    Poll(#[source] io::Error),

    /// `poll(2)` reported an error or hangup with no data pending.
    #[error("socket hung up (revents {0:#x})")]
    Hangup(libc::c_short),

    /// Internal arithmetic invariant broken. Fatal to the loop only.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ReaderError {
    /// Returns `true` for orderly, `stop()`-initiated termination.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Stream(StreamError::Cancelled))
    }

    /// Returns `true` when the producer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Stream(StreamError::Closed { .. }) | Self::Hangup(_)
        )
    }
}
