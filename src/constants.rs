//! Wire-format and runtime constants for pcapsock.
//!
//! Constants are grouped by domain. Values that describe the pcapd record
//! format must match the producer exactly; the timing values only bound
//! liveness and can be overridden through [`crate::config::ListenerConfig`].

use std::time::Duration;

// ============================================================================
// Wire format
// ============================================================================

/// Largest `frame_length` a producer may declare.
///
/// pcapd captures with a 65535-byte snaplen; anything larger is a framing
/// error and the declared payload is skipped.
pub const MAX_SNAPLEN: u32 = 65_535;

/// Size of one encoded record header.
///
/// `subject_id:i32, frame_length:u32, link_type:i32, flags:u32,
/// ts_sec:i64, ts_usec:i64, drop_count:i32, interface_id:i32`.
pub const RECORD_HEADER_SIZE: usize = 40;

/// Number of leading IP bytes read for protocol sniffing.
pub const IP_SNIFF_LEN: usize = 20;

/// Scratch buffer size used when discarding payload bytes.
pub const DISCARD_CHUNK_SIZE: usize = 4096;

// ============================================================================
// Socket
// ============================================================================

/// Listen backlog. The producer is a single pcapd instance.
pub const LISTEN_BACKLOG: libc::c_int = 1;

/// Portable `sun_path` bound (104 on macOS, 108 on Linux).
pub const MAX_SOCKET_PATH: usize = 104;

/// File name of the listener socket inside the cache directory.
pub const SOCKET_FILE_NAME: &str = "pcapsock";

/// Name given to the background reader thread.
pub const READER_THREAD_NAME: &str = "pcapsock-reader";

// ============================================================================
// Timing
// ============================================================================

/// Default bound on a single `poll` wait in the reader loop.
///
/// Cancellation is normally observed immediately because `stop()` shuts the
/// sockets down; this interval only guarantees the loop re-checks the
/// cancellation token at least once per second.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff between retries of an interrupted or would-block read.
pub const READ_RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Main-thread tick in the CLI while waiting for a shutdown signal.
pub const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Sinks
// ============================================================================

/// Default capacity of [`crate::sink::EventBuffer`].
pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 512;
