//! Listener lifecycle: start, stop, teardown.
//!
//! # Architecture
//!
//! ```text
//! control thread(s)                     reader thread
//! ┌───────────────────────┐            ┌─────────────────────────────┐
//! │ PacketListener        │  spawn     │ reader::run                 │
//! │  start(path) ─────────┼───────────►│  accept_client (poll+accept)│
//! │  stop()               │            │  serve_client  (poll+read)  │
//! │   cancel token        │            │   └─► EventSink::on_packet  │
//! │   take+shutdown slots │──wakes────►│                             │
//! │   join ◄──────────────┼────────────┤  exit (alive = false)       │
//! └───────────────────────┘            └─────────────────────────────┘
//!             │   Shared { server slot, client slot, cancel   │
//!             └──────────  token, alive flag, stats }  ───────┘
//! ```
//!
//! Both sockets live in [`SocketSlot`]s: `stop()` and the reader thread
//! race to take them, the winner shuts the socket down, and the descriptor
//! closes when the last `Arc` goes away.
//!
//! # Locking
//!
//! `lifecycle` serializes `start`/`stop` and is held across the reader
//! join, so concurrent `stop()` callers all return after the thread exited.
//! Nothing the reader thread can reach from a sink waits on it:
//! `is_running`, `socket_path`, `stats` and `Debug` read the alive flag,
//! the `socket_path` mutex and the counters. `start`/`stop` called from the
//! listener's own sink never touch `lifecycle`; `stop()` there only cancels
//! and shuts the sockets down, and a later `stop()` from another thread
//! joins.

mod reader;
pub mod stats;

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::constants::{POLL_INTERVAL, READER_THREAD_NAME};
use crate::error::SetupError;
use crate::sink::EventSink;
use crate::socket::server::ServerSocket;
use crate::socket::slot::SocketSlot;
use stats::{ListenerStats, StatsSnapshot};

/// State reachable from both the control plane and the reader thread.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) server: SocketSlot<ServerSocket>,
    pub(crate) client: SocketSlot<UnixStream>,
    pub(crate) cancel: Mutex<CancellationToken>,
    /// Set by `start` before spawning, cleared by the reader on exit.
    pub(crate) alive: AtomicBool,
    pub(crate) stats: ListenerStats,
}

/// A spawned reader thread and the socket file it serves.
struct Running {
    handle: JoinHandle<()>,
    socket_path: PathBuf,
}

/// Owns the producer socket and the reader thread.
///
/// All methods take `&self` and may be called from any thread, including
/// from inside the listener's own event sink.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pcapsock::{PacketListener, sink::EventBuffer};
///
/// let buffer = Arc::new(EventBuffer::with_default_capacity());
/// let listener = PacketListener::new(buffer.clone());
/// listener.start("/tmp/pcapsock.sock")?;
/// // ... pcapd connects and streams records ...
/// listener.stop();
/// for event in buffer.drain() {
///     println!("{} bytes from uid {}", event.frame_length, event.subject_id);
/// }
/// # Ok::<(), pcapsock::SetupError>(())
/// ```
pub struct PacketListener {
    shared: Arc<Shared>,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    lifecycle: Mutex<Option<Running>>,
    socket_path: Mutex<Option<PathBuf>>,
    poll_interval: Duration,
}

impl PacketListener {
    /// Create a stopped listener that will deliver events to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            sink: Mutex::new(Some(sink)),
            lifecycle: Mutex::new(None),
            socket_path: Mutex::new(None),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Create a stopped listener using the timing from `config`.
    pub fn from_config(sink: Arc<dyn EventSink>, config: &ListenerConfig) -> Self {
        Self::new(sink).with_poll_interval(config.poll_interval())
    }

    /// Override the bound on each blocking wait (default one second).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Bind `path` and start the reader thread.
    ///
    /// Does nothing if the reader thread is alive. A reader that already
    /// exited (the producer disconnected) is reaped and a fresh listener is
    /// started in its place.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] if the socket cannot be set up, the thread
    /// cannot be spawned, or [`teardown`](Self::teardown) already released
    /// the sink. Nothing is left running on error.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<(), SetupError> {
        if reader::is_reader_thread_of(&self.shared) {
            log::debug!("[listener] start() from own reader thread, already running");
            return Ok(());
        }

        let path = path.as_ref();
        let mut lifecycle = lock(&self.lifecycle);
        if self.shared.alive.load(Ordering::Acquire) {
            log::debug!("[listener] already running");
            return Ok(());
        }
        if let Some(finished) = lifecycle.take() {
            log::debug!("[listener] reaping finished reader thread");
            self.finish(finished);
        }

        let sink = lock(&self.sink)
            .as_ref()
            .map(Arc::clone)
            .ok_or(SetupError::SinkReleased)?;

        let server = Arc::new(ServerSocket::open(path)?);
        let cancel = CancellationToken::new();
        *lock(&self.shared.cancel) = cancel.clone();
        if let Some(stale) = self.shared.server.put(Arc::clone(&server)) {
            stale.shutdown();
        }

        let ctx = reader::ReaderContext {
            server,
            shared: Arc::clone(&self.shared),
            sink,
            cancel,
            poll_interval: self.poll_interval,
        };
        self.shared.alive.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(READER_THREAD_NAME.to_string())
            .spawn(move || reader::run(ctx));

        match spawned {
            Ok(handle) => {
                log::info!("[listener] started on {}", path.display());
                *lock(&self.socket_path) = Some(path.to_path_buf());
                *lifecycle = Some(Running {
                    handle,
                    socket_path: path.to_path_buf(),
                });
                Ok(())
            }
            Err(e) => {
                self.shared.alive.store(false, Ordering::Release);
                self.interrupt();
                remove_socket_file(path);
                Err(SetupError::Spawn(e))
            }
        }
    }

    /// Stop the reader thread and release both sockets.
    ///
    /// Idempotent. When it returns, the reader thread has exited, no further
    /// sink call will start, and the socket file is gone. From inside this
    /// listener's sink it only requests the stop; the thread exits after the
    /// sink returns.
    pub fn stop(&self) {
        if reader::is_reader_thread_of(&self.shared) {
            log::debug!("[listener] stop() from own reader thread, not joining");
            self.interrupt();
            return;
        }

        let mut lifecycle = lock(&self.lifecycle);
        self.interrupt();
        if let Some(running) = lifecycle.take() {
            self.finish(running);
            log::info!("[listener] stopped");
        }
    }

    /// [`stop`](Self::stop), then release the event sink.
    ///
    /// Safe to call repeatedly. Any later [`start`](Self::start) fails with
    /// [`SetupError::SinkReleased`].
    pub fn teardown(&self) {
        self.stop();
        if lock(&self.sink).take().is_some() {
            log::info!("[listener] event sink released");
        }
    }

    /// Whether the reader thread is alive.
    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Socket path of the current (or last, not yet reaped) reader thread.
    pub fn socket_path(&self) -> Option<PathBuf> {
        lock(&self.socket_path).clone()
    }

    /// Counters accumulated over the lifetime of this listener.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Cancel and shut down whatever sockets are currently published.
    fn interrupt(&self) {
        lock(&self.shared.cancel).cancel();
        if let Some(client) = self.shared.client.take() {
            reader::shutdown_client(&client);
        }
        if let Some(server) = self.shared.server.take() {
            server.shutdown();
        }
    }

    /// Join a reader thread and clean up after it.
    fn finish(&self, running: Running) {
        if running.handle.join().is_err() {
            log::error!("[listener] reader thread panicked");
        }
        self.shared.alive.store(false, Ordering::Release);
        if let Some(server) = self.shared.server.take() {
            server.shutdown();
        }
        remove_socket_file(&running.socket_path);
        *lock(&self.socket_path) = None;
    }
}

impl fmt::Debug for PacketListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketListener")
            .field("socket_path", &self.socket_path())
            .field("running", &self.is_running())
            .field("poll_interval", &self.poll_interval)
            .field("sink_attached", &lock(&self.sink).is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for PacketListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("[listener] removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[listener] could not remove {}: {e}", path.display()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
