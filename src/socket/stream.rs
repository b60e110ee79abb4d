//! Cancellable "exactly N bytes" reads over a blocking stream.
//!
//! The reader loop pulls every byte of the record stream through a
//! [`StreamReader`]. Both primitives retry transient errors (interrupted
//! syscalls, read timeouts) after a short backoff and re-check the shared
//! [`CancellationToken`] between syscalls, so `stop()` is observed at the
//! next wake-up even when the socket never goes quiet.

use std::io::{self, Read};
use std::thread;

use tokio_util::sync::CancellationToken;

use crate::constants::{DISCARD_CHUNK_SIZE, READ_RETRY_BACKOFF};
use crate::error::StreamError;

/// Blocking reader with cooperative cancellation.
#[derive(Debug)]
pub struct StreamReader<R> {
    inner: R,
    cancel: CancellationToken,
    scratch: Vec<u8>,
    consumed: u64,
}

impl<R: Read> StreamReader<R> {
    /// Wrap `inner`, observing `cancel` between syscalls.
    pub fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            scratch: vec![0u8; DISCARD_CHUNK_SIZE],
            consumed: 0,
        }
    }

    /// Total bytes consumed from the stream so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Borrow the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Fill `buf` completely.
    ///
    /// # Errors
    ///
    /// [`StreamError::Cancelled`] if cancellation is observed before the
    /// buffer is full, [`StreamError::Closed`] on end of stream, and
    /// [`StreamError::Io`] on any non-transient read error.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        let expected = buf.len();
        let mut filled = 0;
        while filled < expected {
            let n = read_once(&mut self.inner, &self.cancel, &mut buf[filled..], expected, filled)?;
            filled += n;
            self.consumed += n as u64;
        }
        Ok(())
    }

    /// Read and drop exactly `count` bytes.
    ///
    /// Reads in chunks of at most [`DISCARD_CHUNK_SIZE`] bytes regardless of
    /// `count`. Same error contract as [`Self::read_exact`].
    pub fn discard_exact(&mut self, count: usize) -> Result<(), StreamError> {
        let mut skipped = 0;
        while skipped < count {
            let want = (count - skipped).min(self.scratch.len());
            let n = read_once(
                &mut self.inner,
                &self.cancel,
                &mut self.scratch[..want],
                count,
                skipped,
            )?;
            skipped += n;
            self.consumed += n as u64;
        }
        Ok(())
    }
}

/// One successful `read(2)`, retrying transient failures.
///
/// `expected`/`done` only feed the [`StreamError::Closed`] report.
fn read_once<R: Read>(
    inner: &mut R,
    cancel: &CancellationToken,
    buf: &mut [u8],
    expected: usize,
    done: usize,
) -> Result<usize, StreamError> {
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        match inner.read(buf) {
            Ok(0) => {
                // stop() shuts the socket down, which reads as EOF here.
                if cancel.is_cancelled() {
                    return Err(StreamError::Cancelled);
                }
                return Err(StreamError::Closed { expected, read: done });
            }
            Ok(n) => return Ok(n),
            Err(e) if is_transient(&e) => thread::sleep(READ_RETRY_BACKOFF),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(StreamError::Cancelled);
                }
                return Err(StreamError::Io(e));
            }
        }
    }
}

/// Errors that only mean "try again".
///
/// A socket read timeout surfaces as `WouldBlock` on Unix and `TimedOut`
/// elsewhere.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
