//! Bounded `poll(2)` wait on a single descriptor.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Outcome of one [`poll_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or a pending connection, or EOF) can be read.
    Readable,
    /// The timeout elapsed with nothing to read.
    TimedOut,
    /// Error, hangup or invalid descriptor with nothing left to read.
    Hangup(libc::c_short),
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// `POLLIN` wins over `POLLHUP`: a producer that writes its last records
/// and closes is still drained, and the following read reports the EOF.
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(Readiness::TimedOut);
    }

    if pfd.revents & libc::POLLIN != 0 {
        Ok(Readiness::Readable)
    } else if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        Ok(Readiness::Hangup(pfd.revents))
    } else {
        Ok(Readiness::TimedOut)
    }
}
