//! Server side of the producer socket.
//!
//! pcapd connects to a filesystem Unix socket that we own. The socket is
//! created by hand instead of via `UnixListener::bind` so that we control
//! `SO_REUSEADDR` and the listen backlog (1: there is only ever one
//! producer).

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::constants::{LISTEN_BACKLOG, MAX_SOCKET_PATH};
use crate::error::SetupError;

/// Bound and listening producer socket.
#[derive(Debug)]
pub struct ServerSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ServerSocket {
    /// Create, bind and listen on `path`.
    ///
    /// Removes any stale entry at `path` first and restricts the socket file
    /// to its owner. On failure the descriptor is closed and no socket file
    /// is left behind.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] naming the step that failed.
    pub fn open(path: &Path) -> Result<Self, SetupError> {
        let path_bytes = path.as_os_str().as_bytes();
        if path_bytes.len() >= MAX_SOCKET_PATH {
            return Err(SetupError::PathTooLong {
                path: path.to_path_buf(),
                len: path_bytes.len(),
                max: MAX_SOCKET_PATH - 1,
            });
        }
        if CString::new(path_bytes).is_err() {
            return Err(SetupError::InvalidPath(path.to_path_buf()));
        }

        let fd = new_stream_socket().map_err(SetupError::Socket)?;
        set_reuse_addr(&fd);

        match fs::remove_file(path) {
            Ok(()) => log::debug!("[server] removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SetupError::RemoveStale {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        bind(&fd, path_bytes).map_err(|source| SetupError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                log::warn!("[server] could not restrict {} to 0600: {e}", path.display());
            }
        }

        // SAFETY: `fd` is a bound socket owned by this function.
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
            let source = io::Error::last_os_error();
            let _ = fs::remove_file(path);
            return Err(SetupError::Listen {
                path: path.to_path_buf(),
                source,
            });
        }

        log::info!(
            "[server] listening on {} (fd {}, backlog {LISTEN_BACKLOG})",
            path.display(),
            fd.as_raw_fd()
        );

        Ok(Self {
            listener: UnixListener::from(fd),
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().map(|(stream, _addr)| stream)
    }

    /// Shut the listening socket down so a blocked `accept`/`poll` wakes up.
    ///
    /// The descriptor stays open until the last reference drops.
    pub fn shutdown(&self) {
        // SAFETY: the descriptor is owned by `self.listener` and still open.
        let rc = unsafe { libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR) };
        if rc < 0 {
            // ENOTCONN on platforms that refuse shutdown on listeners; the
            // poll timeout covers them.
            log::debug!(
                "[server] shutdown on listener: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Filesystem path the socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for ServerSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// `socket(AF_UNIX, SOCK_STREAM)` with close-on-exec set.
fn new_stream_socket() -> io::Result<OwnedFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ty = libc::SOCK_STREAM;

    // SAFETY: plain socket(2) call; ownership of the result is taken below.
    let raw = unsafe { libc::socket(libc::AF_UNIX, ty, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor nobody else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        // SAFETY: `fd` is valid for the duration of the call.
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(fd)
}

/// Best-effort `SO_REUSEADDR`; failure only gets logged.
fn set_reuse_addr(fd: &OwnedFd) {
    let reuse: libc::c_int = 1;
    // SAFETY: `reuse` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&reuse as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        log::warn!("[server] SO_REUSEADDR failed: {}", io::Error::last_os_error());
    }
}

/// `bind(2)` `fd` to a filesystem path that already passed length checks.
fn bind(fd: &OwnedFd, path: &[u8]) -> io::Result<()> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    if path.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(path) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: `addr` is a fully initialised sockaddr_un and the length
    // passed is its size.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
