//! Configuration loading.
//!
//! Settings come from an optional JSON file, then environment overrides:
//!
//! - `PCAPSOCK_SOCKET`: socket path
//! - `PCAPSOCK_POLL_MS`: poll interval in milliseconds

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_EVENT_BUFFER_CAPACITY, POLL_INTERVAL, SOCKET_FILE_NAME};
use crate::sink::EventBuffer;

/// Environment variable overriding [`ListenerConfig::socket_path`].
pub const ENV_SOCKET: &str = "PCAPSOCK_SOCKET";

/// Environment variable overriding [`ListenerConfig::poll_interval_ms`].
pub const ENV_POLL_MS: &str = "PCAPSOCK_POLL_MS";

/// Listener settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Filesystem path of the producer socket.
    pub socket_path: PathBuf,
    /// Bound on each blocking wait in the reader loop, in milliseconds.
    pub poll_interval_ms: u64,
    /// Capacity of the CLI's event buffer.
    pub event_buffer_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            socket_path: Self::default_socket_path(),
            poll_interval_ms: u64::try_from(POLL_INTERVAL.as_millis()).unwrap_or(1000),
            event_buffer_capacity: DEFAULT_EVENT_BUFFER_CAPACITY,
        }
    }
}

impl ListenerConfig {
    /// `<cache dir>/pcapsock/pcapsock`, or `/tmp/pcapsock/pcapsock` when the
    /// platform has no cache directory.
    pub fn default_socket_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pcapsock")
            .join(SOCKET_FILE_NAME)
    }

    /// Default location of the configuration file.
    pub fn default_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pcapsock").join("config.json"))
    }

    /// Load the configuration, then apply environment overrides.
    ///
    /// An explicit `path` must exist. Without one, the default config file
    /// is read if present, otherwise defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_file() {
                Some(default) if default.exists() => Self::load_from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup(ENV_SOCKET) {
            if !socket.is_empty() {
                self.socket_path = PathBuf::from(socket);
            }
        }

        if let Some(poll_ms) = lookup(ENV_POLL_MS) {
            match poll_ms.parse::<u64>() {
                Ok(ms) if ms > 0 => self.poll_interval_ms = ms,
                _ => log::warn!("[config] ignoring invalid {ENV_POLL_MS}={poll_ms}"),
            }
        }
    }

    /// Poll interval as a [`Duration`], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Event buffer sized by `event_buffer_capacity`, at least one slot.
    pub fn event_buffer(&self) -> EventBuffer {
        EventBuffer::new(self.event_buffer_capacity.max(1))
    }

    /// Create the socket's parent directory, owner-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_socket_dir(&self) -> Result<()> {
        let Some(dir) = self.socket_path.parent() else {
            return Ok(());
        };
        if dir.as_os_str().is_empty() || dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to restrict {}", dir.display()))?;
        }
        Ok(())
    }
}
