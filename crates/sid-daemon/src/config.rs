//! Daemon configuration.
//!
//! Configuration comes from an optional TOML file with serde defaults;
//! command-line flags override individual values on top. Durations accept
//! humantime strings (`"5s"`, `"250ms"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_SOCKET_PATH;

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid TOML or violates the schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidConfig {
    /// Listening socket; a leading `@` selects the abstract namespace.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// How long an idle worker is kept before it is reaped.
    #[serde(default = "default_idle_timeout")]
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Upper bound on a request frame; oversized frames are refused before
    /// allocation.
    #[serde(default = "default_frame_limit")]
    pub frame_limit: usize,

    /// Initial capacity of a worker's key-value store.
    #[serde(default = "default_kv_initial_size")]
    pub kv_initial_size: usize,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

const fn default_idle_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_frame_limit() -> usize {
    16 * 1024 * 1024
}

const fn default_kv_initial_size() -> usize {
    32
}

impl Default for SidConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_timeout: default_idle_timeout(),
            frame_limit: default_frame_limit(),
            kv_initial_size: default_kv_initial_size(),
        }
    }
}

impl SidConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// I/O and parse failures; a missing file is an I/O error — callers
    /// treat an absent file as defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SidConfig::default();
        assert_eq!(config.socket_path, "@sid-ubridge.socket");
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.frame_limit, 16 * 1024 * 1024);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: SidConfig =
            toml::from_str("socket_path = \"/run/sid/test.socket\"\nidle_timeout = \"250ms\"\n")
                .unwrap();
        assert_eq!(config.socket_path, "/run/sid/test.socket");
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
        assert_eq!(config.kv_initial_size, 32);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sid.toml");
        std::fs::write(&path, "frame_limit = 4096\n").unwrap();

        let config = SidConfig::from_file(&path).unwrap();
        assert_eq!(config.frame_limit, 4096);
        assert!(SidConfig::from_file(dir.path().join("absent.toml")).is_err());
    }
}
