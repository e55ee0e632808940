//! Configuration system for Lantern.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LANTERN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lantern/config.toml
//!   3. ~/.config/lantern/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LanternConfig {
    pub link: LinkConfig,
    pub timeouts: TimeoutConfig,
}

/// Transport-level tuning. These interact with firmware-side constants —
/// change them only together with a firmware release.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Atomic write limit in bytes for chunked transports.
    pub chunk_size: usize,
    /// Total write attempts before a frame write surfaces as failed.
    pub write_tries: u32,
    /// Fixed wait between write retries, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Per-byte component of the minimum write timeout, in microseconds.
    pub per_byte_timeout_us: u64,
    /// Fixed component of the minimum write timeout, in milliseconds.
    pub min_write_timeout_ms: u64,
    /// Extra wait beyond the declared receive timeout before a response
    /// is considered lost and the channel is reset.
    pub response_grace_ms: u64,
}

/// Default timeouts for network-facing operations. A caller passing no
/// explicit timeout gets the operation-specific value from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub select_ms: u64,
    pub scan_ms: u64,
    pub connect_ms: u64,
    pub write_ms: u64,
    pub request_ms: u64,
    pub clock_ms: u64,
    pub firmware_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LanternConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::wire::DEFAULT_CHUNK_SIZE,
            write_tries: 4,
            retry_backoff_ms: 100,
            per_byte_timeout_us: 50,
            min_write_timeout_ms: 250,
            response_grace_ms: 1000,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            select_ms: 60_000,
            scan_ms: 5_000,
            connect_ms: 10_000,
            write_ms: 5_000,
            request_ms: 10_000,
            clock_ms: 3_000,
            firmware_ms: 600_000,
        }
    }
}

impl TimeoutConfig {
    pub fn select(&self) -> Duration {
        Duration::from_millis(self.select_ms)
    }
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
    pub fn clock(&self) -> Duration {
        Duration::from_millis(self.clock_ms)
    }
    pub fn firmware(&self) -> Duration {
        Duration::from_millis(self.firmware_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lantern")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LanternConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LanternConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LANTERN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LanternConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LANTERN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LANTERN_LINK__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.link.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("LANTERN_LINK__WRITE_TRIES") {
            if let Ok(n) = v.parse() {
                self.link.write_tries = n;
            }
        }
        if let Ok(v) = std::env::var("LANTERN_TIMEOUTS__CONNECT_MS") {
            if let Ok(n) = v.parse() {
                self.timeouts.connect_ms = n;
            }
        }
        if let Ok(v) = std::env::var("LANTERN_TIMEOUTS__REQUEST_MS") {
            if let Ok(n) = v.parse() {
                self.timeouts.request_ms = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = LanternConfig::default();
        assert_eq!(config.link.write_tries, 4);
        assert!(config.link.chunk_size > 0);
        assert!(config.timeouts.connect() > Duration::ZERO);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = LanternConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: LanternConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.link.chunk_size, config.link.chunk_size);
        assert_eq!(parsed.timeouts.firmware_ms, config.timeouts.firmware_ms);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: LanternConfig = toml::from_str("[link]\nchunk_size = 64\n").unwrap();
        assert_eq!(parsed.link.chunk_size, 64);
        assert_eq!(parsed.link.write_tries, 4);
    }
}
