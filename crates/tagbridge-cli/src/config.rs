//! Configuration file.
//!
//! ```toml
//! log_filter = "info,tagbridge_hardware=debug"
//!
//! [scan]
//! timeout_ms = 30000
//! mode = "single-shot"     # single-shot | continuous
//! debounce_ms = 1000
//!
//! [manager]
//! poll_interval_ms = 500
//! max_consecutive_failures = 3
//!
//! [manager.reconnect]
//! base_delay_ms = 500
//! max_attempts = 5
//!
//! [proximity]
//! trusted_origins = ["https://pos.example.com"]
//!
//! [server]
//! bind_addr = "0.0.0.0:3001"
//! ```
//!
//! Every section is optional; missing values take their defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tagbridge_hardware::ManagerConfig;
use tagbridge_hardware::drivers::{DaemonConfig, ProximityConfig, UsbConfig};
use tagbridge_network::ServerConfig;
use tagbridge_session::ScanConfig;

pub const DEFAULT_CONFIG_FILE: &str = "tagbridge.toml";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Default tracing filter; `RUST_LOG` takes precedence.
    pub log_filter: String,
    pub scan: ScanConfig,
    pub manager: ManagerConfig,
    pub usb: UsbConfig,
    pub daemon: DaemonConfig,
    pub proximity: ProximityConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            scan: ScanConfig::default(),
            manager: ManagerConfig::default(),
            usb: UsbConfig::default(),
            daemon: DaemonConfig::default(),
            proximity: ProximityConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid configuration")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Load the explicit path if given, otherwise `tagbridge.toml` in the
    /// working directory if present, otherwise defaults.
    ///
    /// Returns the file that was read, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.is_file() {
            return Ok((Self::from_file(fallback)?, Some(fallback.to_path_buf())));
        }
        Ok((Self::default(), None))
    }

    /// Daemon settings with each poll bounded by the scan deadline.
    pub fn effective_daemon(&self) -> DaemonConfig {
        self.daemon.clone().capped_to(self.scan.timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tagbridge_session::ScanMode;

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(AppConfig::from_toml("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            log_filter = "debug"

            [scan]
            mode = "continuous"

            [manager.reconnect]
            max_attempts = 2

            [proximity]
            trusted_origins = ["https://pos.example.com"]

            [server]
            bind_addr = "127.0.0.1:4000"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.scan.mode, ScanMode::Continuous);
        assert_eq!(config.scan.timeout(), Duration::from_secs(30));
        assert_eq!(config.manager.reconnect.max_attempts, 2);
        assert_eq!(config.manager.reconnect.base_delay_ms, 500);
        assert!(config.proximity.is_secure());
        assert_eq!(config.server.bind_addr.port(), 4000);
        assert_eq!(config.usb, UsbConfig::default());
    }

    #[test]
    fn test_daemon_poll_never_outlives_scan() {
        let config = AppConfig::from_toml(
            r#"
            [scan]
            timeout_ms = 5000

            [daemon]
            poll_timeout_ms = 20000
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.poll_timeout_ms, 20_000);
        assert_eq!(config.effective_daemon().poll_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_section_rejected() {
        assert!(AppConfig::from_toml("[turnstile]\nenabled = true").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("tagbridge-{}.toml", uuid::Uuid::new_v4()));
        assert!(AppConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("tagbridge-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[scan]\ntimeout_ms = 5000\n").unwrap();

        let (config, source) = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scan.timeout_ms, 5_000);
        assert_eq!(source.as_deref(), Some(path.as_path()));

        std::fs::remove_file(&path).unwrap();
    }
}
