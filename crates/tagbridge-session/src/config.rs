use serde::{Deserialize, Serialize};
use std::time::Duration;
use tagbridge_core::constants::{DEFAULT_DEBOUNCE_MS, DEFAULT_SCAN_TIMEOUT_MS};

/// What happens after a card is read during a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
    /// Stop the scan after the first read.
    #[default]
    SingleShot,
    /// Keep scanning until stopped or the deadline elapses.
    Continuous,
}

/// Scan session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan deadline in milliseconds.
    pub timeout_ms: u64,

    pub mode: ScanMode,

    /// Window in which a repeated read of the same tag is suppressed.
    pub debounce_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            mode: ScanMode::SingleShot,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
