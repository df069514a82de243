//! Browser-native proximity transport.
//!
//! Platform proximity scanning only runs inside a browser page served from a
//! trusted origin. The page forwards every scanned serial number to the
//! server, which pushes it into a [`ProximityFeed`]. The [`ProximityDriver`]
//! is the subscribing end of that feed.
//!
//! ```text
//! browser page ──ws──► ControlServer ──► ProximityFeed ──► ProximityDriver ──► DeviceManager
//! ```
//!
//! # Examples
//!
//! ```
//! use tagbridge_hardware::drivers::proximity::{ProximityConfig, ProximityDriver, ProximityFeed};
//! use tagbridge_hardware::traits::{EventTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() -> tagbridge_hardware::Result<()> {
//!     let feed = ProximityFeed::new();
//!     let config = ProximityConfig::trusting(["https://pos.example.com"]);
//!     let mut driver = ProximityDriver::new(config, feed.clone());
//!
//!     let handle = driver.open().await?;
//!     feed.push("04:a1:b2:c3")?;
//!
//!     let raw = driver.next_event(&handle).await?;
//!     assert_eq!(raw.payload.as_text(), Some("04:a1:b2:c3"));
//!     Ok(())
//! }
//! ```

use crate::error::{HardwareError, Result};
use crate::traits::{EventTransport, Transport};
use crate::types::{DeviceHandle, DeviceInfo};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tagbridge_core::{RawReadEvent, TransportKind};
use tokio::sync::mpsc;
use tracing::debug;

const FEED_CAPACITY: usize = 32;

/// Proximity forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Accept `proximity-read` messages at all.
    pub enabled: bool,

    /// Page origins allowed to forward reads (e.g., "https://pos.example.com").
    pub trusted_origins: Vec<String>,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_origins: Vec::new(),
        }
    }
}

impl ProximityConfig {
    /// Enabled configuration trusting the given origins.
    pub fn trusting<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            trusted_origins: origins.into_iter().map(Into::into).collect(),
        }
    }

    /// The transport is only usable when at least one origin is trusted.
    pub fn is_secure(&self) -> bool {
        self.enabled && !self.trusted_origins.is_empty()
    }

    /// Check a WebSocket `Origin` header against the trusted list.
    ///
    /// ```
    /// use tagbridge_hardware::drivers::proximity::ProximityConfig;
    ///
    /// let config = ProximityConfig::trusting(["https://pos.example.com"]);
    /// assert!(config.is_trusted(Some("https://pos.example.com/")));
    /// assert!(!config.is_trusted(Some("http://pos.example.com")));
    /// assert!(!config.is_trusted(None));
    /// ```
    pub fn is_trusted(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.trim_end_matches('/');
        self.enabled
            && self
                .trusted_origins
                .iter()
                .any(|trusted| trusted.trim_end_matches('/').eq_ignore_ascii_case(origin))
    }
}

/// Input forwarded by a browser page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityInput {
    /// A scanned serial number.
    Read(String),
    /// The page's proximity scan failed.
    Error(String),
}

/// Publishing end of the proximity transport.
///
/// Cheap to clone. Pushing fails while no driver is subscribed, so forwarded
/// reads never queue up behind a closed subscription.
#[derive(Debug, Clone, Default)]
pub struct ProximityFeed {
    slot: Arc<Mutex<Option<mpsc::Sender<ProximityInput>>>>,
}

impl ProximityFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a driver is subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Forward a scanned serial number.
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` if no driver is subscribed, or a communication
    /// error if the driver is not keeping up.
    pub fn push(&self, serial: impl Into<String>) -> Result<()> {
        self.send(ProximityInput::Read(serial.into()))
    }

    /// Forward a scan failure reported by the page.
    pub fn report_error(&self, message: impl Into<String>) -> Result<()> {
        self.send(ProximityInput::Error(message.into()))
    }

    fn send(&self, input: ProximityInput) -> Result<()> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = slot
            .as_ref()
            .ok_or_else(|| HardwareError::disconnected("proximity feed has no subscriber"))?;

        tx.try_send(input).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                HardwareError::communication("proximity feed is full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                HardwareError::disconnected("proximity subscription closed")
            }
        })
    }

    fn install(&self, tx: mpsc::Sender<ProximityInput>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Subscribing end of the proximity transport.
#[derive(Debug)]
pub struct ProximityDriver {
    config: ProximityConfig,
    feed: ProximityFeed,
    rx: Option<mpsc::Receiver<ProximityInput>>,
}

impl ProximityDriver {
    pub fn new(config: ProximityConfig, feed: ProximityFeed) -> Self {
        Self {
            config,
            feed,
            rx: None,
        }
    }

    pub fn feed(&self) -> &ProximityFeed {
        &self.feed
    }

    fn drop_subscription(&mut self) {
        self.rx = None;
        self.feed.clear();
    }
}

impl Transport for ProximityDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Proximity
    }

    async fn open(&mut self) -> Result<DeviceHandle> {
        if !self.config.is_secure() {
            return Err(HardwareError::unsupported(
                "proximity scanning requires a trusted origin",
            ));
        }
        if self.rx.is_some() {
            return Err(HardwareError::initialization_failed(
                "proximity subscription already open",
            ));
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.feed.install(tx);
        self.rx = Some(rx);

        Ok(DeviceHandle::new(
            TransportKind::Proximity,
            DeviceInfo::new("Browser proximity reader", "proximity"),
        ))
    }

    async fn close(&mut self, _handle: DeviceHandle) -> Result<()> {
        self.drop_subscription();
        Ok(())
    }
}

impl EventTransport for ProximityDriver {
    async fn next_event(&mut self, _handle: &DeviceHandle) -> Result<RawReadEvent> {
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| HardwareError::disconnected("proximity subscription dropped"))?;

        match rx.recv().await {
            Some(ProximityInput::Read(serial)) => {
                Ok(RawReadEvent::text(TransportKind::Proximity, serial))
            }
            Some(ProximityInput::Error(message)) => {
                debug!(%message, "Proximity scan failed, dropping subscription");
                self.drop_subscription();
                Err(HardwareError::communication(message))
            }
            None => {
                self.drop_subscription();
                Err(HardwareError::disconnected("proximity feed closed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secure_driver() -> (ProximityDriver, ProximityFeed) {
        let feed = ProximityFeed::new();
        let driver = ProximityDriver::new(
            ProximityConfig::trusting(["https://pos.example.com"]),
            feed.clone(),
        );
        (driver, feed)
    }

    #[tokio::test]
    async fn test_open_requires_trusted_origin() {
        let mut driver = ProximityDriver::new(ProximityConfig::default(), ProximityFeed::new());
        let result = driver.open().await;
        assert!(matches!(result, Err(HardwareError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_push_without_subscriber_fails() {
        let feed = ProximityFeed::new();
        assert!(!feed.is_subscribed());
        assert!(matches!(
            feed.push("04a1b2c3"),
            Err(HardwareError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_each_push_yields_one_read() {
        let (mut driver, feed) = secure_driver();
        let handle = driver.open().await.unwrap();
        assert!(feed.is_subscribed());

        feed.push("04:a1:b2:c3").unwrap();
        feed.push("04:d4:e5:f6").unwrap();

        let first = driver.next_event(&handle).await.unwrap();
        let second = driver.next_event(&handle).await.unwrap();
        assert_eq!(first.payload.as_text(), Some("04:a1:b2:c3"));
        assert_eq!(second.payload.as_text(), Some("04:d4:e5:f6"));
        assert_eq!(first.transport, TransportKind::Proximity);
    }

    #[tokio::test]
    async fn test_error_is_reported_once_then_subscription_dropped() {
        let (mut driver, feed) = secure_driver();
        let handle = driver.open().await.unwrap();

        feed.report_error("NotReadableError").unwrap();

        let first = driver.next_event(&handle).await;
        assert!(matches!(first, Err(HardwareError::CommunicationError { .. })));

        let second = driver.next_event(&handle).await;
        assert!(matches!(second, Err(HardwareError::Disconnected { .. })));
        assert!(!feed.is_subscribed());
        assert!(feed.push("04a1b2c3").is_err());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let (mut driver, feed) = secure_driver();
        let handle = driver.open().await.unwrap();
        assert!(driver.open().await.is_err());

        driver.close(handle).await.unwrap();
        assert!(!feed.is_subscribed());

        let handle = driver.open().await.unwrap();
        feed.push("04a1b2c3").unwrap();
        assert!(driver.next_event(&handle).await.is_ok());
    }

    #[test]
    fn test_disabled_config_is_never_trusted() {
        let mut config = ProximityConfig::trusting(["https://pos.example.com"]);
        config.enabled = false;
        assert!(!config.is_secure());
        assert!(!config.is_trusted(Some("https://pos.example.com")));
    }
}
