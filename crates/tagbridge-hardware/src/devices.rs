//! Enum wrapper for transport dispatch.
//!
//! Native `async fn` in traits is not object-safe, so the device manager
//! holds its driver as an [`AnyTransport`] and dispatches by variant.
//!
//! # Examples
//!
//! ```
//! use tagbridge_core::TransportKind;
//! use tagbridge_hardware::devices::AnyTransport;
//! use tagbridge_hardware::drivers::{DaemonConfig, DaemonDriver};
//! use tagbridge_hardware::traits::Transport;
//!
//! let transport = AnyTransport::Daemon(DaemonDriver::new(DaemonConfig::default()));
//! assert_eq!(transport.kind(), TransportKind::Daemon);
//! ```

use crate::drivers::{DaemonDriver, ProximityDriver, UsbDriver};
use crate::error::Result;
use crate::traits::{EventTransport, PolledTransport, Transport};
use crate::types::DeviceHandle;
use tagbridge_core::{RawReadEvent, TransportKind};

/// Any transport driver.
#[derive(Debug)]
pub enum AnyTransport {
    Proximity(ProximityDriver),
    Usb(UsbDriver),
    Daemon(DaemonDriver),
}

impl AnyTransport {
    /// One acquisition step.
    ///
    /// Polled transports perform a single poll; the event-driven transport
    /// waits for the next pushed read.
    pub async fn acquire(&mut self, handle: &DeviceHandle) -> Result<Option<RawReadEvent>> {
        match self {
            Self::Proximity(driver) => driver.next_event(handle).await.map(Some),
            Self::Usb(driver) => driver.poll_once(handle).await,
            Self::Daemon(driver) => driver.poll_once(handle).await,
        }
    }

    /// Returns `true` if an in-flight [`acquire`](Self::acquire) may be
    /// dropped without losing the claimed device.
    ///
    /// A USB transfer owns the link on a blocking thread until it returns.
    pub fn is_cancel_safe(&self) -> bool {
        !matches!(self, Self::Usb(_))
    }
}

impl Transport for AnyTransport {
    fn kind(&self) -> TransportKind {
        match self {
            Self::Proximity(driver) => driver.kind(),
            Self::Usb(driver) => driver.kind(),
            Self::Daemon(driver) => driver.kind(),
        }
    }

    async fn open(&mut self) -> Result<DeviceHandle> {
        match self {
            Self::Proximity(driver) => driver.open().await,
            Self::Usb(driver) => driver.open().await,
            Self::Daemon(driver) => driver.open().await,
        }
    }

    async fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        match self {
            Self::Proximity(driver) => driver.close(handle).await,
            Self::Usb(driver) => driver.close(handle).await,
            Self::Daemon(driver) => driver.close(handle).await,
        }
    }
}

impl From<ProximityDriver> for AnyTransport {
    fn from(driver: ProximityDriver) -> Self {
        Self::Proximity(driver)
    }
}

impl From<UsbDriver> for AnyTransport {
    fn from(driver: UsbDriver) -> Self {
        Self::Usb(driver)
    }
}

impl From<DaemonDriver> for AnyTransport {
    fn from(driver: DaemonDriver) -> Self {
        Self::Daemon(driver)
    }
}
