//! Direct USB transport speaking ISO-7816 APDUs over bulk endpoints.
//!
//! USB I/O is blocking. The driver runs every backend call on the blocking
//! thread pool and moves the claimed link in and out of the closure, so the
//! link is owned by exactly one thread of control at any time.
//!
//! ```text
//! poll_once ──► spawn_blocking ──► ApduLink::transceive
//!                                   ├─ bulk OUT  FF CA 00 00 00
//!                                   └─ bulk IN   UID.. 90 00 (≤ 64 bytes)
//! ```
//!
//! The real backend is [`RusbBackend`], available with the `hardware-usb`
//! feature. Tests use [`MockUsbBackend`](crate::mock::MockUsbBackend).

use crate::error::{HardwareError, Result};
use crate::traits::{PolledTransport, Transport};
use crate::types::{DeviceHandle, DeviceInfo, UsbReaderId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tagbridge_core::{RawReadEvent, TransportKind, constants::APDU_GET_UID};
use tracing::{debug, info};

/// USB vendor id of Advanced Card Systems (ACR122U and friends).
pub const VENDOR_ACS: u16 = 0x072F;

/// USB vendor id of HID OmniKey.
pub const VENDOR_OMNIKEY: u16 = 0x076B;

/// USB vendor id of SCM Microsystems / Identiv.
pub const VENDOR_SCM: u16 = 0x04E6;

/// USB transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Vendors probed for readers, in preference order.
    pub vendor_ids: Vec<u16>,

    /// Bulk OUT endpoint address.
    pub out_endpoint: u8,

    /// Bulk IN endpoint address.
    pub in_endpoint: u8,

    /// Timeout of each bulk transfer in milliseconds.
    pub transfer_timeout_ms: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_ids: vec![VENDOR_ACS, VENDOR_OMNIKEY, VENDOR_SCM],
            out_endpoint: 0x02,
            in_endpoint: 0x81,
            transfer_timeout_ms: 500,
        }
    }
}

impl UsbConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// A claimed reader able to exchange one APDU.
///
/// Implementations block; the driver never calls them on an async worker.
/// Dropping the link releases the claimed interface.
pub trait ApduLink: Send + Sync + 'static {
    /// Send `command` and return the raw response, status word included.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Access to the USB bus.
pub trait UsbBackend: Send + Sync + 'static {
    /// List attached readers whose vendor is in `vendor_ids`, in that order.
    fn probe(&self, vendor_ids: &[u16]) -> Result<Vec<UsbReaderId>>;

    /// Select the first configuration of `reader` and claim its data interface.
    fn open(&self, reader: &UsbReaderId, config: &UsbConfig) -> Result<Box<dyn ApduLink>>;
}

/// Polled USB APDU driver.
pub struct UsbDriver {
    config: UsbConfig,
    backend: Arc<dyn UsbBackend>,
    link: Option<Box<dyn ApduLink>>,
}

impl fmt::Debug for UsbDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDriver")
            .field("config", &self.config)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl UsbDriver {
    pub fn new(config: UsbConfig, backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            config,
            backend,
            link: None,
        }
    }
}

/// List known readers on the bus without claiming any.
pub async fn list_readers(
    backend: Arc<dyn UsbBackend>,
    vendor_ids: Vec<u16>,
) -> Result<Vec<UsbReaderId>> {
    tokio::task::spawn_blocking(move || backend.probe(&vendor_ids))
        .await
        .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> HardwareError {
    HardwareError::communication(format!("USB worker failed: {e}"))
}

impl Transport for UsbDriver {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    async fn open(&mut self) -> Result<DeviceHandle> {
        if self.link.is_some() {
            return Err(HardwareError::initialization_failed(
                "USB reader already claimed",
            ));
        }

        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let (reader, link) = tokio::task::spawn_blocking(move || {
            let reader = backend
                .probe(&config.vendor_ids)?
                .into_iter()
                .next()
                .ok_or_else(|| HardwareError::not_found("usb"))?;
            let link = backend.open(&reader, &config)?;
            Ok::<_, HardwareError>((reader, link))
        })
        .await
        .map_err(join_error)??;

        info!(
            reader = %reader.display_name(),
            vendor_id = reader.vendor_id,
            product_id = reader.product_id,
            "USB reader claimed"
        );

        self.link = Some(link);
        Ok(DeviceHandle::new(
            TransportKind::Usb,
            DeviceInfo::new(reader.display_name(), "usb-apdu"),
        ))
    }

    async fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        if let Some(link) = self.link.take() {
            tokio::task::spawn_blocking(move || drop(link))
                .await
                .map_err(join_error)?;
        }
        debug!(reader = handle.name(), "USB reader released");
        Ok(())
    }
}

impl PolledTransport for UsbDriver {
    async fn poll_once(&mut self, _handle: &DeviceHandle) -> Result<Option<RawReadEvent>> {
        let mut link = self
            .link
            .take()
            .ok_or_else(|| HardwareError::disconnected("USB reader not claimed"))?;

        let (link, response) = tokio::task::spawn_blocking(move || {
            let response = link.transceive(&APDU_GET_UID);
            (link, response)
        })
        .await
        .map_err(join_error)?;
        self.link = Some(link);

        let response = response?;
        if response.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawReadEvent::bytes(TransportKind::Usb, response)))
    }
}

#[cfg(feature = "hardware-usb")]
pub use rusb_backend::RusbBackend;

#[cfg(feature = "hardware-usb")]
mod rusb_backend {
    use super::{ApduLink, UsbBackend, UsbConfig};
    use crate::error::{HardwareError, Result};
    use crate::types::UsbReaderId;
    use rusb::UsbContext;
    use std::time::Duration;
    use tagbridge_core::constants::USB_RESPONSE_BUFFER_LEN;

    /// libusb backed implementation of [`UsbBackend`].
    pub struct RusbBackend {
        context: rusb::Context,
    }

    impl RusbBackend {
        pub fn new() -> Result<Self> {
            let context = rusb::Context::new().map_err(|e| {
                HardwareError::initialization_failed(format!("libusb init failed: {e}"))
            })?;
            Ok(Self { context })
        }
    }

    fn usb_error(e: rusb::Error, timeout: Duration) -> HardwareError {
        match e {
            rusb::Error::NoDevice | rusb::Error::NotFound => HardwareError::disconnected("usb"),
            rusb::Error::Timeout => HardwareError::timeout(timeout.as_millis() as u64),
            rusb::Error::Access => HardwareError::initialization_failed("USB access denied"),
            rusb::Error::Busy => HardwareError::initialization_failed("USB reader busy"),
            other => HardwareError::communication(other.to_string()),
        }
    }

    impl UsbBackend for RusbBackend {
        fn probe(&self, vendor_ids: &[u16]) -> Result<Vec<UsbReaderId>> {
            let timeout = Duration::from_millis(200);
            let devices = self.context.devices().map_err(|e| usb_error(e, timeout))?;

            let mut readers = Vec::new();
            for device in devices.iter() {
                let Ok(desc) = device.device_descriptor() else {
                    continue;
                };
                if !vendor_ids.contains(&desc.vendor_id()) {
                    continue;
                }

                let product = device
                    .open()
                    .ok()
                    .and_then(|handle| handle.read_product_string_ascii(&desc).ok());

                readers.push(UsbReaderId {
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    bus: device.bus_number(),
                    address: device.address(),
                    product,
                });
            }

            readers.sort_by_key(|reader| {
                vendor_ids
                    .iter()
                    .position(|v| *v == reader.vendor_id)
                    .unwrap_or(usize::MAX)
            });
            Ok(readers)
        }

        fn open(&self, reader: &UsbReaderId, config: &UsbConfig) -> Result<Box<dyn ApduLink>> {
            let timeout = config.transfer_timeout();
            let devices = self.context.devices().map_err(|e| usb_error(e, timeout))?;
            let device = devices
                .iter()
                .find(|d| d.bus_number() == reader.bus && d.address() == reader.address)
                .ok_or_else(|| HardwareError::disconnected(reader.display_name()))?;

            let config_desc = device
                .config_descriptor(0)
                .map_err(|e| usb_error(e, timeout))?;
            let interface = config_desc
                .interfaces()
                .next()
                .map(|i| i.number())
                .unwrap_or(0);

            let mut handle = device.open().map_err(|e| usb_error(e, timeout))?;
            // Not supported on every platform.
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle
                .set_active_configuration(config_desc.number())
                .map_err(|e| usb_error(e, timeout))?;
            handle
                .claim_interface(interface)
                .map_err(|e| usb_error(e, timeout))?;

            Ok(Box::new(RusbLink {
                handle,
                interface,
                out_endpoint: config.out_endpoint,
                in_endpoint: config.in_endpoint,
                timeout,
            }))
        }
    }

    struct RusbLink {
        handle: rusb::DeviceHandle<rusb::Context>,
        interface: u8,
        out_endpoint: u8,
        in_endpoint: u8,
        timeout: Duration,
    }

    impl ApduLink for RusbLink {
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
            self.handle
                .write_bulk(self.out_endpoint, command, self.timeout)
                .map_err(|e| usb_error(e, self.timeout))?;

            let mut buf = vec![0u8; USB_RESPONSE_BUFFER_LEN];
            let len = self
                .handle
                .read_bulk(self.in_endpoint, &mut buf, self.timeout)
                .map_err(|e| usb_error(e, self.timeout))?;
            buf.truncate(len);
            Ok(buf)
        }
    }

    impl Drop for RusbLink {
        fn drop(&mut self) {
            let _ = self.handle.release_interface(self.interface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockUsbBackend, MockUsbFault};

    fn driver() -> (UsbDriver, crate::mock::MockUsbHandle) {
        let (backend, handle) = MockUsbBackend::new();
        handle.attach(UsbReaderId::new(VENDOR_ACS, 0x2200).with_product("ACR122U PICC Interface"));
        (UsbDriver::new(UsbConfig::default(), Arc::new(backend)), handle)
    }

    #[tokio::test]
    async fn test_open_claims_first_known_reader() {
        let (mut driver, mock) = driver();
        let handle = driver.open().await.unwrap();

        assert_eq!(handle.transport, TransportKind::Usb);
        assert_eq!(handle.name(), "ACR122U PICC Interface");
        assert_eq!(mock.open_count(), 1);
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_driver_can_be_shared_across_tasks() {
        assert_send_sync::<UsbDriver>();
    }

    #[tokio::test]
    async fn test_bus_listing_does_not_claim() {
        let (backend, mock) = MockUsbBackend::new();
        mock.attach(UsbReaderId::new(VENDOR_ACS, 0x2200));
        let backend: Arc<dyn UsbBackend> = Arc::new(backend);

        let listing = tokio::spawn(list_readers(Arc::clone(&backend), vec![VENDOR_ACS]));
        let readers = listing.await.unwrap().unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].vendor_id, VENDOR_ACS);
        assert_eq!(mock.open_count(), 0);
    }

    #[tokio::test]
    async fn test_open_without_reader_is_not_found() {
        let (backend, _mock) = MockUsbBackend::new();
        let mut driver = UsbDriver::new(UsbConfig::default(), Arc::new(backend));
        let result = driver.open().await;
        assert!(matches!(result, Err(HardwareError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_poll_sends_get_uid_and_returns_response() {
        let (mut driver, mock) = driver();
        let handle = driver.open().await.unwrap();

        mock.present(&[0x04, 0xA1, 0xB2, 0xC3]);
        let raw = driver.poll_once(&handle).await.unwrap().unwrap();

        assert_eq!(
            raw.payload.as_bytes(),
            Some(&[0x04, 0xA1, 0xB2, 0xC3, 0x90, 0x00][..])
        );
        assert_eq!(mock.commands(), vec![APDU_GET_UID.to_vec()]);
    }

    #[tokio::test]
    async fn test_transfer_fault_keeps_link() {
        let (mut driver, mock) = driver();
        let handle = driver.open().await.unwrap();

        mock.push_fault(MockUsbFault::Timeout);
        assert!(matches!(
            driver.poll_once(&handle).await,
            Err(HardwareError::Timeout { .. })
        ));

        mock.present(&[0x04, 0xA1, 0xB2, 0xC3]);
        assert!(driver.poll_once(&handle).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unplugged_reader_reports_disconnected() {
        let (mut driver, mock) = driver();
        let handle = driver.open().await.unwrap();

        mock.unplug();
        let result = driver.poll_once(&handle).await;
        assert!(result.is_err_and(|e| e.is_device_lost()));
    }

    #[tokio::test]
    async fn test_close_releases_link() {
        let (mut driver, _mock) = driver();
        let handle = driver.open().await.unwrap();
        driver.close(handle.clone()).await.unwrap();

        assert!(matches!(
            driver.poll_once(&handle).await,
            Err(HardwareError::Disconnected { .. })
        ));
        assert!(driver.open().await.is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = UsbConfig::default();
        assert_eq!(config.vendor_ids, vec![0x072F, 0x076B, 0x04E6]);
        assert_eq!(config.out_endpoint, 0x02);
        assert_eq!(config.in_endpoint, 0x81);
        assert_eq!(config.transfer_timeout(), Duration::from_millis(500));
    }
}
