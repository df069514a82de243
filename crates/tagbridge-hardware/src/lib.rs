//! Reader transports and the device manager.
//!
//! Three transports can deliver raw tag reads:
//!
//! - **Proximity**: browser-native scanning forwarded by a page served from a
//!   trusted origin ([`drivers::proximity`]). Event-driven.
//! - **USB**: direct APDU exchange with a PC/SC-class reader over bulk
//!   endpoints ([`drivers::usb`]). Polled.
//! - **Daemon**: external reader utilities run as bounded subprocesses
//!   ([`drivers::daemon`]). Polled.
//!
//! The [`DeviceManager`] probes them, claims the preferred one and runs a
//! single acquisition task that owns the driver. It reports raw reads, handle
//! loss, reconnection, source failures and permanent unavailability as
//! [`DeviceEvent`]s.
//! Decoding raw reads into tag ids is left to the consumer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tagbridge_hardware::drivers::{ProximityFeed, UsbConfig};
//! use tagbridge_hardware::mock::MockUsbBackend;
//! use tagbridge_hardware::{DeviceEvent, DeviceManager, ManagerConfig, TransportSet};
//!
//! #[tokio::main]
//! async fn main() -> tagbridge_hardware::Result<()> {
//!     let (backend, _bus) = MockUsbBackend::new();
//!     let transports = TransportSet::new(ProximityFeed::new())
//!         .with_usb(UsbConfig::default(), Arc::new(backend));
//!
//!     let mut manager = DeviceManager::new(ManagerConfig::default(), transports);
//!     manager.connect().await?;
//!     manager.set_scanning(true);
//!
//!     if let Some(DeviceEvent::Read(read)) = manager.next_event().await {
//!         println!("{:?}", read.raw.payload);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `hardware-usb`: libusb backend ([`drivers::usb::RusbBackend`]).
//! - `hardware-pcsc`: daemon detection through the PC/SC service instead of
//!   `pcsc_scan`.

pub mod devices;
pub mod drivers;
pub mod error;
pub mod manager;
pub mod mock;
pub mod traits;
pub mod types;

pub use devices::AnyTransport;
pub use error::{HardwareError, Result};
pub use manager::{
    AcquiredRead, DeviceEvent, DeviceManager, ManagerConfig, ProbeReport, ReconnectPolicy,
    TransportSet, select_transport,
};
pub use traits::{EventTransport, PolledTransport, Transport};
pub use types::{DeviceHandle, DeviceInfo, UsbReaderId};
