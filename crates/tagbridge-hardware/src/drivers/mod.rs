//! Transport drivers, one per hardware class.

pub mod daemon;
pub mod proximity;
pub mod usb;

pub use daemon::{DaemonConfig, DaemonDriver, DaemonReader};
pub use proximity::{ProximityConfig, ProximityDriver, ProximityFeed};
pub use usb::{UsbBackend, UsbConfig, UsbDriver};
