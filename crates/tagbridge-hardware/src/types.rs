//! Types shared across transport drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tagbridge_core::TransportKind;
use tagbridge_protocol::DaemonOutput;
use uuid::Uuid;

/// Reader metadata reported on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Name shown to subscribers (e.g., "ACR122U PICC Interface").
    pub name: String,

    /// Driver-specific model description (e.g., "libnfc", "usb-apdu").
    pub model: String,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with required fields.
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
        }
    }
}

/// A USB reader found during probing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbReaderId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    /// Product string descriptor, when the device could be queried.
    pub product: Option<String>,
}

impl UsbReaderId {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            bus: 0,
            address: 0,
            product: None,
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    /// Name reported in `reader-connected`.
    ///
    /// ```
    /// use tagbridge_hardware::types::UsbReaderId;
    ///
    /// assert_eq!(UsbReaderId::new(0x072F, 0x2200).display_name(), "USB reader 072F:2200");
    /// assert_eq!(
    ///     UsbReaderId::new(0x072F, 0x2200).with_product("ACR122U").display_name(),
    ///     "ACR122U"
    /// );
    /// ```
    pub fn display_name(&self) -> String {
        match &self.product {
            Some(product) if !product.trim().is_empty() => product.trim().to_string(),
            _ => format!("USB reader {:04X}:{:04X}", self.vendor_id, self.product_id),
        }
    }
}

/// A claimed hardware resource.
///
/// Created by a driver's `open`, owned by the device manager, and consumed by
/// `close`. The manager guarantees at most one live handle per transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: Uuid,
    pub transport: TransportKind,
    pub info: DeviceInfo,
    /// Decoder sub-variant for daemon output; ignored by other transports.
    pub output: DaemonOutput,
    pub opened_at: DateTime<Utc>,
}

impl DeviceHandle {
    pub fn new(transport: TransportKind, info: DeviceInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            info,
            output: DaemonOutput::default(),
            opened_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: DaemonOutput) -> Self {
        self.output = output;
        self
    }

    /// Reader name shown to subscribers.
    pub fn name(&self) -> &str {
        &self.info.name
    }
}
