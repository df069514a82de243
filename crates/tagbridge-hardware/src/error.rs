//! Error types for reader operations.
//!
//! Transport faults are classified so the device manager can decide between
//! absorbing them, counting them toward the consecutive-failure limit, or
//! treating the handle as lost.

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Reader fault, as reported by a transport driver.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The reader went away; its handle is no longer usable.
    #[error("Reader disconnected: {device}")]
    Disconnected { device: String },

    /// No usable reader was found for a transport.
    #[error("No reader found: {transport}")]
    NotFound { transport: String },

    #[error("Timed out after {duration_ms} ms")]
    Timeout { duration_ms: u64 },

    /// The transport cannot be used in this environment.
    #[error("Transport unsupported: {operation}")]
    Unsupported { operation: String },

    /// A transfer or subprocess failed; the handle may still be good.
    #[error("Reader communication failed: {message}")]
    CommunicationError { message: String },

    /// Claiming the reader failed.
    #[error("Reader initialization failed: {message}")]
    InitializationFailed { message: String },

    /// Generic I/O error, e.g. failing to spawn a daemon process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HardwareError {
    pub fn disconnected(device: impl Into<String>) -> Self {
        Self::Disconnected {
            device: device.into(),
        }
    }

    pub fn not_found(transport: impl Into<String>) -> Self {
        Self::NotFound {
            transport: transport.into(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::CommunicationError {
            message: message.into(),
        }
    }

    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::InitializationFailed {
            message: message.into(),
        }
    }

    /// Returns `true` if the handle that produced this error is gone for good.
    ///
    /// A lost device is reconnected by the manager right away; any other
    /// error only counts toward the consecutive-failure limit.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::NotFound { .. })
    }
}
