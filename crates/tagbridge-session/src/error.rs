use tagbridge_hardware::HardwareError;
use thiserror::Error;

/// Failure of a control request, returned to the caller only.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("no reader available")]
    NoReader,

    #[error("scan already in progress")]
    AlreadyScanning,

    #[error("proximity reads are not accepted from this origin")]
    UntrustedOrigin,

    #[error("proximity read rejected: {0}")]
    Proximity(#[source] HardwareError),

    #[error("scan service stopped")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, ControlError>;
