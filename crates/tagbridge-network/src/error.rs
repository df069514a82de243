use std::net::SocketAddr;
use thiserror::Error;

/// Errors of the distribution server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listener
    #[error("Failed to bind to {addr}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The event distributor is no longer running
    #[error("Event distributor stopped")]
    DistributorStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
