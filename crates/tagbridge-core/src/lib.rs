//! Shared vocabulary of the tag acquisition subsystem.
//!
//! Everything that crosses a crate boundary lives here: the canonical
//! [`TagId`], the [`TransportKind`] that produced a read, the ephemeral
//! [`RawReadEvent`] handed from drivers to decoders, the immutable
//! [`TagReadEvent`] that is the only externally visible artifact, and the
//! [`ReaderEvent`] stream emitted by the session owner. [`Resolution`] is the
//! answer of the external customer lookup.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
