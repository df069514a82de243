//! Transport driver capability set.
//!
//! Every driver can be opened and closed. Polled transports (USB, daemon)
//! additionally implement [`PolledTransport`] and are asked for one read per
//! poll interval; the event-driven proximity transport implements
//! [`EventTransport`] and yields reads as they are pushed to it.
//!
//! All traits use native `async fn` methods (Edition 2024 RPITIT). They are
//! not object-safe; dynamic dispatch goes through
//! [`AnyTransport`](crate::devices::AnyTransport).

#![allow(async_fn_in_trait)]

use crate::error::Result;
use crate::types::DeviceHandle;
use tagbridge_core::{RawReadEvent, TransportKind};

/// Lifecycle shared by all transports.
pub trait Transport: Send {
    /// Transport implemented by this driver.
    fn kind(&self) -> TransportKind;

    /// Claim the underlying resource.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No reader is attached or reachable
    /// - The reader cannot be claimed (busy, permission denied)
    /// - The driver is already open
    async fn open(&mut self) -> Result<DeviceHandle>;

    /// Release the resource claimed by `open`.
    ///
    /// Closing is best-effort; the handle is consumed either way.
    async fn close(&mut self, handle: DeviceHandle) -> Result<()>;
}

/// A transport that is asked for reads on a fixed interval.
pub trait PolledTransport: Transport {
    /// Perform one bounded read attempt.
    ///
    /// Returns `Ok(None)` when no card is present. Never waits longer than the
    /// driver's own transfer or process timeout.
    ///
    /// # Errors
    ///
    /// Returns an error for transport-level faults (device unplugged, transfer
    /// timeout, process could not be spawned).
    async fn poll_once(&mut self, handle: &DeviceHandle) -> Result<Option<RawReadEvent>>;
}

/// A transport that pushes reads as they happen.
pub trait EventTransport: Transport {
    /// Wait for the next pushed read.
    ///
    /// # Errors
    ///
    /// A read error is returned exactly once; the subscription is dropped and
    /// further calls fail with `Disconnected` until the driver is reopened.
    async fn next_event(&mut self, handle: &DeviceHandle) -> Result<RawReadEvent>;
}
