//! Simulated USB bus for testing and development.
//!
//! [`MockUsbBackend`] plugs into [`UsbDriver`](crate::drivers::usb::UsbDriver)
//! in place of libusb. The paired [`MockUsbHandle`] attaches and unplugs
//! readers, queues APDU responses and injects transfer faults.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use tagbridge_hardware::drivers::usb::{UsbConfig, UsbDriver};
//! use tagbridge_hardware::mock::MockUsbBackend;
//! use tagbridge_hardware::traits::{PolledTransport, Transport};
//! use tagbridge_hardware::types::UsbReaderId;
//!
//! #[tokio::main]
//! async fn main() -> tagbridge_hardware::Result<()> {
//!     let (backend, mock) = MockUsbBackend::new();
//!     mock.attach(UsbReaderId::new(0x072F, 0x2200));
//!
//!     let mut driver = UsbDriver::new(UsbConfig::default(), Arc::new(backend));
//!     let handle = driver.open().await?;
//!
//!     mock.present(&[0x04, 0xA1, 0xB2, 0xC3]);
//!     let raw = driver.poll_once(&handle).await?.unwrap();
//!     assert_eq!(raw.payload.as_bytes().unwrap().len(), 6);
//!     Ok(())
//! }
//! ```

use crate::drivers::usb::{ApduLink, UsbBackend, UsbConfig};
use crate::error::{HardwareError, Result};
use crate::types::UsbReaderId;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tagbridge_core::constants::APDU_STATUS_SUCCESS;

/// Response returned when nothing is queued: `63 00`, no card in the field.
const NO_CARD: [u8; 2] = [0x63, 0x00];

/// Transfer faults the mock can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockUsbFault {
    /// The bulk transfer timed out.
    Timeout,
    /// The endpoint stalled or the pipe broke.
    Pipe,
}

#[derive(Debug, Default)]
struct MockUsbState {
    readers: Vec<UsbReaderId>,
    responses: VecDeque<std::result::Result<Vec<u8>, MockUsbFault>>,
    commands: Vec<Vec<u8>>,
    open_count: usize,
    generation: u64,
}

type SharedState = Arc<Mutex<MockUsbState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockUsbState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory USB bus.
#[derive(Debug)]
pub struct MockUsbBackend {
    state: SharedState,
}

impl MockUsbBackend {
    /// Create an empty bus and its control handle.
    pub fn new() -> (Self, MockUsbHandle) {
        let state = SharedState::default();
        (
            Self {
                state: Arc::clone(&state),
            },
            MockUsbHandle { state },
        )
    }
}

impl UsbBackend for MockUsbBackend {
    fn probe(&self, vendor_ids: &[u16]) -> Result<Vec<UsbReaderId>> {
        let state = lock(&self.state);
        let mut readers: Vec<_> = state
            .readers
            .iter()
            .filter(|r| vendor_ids.contains(&r.vendor_id))
            .cloned()
            .collect();
        readers.sort_by_key(|r| vendor_ids.iter().position(|v| *v == r.vendor_id));
        Ok(readers)
    }

    fn open(&self, reader: &UsbReaderId, _config: &UsbConfig) -> Result<Box<dyn ApduLink>> {
        let mut state = lock(&self.state);
        if !state.readers.contains(reader) {
            return Err(HardwareError::disconnected(reader.display_name()));
        }
        state.open_count += 1;
        Ok(Box::new(MockApduLink {
            state: Arc::clone(&self.state),
            generation: state.generation,
        }))
    }
}

struct MockApduLink {
    state: SharedState,
    generation: u64,
}

impl ApduLink for MockApduLink {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.generation != self.generation {
            return Err(HardwareError::disconnected("mock usb reader"));
        }
        state.commands.push(command.to_vec());

        match state.responses.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(MockUsbFault::Timeout)) => Err(HardwareError::timeout(500)),
            Some(Err(MockUsbFault::Pipe)) => Err(HardwareError::communication("pipe error")),
            None => Ok(NO_CARD.to_vec()),
        }
    }
}

/// Control handle for a [`MockUsbBackend`].
#[derive(Debug, Clone)]
pub struct MockUsbHandle {
    state: SharedState,
}

impl MockUsbHandle {
    /// Plug a reader into the bus.
    pub fn attach(&self, reader: UsbReaderId) {
        lock(&self.state).readers.push(reader);
    }

    /// Remove every reader. Links opened before the unplug fail with
    /// `Disconnected` from now on.
    pub fn unplug(&self) {
        let mut state = lock(&self.state);
        state.readers.clear();
        state.responses.clear();
        state.generation += 1;
    }

    /// Queue a successful response carrying `uid`.
    pub fn present(&self, uid: &[u8]) {
        let mut response = uid.to_vec();
        response.extend_from_slice(&APDU_STATUS_SUCCESS);
        self.push_response(response);
    }

    /// Queue a raw response.
    pub fn push_response(&self, response: impl Into<Vec<u8>>) {
        lock(&self.state).responses.push_back(Ok(response.into()));
    }

    /// Queue a transfer fault.
    pub fn push_fault(&self, fault: MockUsbFault) {
        lock(&self.state).responses.push_back(Err(fault));
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }

    /// Every command sent over any link, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        lock(&self.state).commands.clone()
    }
}
