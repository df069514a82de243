//! Scan session ownership.
//!
//! This crate holds the single owner of reader and session state, the
//! [`ScanService`]. It turns raw reads from the device manager into
//! [`TagReadEvent`](tagbridge_core::TagReadEvent)s, at most one scan at a
//! time:
//!
//! 1. Reads arriving while no scan is open are discarded.
//! 2. Payloads are decoded with the decoder matching the active transport.
//! 3. Repeated reads of one tag inside the debounce window are suppressed.
//! 4. The [`ScanSession`] decides whether the scan ends (single-shot) or
//!    goes on (continuous).
//! 5. The read is emitted as `CardDetected`, and the customer lookup and
//!    audit hook run detached.
//!
//! Control calls return [`ControlError`]s to their caller only; they are
//! never broadcast.

pub mod collaborators;
pub mod config;
pub mod debounce;
pub mod error;
pub mod service;
pub mod state;

pub use collaborators::{AuditSink, LogAudit, TagResolver, Unassociated};
pub use config::{ScanConfig, ScanMode};
pub use debounce::Debouncer;
pub use error::{ControlError, Result};
pub use service::{READER_UNAVAILABLE, ScanService, ServiceHandle};
pub use state::{ScanSession, ScanState, StateTransition, TagOutcome};
