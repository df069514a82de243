//! Core constants for tag acquisition.
//!
//! This module centralizes the values that several crates must agree on:
//! identifier validation bounds, the ISO-7816 command and status words used by
//! direct USB readers, and the default timings of a scan session.
//!
//! # Usage
//!
//! ```
//! use tagbridge_core::constants::*;
//! use std::time::Duration;
//!
//! assert_eq!(APDU_STATUS_SUCCESS, [0x90, 0x00]);
//!
//! let deadline = Duration::from_millis(DEFAULT_SCAN_TIMEOUT_MS);
//! assert_eq!(deadline.as_secs(), 30);
//! ```

// ============================================================================
// Tag Identifier
// ============================================================================

/// Minimum number of hex characters in a canonical tag id.
///
/// Four bytes is the shortest single-size UID defined by ISO 14443-3.
pub const MIN_TAG_HEX_LEN: usize = 8;

/// Maximum number of hex characters in a canonical tag id.
///
/// Ten bytes is the longest (triple-size) UID defined by ISO 14443-3.
pub const MAX_TAG_HEX_LEN: usize = 20;

/// Separators stripped from device-reported identifiers before validation.
///
/// # Examples
///
/// ```
/// use tagbridge_core::constants::TAG_SEPARATORS;
///
/// let serial = "04:a1:b2:c3";
/// let stripped: String = serial.chars().filter(|c| !TAG_SEPARATORS.contains(c)).collect();
/// assert_eq!(stripped, "04a1b2c3");
/// ```
pub const TAG_SEPARATORS: &[char] = &[':', '-', ' ', '\t'];

// ============================================================================
// ISO-7816 APDU
// ============================================================================

/// PC/SC pseudo-APDU "Get Data" requesting the card UID.
///
/// ```text
/// CLA  INS  P1   P2   Le
/// FF   CA   00   00   00
/// ```
pub const APDU_GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Status word appended to every successful APDU response.
pub const APDU_STATUS_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Shortest APDU response that may carry a UID (two data bytes plus status).
pub const APDU_MIN_RESPONSE_LEN: usize = 4;

/// Maximum UID bytes taken from an APDU response.
///
/// Readers may pad the response; only the leading double-size UID is kept.
pub const APDU_MAX_UID_BYTES: usize = 7;

/// Size of the bulk-in buffer used for APDU responses.
pub const USB_RESPONSE_BUFFER_LEN: usize = 64;

// ============================================================================
// Session Timing
// ============================================================================

/// Default scan deadline in milliseconds.
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 30_000;

/// Default window in which a repeated read of the same tag is suppressed.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

/// Default interval between two polls of a polled transport.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Consecutive failed polls after which a device is considered lost.
pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;

// ============================================================================
// Network
// ============================================================================

/// Default port of the control API and event channel.
pub const DEFAULT_SERVER_PORT: u16 = 3001;
