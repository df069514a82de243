use crate::{
    Result,
    constants::{MAX_TAG_HEX_LEN, MIN_TAG_HEX_LEN, TAG_SEPARATORS},
    error::Error,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

/// Canonical identifier of a physical proximity card.
///
/// Always lower-case hex without separators, between 8 and 20 characters.
/// Construction is the only place normalization happens, so every value of
/// this type satisfies the invariant.
///
/// # Security
/// Comparison is constant-time, the same way card numbers are compared
/// during authentication.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagId(String);

impl TagId {
    /// Normalize and validate a device-reported identifier.
    ///
    /// Separators (`:`, `-`, spaces, tabs) are stripped and the result is
    /// lower-cased before validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidTagId` if:
    /// - The stripped identifier is shorter than 8 or longer than 20 characters
    /// - It contains non-hex characters
    /// - It consists only of zeros (readers report that when no card is present)
    ///
    /// # Examples
    ///
    /// ```
    /// use tagbridge_core::TagId;
    ///
    /// let tag = TagId::parse("04:A1:B2:C3").unwrap();
    /// assert_eq!(tag.as_str(), "04a1b2c3");
    ///
    /// assert!(TagId::parse("04a1b2").is_err());
    /// assert!(TagId::parse("00000000").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !TAG_SEPARATORS.contains(c))
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let len = normalized.len();
        if !(MIN_TAG_HEX_LEN..=MAX_TAG_HEX_LEN).contains(&len) {
            return Err(Error::InvalidTagId(format!(
                "Tag id must be {MIN_TAG_HEX_LEN}-{MAX_TAG_HEX_LEN} hex chars, got {len}"
            )));
        }

        if !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidTagId(format!(
                "Tag id must be hexadecimal, got {normalized:?}"
            )));
        }

        if normalized.chars().all(|c| c == '0') {
            return Err(Error::InvalidTagId("Tag id is all zeros".to_string()));
        }

        Ok(TagId(normalized))
    }

    /// Build a tag id from raw UID bytes.
    ///
    /// The bytes are hex-encoded upper-case, then normalized like any other
    /// device-reported identifier.
    ///
    /// # Errors
    /// Same conditions as [`TagId::parse`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tagbridge_core::TagId;
    ///
    /// let tag = TagId::from_uid_bytes(&[0x04, 0xA1, 0xB2, 0xC3]).unwrap();
    /// assert_eq!(tag.as_str(), "04a1b2c3");
    /// ```
    pub fn from_uid_bytes(uid: &[u8]) -> Result<Self> {
        let hex: String = uid.iter().map(|b| format!("{b:02X}")).collect();
        Self::parse(&hex)
    }

    /// Get the canonical identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TagId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TagId::parse(s)
    }
}

impl TryFrom<String> for TagId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        TagId::parse(&value)
    }
}

impl From<TagId> for String {
    fn from(tag: TagId) -> Self {
        tag.0
    }
}

impl PartialEq for TagId {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::hash::Hash for TagId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Hardware access mechanism that produced a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Platform proximity scanning forwarded from a trusted browser page.
    Proximity,
    /// Direct USB bulk transfers speaking ISO-7816 APDUs.
    Usb,
    /// Locally installed libnfc or PC/SC tooling run as a subprocess.
    Daemon,
}

impl TransportKind {
    /// All transports in selection preference order.
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Proximity,
        TransportKind::Usb,
        TransportKind::Daemon,
    ];

    /// Stable lower-case name used on the wire and in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Proximity => "proximity",
            TransportKind::Usb => "usb",
            TransportKind::Daemon => "daemon",
        }
    }

    /// Returns `true` if the transport pushes events instead of being polled.
    #[must_use]
    pub fn is_event_driven(self) -> bool {
        matches!(self, TransportKind::Proximity)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proximity" => Ok(TransportKind::Proximity),
            "usb" => Ok(TransportKind::Usb),
            "daemon" => Ok(TransportKind::Daemon),
            other => Err(Error::UnknownTransport(other.to_string())),
        }
    }
}

/// Payload exactly as a transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    /// Binary response, e.g. an APDU read from a bulk-in endpoint.
    Bytes(Bytes),
    /// Textual output, e.g. a serial number or subprocess stdout.
    Text(String),
}

impl RawPayload {
    /// View the payload as text, if it is textual.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawPayload::Text(text) => Some(text),
            RawPayload::Bytes(_) => None,
        }
    }

    /// View the payload as bytes, if it is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RawPayload::Bytes(bytes) => Some(bytes),
            RawPayload::Text(_) => None,
        }
    }
}

/// Raw read produced by a driver and consumed immediately by a decoder.
#[derive(Debug, Clone)]
pub struct RawReadEvent {
    pub payload: RawPayload,
    pub transport: TransportKind,
    pub received_at: DateTime<Utc>,
}

impl RawReadEvent {
    /// Create a raw read stamped with the current time.
    pub fn new(transport: TransportKind, payload: RawPayload) -> Self {
        Self {
            payload,
            transport,
            received_at: Utc::now(),
        }
    }

    /// Binary read, typical for USB transports.
    pub fn bytes(transport: TransportKind, bytes: impl Into<Bytes>) -> Self {
        Self::new(transport, RawPayload::Bytes(bytes.into()))
    }

    /// Textual read, typical for proximity and daemon transports.
    pub fn text(transport: TransportKind, text: impl Into<String>) -> Self {
        Self::new(transport, RawPayload::Text(text.into()))
    }
}

/// A normalized tag read, the only artifact visible outside the subsystem.
///
/// Fields are private so the event cannot be altered after construction;
/// every subscriber receives its own clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReadEvent {
    tag_id: TagId,
    transport: TransportKind,
    timestamp: DateTime<Utc>,
}

impl TagReadEvent {
    pub fn new(tag_id: TagId, transport: TransportKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            tag_id,
            transport,
            timestamp,
        }
    }

    pub fn tag_id(&self) -> &TagId {
        &self.tag_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Lifecycle and data events emitted by the session owner, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    /// A transport driver was opened and is ready.
    ReaderConnected {
        name: String,
        transport: TransportKind,
    },

    /// The active reader was lost or explicitly disconnected.
    ReaderDisconnected { transport: TransportKind },

    /// Reconnection gave up; nothing is retried until a new connect request.
    ReaderUnavailable { message: String },

    /// A scan session entered `Scanning`.
    ScanStarted { timeout_ms: u64 },

    /// A scan session returned to `Idle` through stop or a single-shot read.
    ScanStopped,

    /// The scan deadline elapsed without a read.
    ScanTimeout,

    /// A normalized, debounced tag read.
    CardDetected(TagReadEvent),

    /// A coarse-grained failure worth showing to users.
    Error { message: String },
}

/// Customer record returned by the resolution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: String,
    pub name: String,
}

/// Outcome of looking up a tag id in the customer store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Resolution {
    Customer(CustomerRecord),
    Unassociated,
}

impl Resolution {
    pub fn is_associated(&self) -> bool {
        matches!(self, Resolution::Customer(_))
    }
}
