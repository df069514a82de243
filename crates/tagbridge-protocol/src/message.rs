//! JSON messages of the event channel and the control API.
//!
//! Every message is a JSON object whose kebab-case `type` field names the
//! variant; remaining fields are camelCase.
//!
//! ```
//! use tagbridge_protocol::{ClientMessage, ServerMessage};
//!
//! let msg: ClientMessage = serde_json::from_str(r#"{"type":"start-scan"}"#).unwrap();
//! assert_eq!(msg, ClientMessage::StartScan);
//!
//! let json = serde_json::to_string(&ServerMessage::ScanTimeout).unwrap();
//! assert_eq!(json, r#"{"type":"scan-timeout"}"#);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tagbridge_core::{ReaderEvent, TagReadEvent, TransportKind};

/// Reader and session state as seen by subscribers and status callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub reader_connected: bool,
    pub reader_name: Option<String>,
    pub transport: Option<TransportKind>,
    pub is_scanning: bool,
    pub timestamp: DateTime<Utc>,
}

impl StatusReport {
    /// State before any reader was connected.
    pub fn disconnected() -> Self {
        Self {
            reader_connected: false,
            reader_name: None,
            transport: None,
            is_scanning: false,
            timestamp: Utc::now(),
        }
    }

    /// Fold a reader event into the report.
    ///
    /// A scan survives a reader disconnection while reconnection is under
    /// way; only unavailability ends it. Events that carry no state (card
    /// reads, errors) only refresh the timestamp.
    pub fn apply(&mut self, event: &ReaderEvent) {
        match event {
            ReaderEvent::ReaderConnected { name, transport } => {
                self.reader_connected = true;
                self.reader_name = Some(name.clone());
                self.transport = Some(*transport);
            }
            ReaderEvent::ReaderDisconnected { .. } => {
                self.reader_connected = false;
                self.reader_name = None;
                self.transport = None;
            }
            ReaderEvent::ReaderUnavailable { .. } => {
                self.reader_connected = false;
                self.reader_name = None;
                self.transport = None;
                self.is_scanning = false;
            }
            ReaderEvent::ScanStarted { .. } => self.is_scanning = true,
            ReaderEvent::ScanStopped | ReaderEvent::ScanTimeout => self.is_scanning = false,
            ReaderEvent::CardDetected(_) | ReaderEvent::Error { .. } => {}
        }
        self.timestamp = Utc::now();
    }
}

/// Result of an imperative control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Server to subscriber messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every new connection.
    Snapshot(StatusReport),
    /// Reply to `get-status`.
    Status(StatusReport),
    /// Reply to `start-scan`, `stop-scan` and `connect-reader`.
    ScanResult(ControlReply),
    ReaderConnected {
        name: String,
        transport: TransportKind,
    },
    ReaderDisconnected,
    ScanStarted {
        timeout_ms: u64,
    },
    ScanStopped,
    ScanTimeout,
    CardDetected(TagReadEvent),
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<ReaderEvent> for ServerMessage {
    fn from(event: ReaderEvent) -> Self {
        match event {
            ReaderEvent::ReaderConnected { name, transport } => {
                ServerMessage::ReaderConnected { name, transport }
            }
            ReaderEvent::ReaderDisconnected { .. } => ServerMessage::ReaderDisconnected,
            ReaderEvent::ReaderUnavailable { message } => ServerMessage::Error { message },
            ReaderEvent::ScanStarted { timeout_ms } => ServerMessage::ScanStarted { timeout_ms },
            ReaderEvent::ScanStopped => ServerMessage::ScanStopped,
            ReaderEvent::ScanTimeout => ServerMessage::ScanTimeout,
            ReaderEvent::CardDetected(read) => ServerMessage::CardDetected(read),
            ReaderEvent::Error { message } => ServerMessage::Error { message },
        }
    }
}

/// Subscriber to server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    StartScan,
    StopScan,
    GetStatus,
    ConnectReader,
    /// Serial number scanned by a trusted browser page.
    ProximityRead {
        serial_number: String,
    },
}
