//! Pure decoders from raw transport payloads to tag ids.
//!
//! # Payload Shapes
//!
//! | Transport | Payload | Decoder |
//! |-----------|---------|---------|
//! | Proximity | serial number, optional `:` separators | [`decode_proximity`] |
//! | USB | APDU response `UID.. 90 00` | [`decode_apdu`] |
//! | Daemon (libnfc) | `nfc-poll` text output | [`decode_daemon_lines`] |
//! | Daemon (PC/SC helper) | `{"uid": ..}` / `{"data": ..}` or bare UID | [`decode_daemon_json`] |
//!
//! # Examples
//!
//! ```
//! use tagbridge_core::{RawPayload, TransportKind};
//! use tagbridge_protocol::{DaemonOutput, decode};
//!
//! let payload = RawPayload::Bytes(vec![0x04, 0xA1, 0xB2, 0xC3, 0x90, 0x00].into());
//! let tag = decode(TransportKind::Usb, &payload, DaemonOutput::Lines).unwrap();
//! assert_eq!(tag.as_str(), "04a1b2c3");
//!
//! let payload = RawPayload::Bytes(vec![0x63, 0x00].into());
//! assert!(decode(TransportKind::Usb, &payload, DaemonOutput::Lines).is_none());
//! ```

use serde::{Deserialize, Serialize};
use tagbridge_core::{
    RawPayload, TagId, TransportKind,
    constants::{APDU_MAX_UID_BYTES, APDU_MIN_RESPONSE_LEN, APDU_STATUS_SUCCESS},
};

/// Output format of the external scanning process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonOutput {
    /// libnfc style text with a `UID ...: xx xx xx xx` line.
    #[default]
    Lines,
    /// JSON object with a `uid` or `data` field, raw text accepted as fallback.
    Json,
}

/// Decode a raw payload produced by `transport`.
///
/// `daemon_output` selects the sub-decoder for daemon payloads and is ignored
/// for the other transports. Payload variants a transport never produces
/// (text from USB) decode to `None`.
pub fn decode(
    transport: TransportKind,
    payload: &RawPayload,
    daemon_output: DaemonOutput,
) -> Option<TagId> {
    match (transport, payload) {
        (TransportKind::Proximity, RawPayload::Text(serial)) => decode_proximity(serial),
        (TransportKind::Proximity, RawPayload::Bytes(uid)) => TagId::from_uid_bytes(uid).ok(),
        (TransportKind::Usb, RawPayload::Bytes(response)) => decode_apdu(response),
        (TransportKind::Usb, RawPayload::Text(_)) => None,
        (TransportKind::Daemon, RawPayload::Text(output)) => decode_daemon(output, daemon_output),
        (TransportKind::Daemon, RawPayload::Bytes(output)) => std::str::from_utf8(output)
            .ok()
            .and_then(|text| decode_daemon(text, daemon_output)),
    }
}

fn decode_daemon(output: &str, format: DaemonOutput) -> Option<TagId> {
    match format {
        DaemonOutput::Lines => decode_daemon_lines(output),
        DaemonOutput::Json => decode_daemon_json(output),
    }
}

/// Decode a serial number delivered by platform proximity scanning.
///
/// ```
/// use tagbridge_protocol::decode_proximity;
///
/// assert_eq!(decode_proximity("04:a1:b2:c3").unwrap().as_str(), "04a1b2c3");
/// assert!(decode_proximity("04:a1").is_none());
/// ```
pub fn decode_proximity(serial: &str) -> Option<TagId> {
    TagId::parse(serial).ok()
}

/// Decode an ISO-7816 response to the "get UID" command.
///
/// A response carries a UID when it is at least four bytes long and ends in
/// the `90 00` status word. The bytes preceding the status word are the UID,
/// of which at most seven are kept.
///
/// ```
/// use tagbridge_protocol::decode_apdu;
///
/// let tag = decode_apdu(&[0x04, 0xA1, 0xB2, 0xC3, 0x90, 0x00]).unwrap();
/// assert_eq!(tag.as_str(), "04a1b2c3");
///
/// // 6A 82: no card in the field
/// assert!(decode_apdu(&[0x6A, 0x82]).is_none());
/// ```
pub fn decode_apdu(response: &[u8]) -> Option<TagId> {
    if response.len() < APDU_MIN_RESPONSE_LEN {
        return None;
    }

    let (uid, status) = response.split_at(response.len() - APDU_STATUS_SUCCESS.len());
    if status != APDU_STATUS_SUCCESS {
        return None;
    }

    let uid = &uid[..uid.len().min(APDU_MAX_UID_BYTES)];
    TagId::from_uid_bytes(uid).ok()
}

/// Decode the text output of a libnfc poll.
///
/// The first line that mentions `UID` and has a valid hex value after its
/// first colon wins. Whitespace inside the value is removed, so
/// `UID (NFCID1): 04  a1  b2  c3` decodes to `04a1b2c3`.
pub fn decode_daemon_lines(output: &str) -> Option<TagId> {
    output
        .lines()
        .filter_map(|line| {
            let start = line.find("UID")?;
            let (_, value) = line[start..].split_once(':')?;
            Some(value)
        })
        .find_map(|value| {
            let compact: String = value.split_whitespace().collect();
            TagId::parse(&compact).ok()
        })
}

/// Decode the output of a PC/SC helper.
///
/// JSON objects are searched for a `uid` field, then a `data` field. Output
/// that is not JSON at all is read as libnfc poll text, then as a bare UID,
/// so helpers that wrap `nfc-poll` decode too.
///
/// ```
/// use tagbridge_protocol::decode_daemon_json;
///
/// assert_eq!(decode_daemon_json(r#"{"uid":"04A1B2C3"}"#).unwrap().as_str(), "04a1b2c3");
/// assert_eq!(decode_daemon_json(r#"{"data":"04:a1:b2:c3"}"#).unwrap().as_str(), "04a1b2c3");
/// assert_eq!(decode_daemon_json(" 04A1B2C3\n").unwrap().as_str(), "04a1b2c3");
/// assert_eq!(decode_daemon_json("UID (NFCID1): 04  a1  b2  c3").unwrap().as_str(), "04a1b2c3");
/// assert!(decode_daemon_json(r#"{"status":"waiting"}"#).is_none());
/// ```
pub fn decode_daemon_json(output: &str) -> Option<TagId> {
    let trimmed = output.trim();
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(fields)) => ["uid", "data"]
            .iter()
            .filter_map(|key| fields.get(*key)?.as_str())
            .find_map(|value| TagId::parse(value).ok()),
        Ok(serde_json::Value::String(value)) => TagId::parse(&value).ok(),
        Ok(_) => None,
        Err(_) => decode_daemon_lines(trimmed).or_else(|| TagId::parse(trimmed).ok()),
    }
}
