//! Property-based tests for the payload decoders.
//!
//! These tests generate arbitrary reader responses and check that decoding
//! never fails loudly and that every produced tag id is canonical.

use proptest::prelude::*;
use tagbridge_core::{RawPayload, TagId, TransportKind};
use tagbridge_protocol::{DaemonOutput, decode, decode_apdu, decode_daemon_lines, decode_proximity};

/// UID bytes long enough to form a tag id, with at least one non-zero byte
/// among the first seven.
fn valid_uid() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 4..=68)
        .prop_filter("leading uid bytes must not all be zero", |uid| {
            uid.iter().take(7).any(|b| *b != 0)
        })
}

fn upper_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn is_canonical(tag: &TagId) -> bool {
    let s = tag.as_str();
    s.len() >= 8
        && s
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

proptest! {
    /// Property: a successful response yields the hex of its leading UID
    /// bytes, truncated to seven, in lower case.
    #[test]
    fn prop_apdu_success_yields_leading_uid(uid in valid_uid()) {
        let mut response = uid.clone();
        response.extend_from_slice(&[0x90, 0x00]);

        let tag = decode_apdu(&response).expect("valid response must decode");
        let expected = upper_hex(&uid[..uid.len().min(7)]).to_lowercase();
        prop_assert_eq!(tag.as_str(), expected.as_str());
    }

    /// Property: a response without the success status word never decodes.
    #[test]
    fn prop_apdu_without_success_status_is_none(
        body in prop::collection::vec(any::<u8>(), 0..=68),
        sw1 in any::<u8>(),
        sw2 in any::<u8>(),
    ) {
        prop_assume!((sw1, sw2) != (0x90, 0x00));
        let mut response = body;
        response.extend_from_slice(&[sw1, sw2]);
        prop_assert!(decode_apdu(&response).is_none());
    }

    /// Property: responses shorter than four bytes never decode.
    #[test]
    fn prop_short_apdu_is_none(response in prop::collection::vec(any::<u8>(), 0..4)) {
        prop_assert!(decode_apdu(&response).is_none());
    }

    /// Property: no decoder panics on arbitrary input and every decoded id is
    /// canonical.
    #[test]
    fn prop_decoders_only_emit_canonical_ids(
        bytes in prop::collection::vec(any::<u8>(), 0..128),
        text in ".{0,128}",
    ) {
        let payloads = [
            (TransportKind::Usb, RawPayload::Bytes(bytes.clone().into())),
            (TransportKind::Proximity, RawPayload::Text(text.clone())),
            (TransportKind::Proximity, RawPayload::Bytes(bytes.clone().into())),
            (TransportKind::Daemon, RawPayload::Text(text.clone())),
            (TransportKind::Daemon, RawPayload::Bytes(bytes.into())),
        ];

        for (transport, payload) in &payloads {
            for format in [DaemonOutput::Lines, DaemonOutput::Json] {
                if let Some(tag) = decode(*transport, payload, format) {
                    prop_assert!(is_canonical(&tag), "non-canonical id {}", tag);
                }
            }
        }
    }

    /// Property: separators and case never change the decoded identity.
    #[test]
    fn prop_proximity_ignores_separators_and_case(uid in prop::collection::vec(1u8..=255, 4..=10)) {
        let plain = upper_hex(&uid);
        let colon = uid.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":");

        prop_assert_eq!(decode_proximity(&plain), decode_proximity(&colon));
    }

    /// Property: a libnfc `UID` line with spaced bytes decodes to the same id
    /// as the compact form.
    #[test]
    fn prop_daemon_line_strips_interior_whitespace(uid in prop::collection::vec(1u8..=255, 4..=10)) {
        let spaced = uid.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join("  ");
        let output = format!("       UID (NFCID1): {spaced}\n");

        let tag = decode_daemon_lines(&output).expect("uid line must decode");
        let expected = upper_hex(&uid).to_lowercase();
        prop_assert_eq!(tag.as_str(), expected.as_str());
    }
}
