//! Payload decoders and wire messages.
//!
//! [`decoder`] turns whatever a transport delivered into a candidate
//! [`TagId`](tagbridge_core::TagId). Decoders are pure: no I/O, no shared
//! state, and malformed input yields `None` instead of an error, because
//! hardware noise is expected and indistinguishable from "no card".
//!
//! [`message`] holds the JSON messages exchanged with subscribers of the
//! event channel and with callers of the control API.

pub mod decoder;
pub mod message;

pub use decoder::{
    DaemonOutput, decode, decode_apdu, decode_daemon_json, decode_daemon_lines, decode_proximity,
};
pub use message::{ClientMessage, ControlReply, ServerMessage, StatusReport};
