//! Relay protocol types using rkyv for zero-copy serialization
//!
//! One request is processed at a time per connection; replies come back in
//! request order. `StateChanged` frames may be interleaved between replies
//! once a terminal has subscribed.

use super::TerminalMode;
use crate::error::ProtocolError;
use crate::lifecycle::{CommandResult, LifecycleState, Value};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Request from terminal to service
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Lifecycle verb (start, stop, reload, pause, resume) or callback kind
    Command { kind: String, args: Vec<Value> },
    /// Stream state changes to this connection
    Subscribe,
    Unsubscribe,
    Ping,
}

/// Frame from service to terminal
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// First frame on every accepted connection
    Hello {
        service: String,
        mode: TerminalMode,
        state: LifecycleState,
    },
    /// Reply to `Command`
    Outcome {
        result: CommandResult,
        state: LifecycleState,
        value: Value,
    },
    Subscribed { state: LifecycleState },
    Unsubscribed,
    /// Pushed to subscribed terminals
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Pong {
        service: String,
        state: LifecycleState,
    },
    /// Request not allowed in this terminal's mode
    Refused { reason: String },
    Error { message: String },
}

impl Response {
    pub fn is_event(&self) -> bool {
        matches!(self, Response::StateChanged { .. })
    }
}

/// Length-delimited framing: `[4-byte length (little-endian)][rkyv bytes]`
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    rkyv::to_bytes::<rkyv::rancor::Error>(request)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, ProtocolError> {
    rkyv::to_bytes::<rkyv::rancor::Error>(response)
        .map(|bytes| bytes.to_vec())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let aligned = aligned(bytes);
    rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let aligned = aligned(bytes);
    rkyv::from_bytes::<Response, rkyv::rancor::Error>(&aligned)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

// Validation needs the archive root correctly aligned; frames from the codec
// carry no such guarantee.
fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
