#![forbid(unsafe_code)]

//! Wire contract for the push gateway. Every frame, inbound or outbound, is a
//! JSON envelope `{ v, t, d }`: version, event type, event data.

use serde::{Deserialize, Serialize};

/// Envelope version this crate speaks.
pub const PROTOCOL_VERSION: u16 = 1;
/// Hard cap on a single gateway frame, in bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

const MAX_EVENT_TYPE_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {got} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { limit: usize, got: usize },
    #[error("envelope version {got} is not version {expected}")]
    VersionMismatch { expected: u16, got: u16 },
    #[error("event type is not a valid identifier")]
    BadEventType,
    #[error("frame is not a well-formed envelope")]
    Malformed,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::Malformed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

/// Event name restricted to `[a-z0-9_.]`, 1 to 64 bytes. The allowlist keeps
/// event types safe to embed in log lines and routing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let in_range = (1..=MAX_EVENT_TYPE_LEN).contains(&value.len());
        let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.';
        if in_range && value.chars().all(allowed) {
            Ok(Self(value))
        } else {
            Err(ProtocolError::BadEventType)
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Decode one inbound frame: size cap first, then JSON shape, then version.
/// The event type is validated by its `TryFrom` during deserialization.
///
/// # Errors
/// Returns [`ProtocolError`] describing the first check the frame failed.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            limit: MAX_EVENT_BYTES,
            got: input.len(),
        });
    }
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v == PROTOCOL_VERSION {
        Ok(envelope)
    } else {
        Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: envelope.v,
        })
    }
}
