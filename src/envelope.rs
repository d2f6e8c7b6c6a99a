//! Topic message envelope
//!
//! Payloads travel between nodes as JSON text. A publish without a payload is
//! sent as the literal `false`, never as `null` or an empty message, so every
//! node decodes the same value for it.

use serde::Serialize;
use serde_json::Value;

use crate::error::{PresenceError, Result};

/// Wire text for a publish without a payload
pub const ABSENT: &str = "false";

/// A payload as handed to `publish`
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    /// No payload; encoded as [`ABSENT`]
    Absent,
    /// A value encoded as its JSON text
    Value(T),
}

impl<T> From<Option<T>> for Envelope<T> {
    fn from(payload: Option<T>) -> Self {
        match payload {
            Some(value) => Envelope::Value(value),
            None => Envelope::Absent,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encode into the text published on the channel
    pub fn encode(&self) -> Result<String> {
        match self {
            Envelope::Absent => Ok(ABSENT.to_string()),
            Envelope::Value(value) => serde_json::to_string(value).map_err(PresenceError::Encode),
        }
    }
}

/// Decode a raw channel message
pub fn decode(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw).map_err(PresenceError::Decode)
}
