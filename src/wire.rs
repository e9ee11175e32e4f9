//! Payload encoding carried inside frames.
//!
//! Every structured payload is a JSON object with a protocol version `v` and
//! a `type` tag next to the message fields:
//!
//! ```json
//! {"v":1,"type":"identity","name":"web-01","username":"ops","role":1,"version":"1.0","uuid":"..."}
//! {"v":1,"type":"command","kind":1,"module_file":"shell.bin","target":"..."}
//! {"v":1,"type":"batch","commands":[...]}
//! ```
//!
//! Free-form payloads (module bytes, status replies, the activity log, error
//! text) are sent raw and never pass through this module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Command, Identity};

/// Current payload encoding version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Errors from encoding or decoding a structured payload.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported payload version {found} (expected {expected})")]
    UnsupportedVersion { expected: u32, found: u32 },
    #[error("Expected {expected} message, got {found}")]
    Unexpected {
        expected: &'static str,
        found: &'static str,
    },
}

/// A structured payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame on every connection.
    Identity(Identity),
    /// A single command, controller to router or router to endpoint.
    Command(Command),
    /// The commands queued for one endpoint, in queue order.
    Batch { commands: Vec<Command> },
}

impl Message {
    fn type_name(&self) -> &'static str {
        match self {
            Message::Identity(_) => "identity",
            Message::Command(_) => "command",
            Message::Batch { .. } => "batch",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    #[serde(flatten)]
    message: Message,
}

#[derive(Deserialize)]
struct VersionHeader {
    v: u32,
}

/// Encode a message into a versioned payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        message: message.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode a versioned payload.
///
/// The version is checked before the body so that a newer peer gets a
/// version error rather than a confusing field error.
pub fn decode(payload: &[u8]) -> Result<Message, WireError> {
    let header: VersionHeader = serde_json::from_slice(payload)?;
    if header.v != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            found: header.v,
        });
    }
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(envelope.message)
}

pub fn encode_identity(identity: &Identity) -> Result<Vec<u8>, WireError> {
    encode(&Message::Identity(identity.clone()))
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>, WireError> {
    encode(&Message::Command(command.clone()))
}

pub fn encode_batch(commands: &[Command]) -> Result<Vec<u8>, WireError> {
    encode(&Message::Batch {
        commands: commands.to_vec(),
    })
}

pub fn decode_identity(payload: &[u8]) -> Result<Identity, WireError> {
    match decode(payload)? {
        Message::Identity(identity) => Ok(identity),
        other => Err(WireError::Unexpected {
            expected: "identity",
            found: other.type_name(),
        }),
    }
}

pub fn decode_command(payload: &[u8]) -> Result<Command, WireError> {
    match decode(payload)? {
        Message::Command(command) => Ok(command),
        other => Err(WireError::Unexpected {
            expected: "command",
            found: other.type_name(),
        }),
    }
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<Command>, WireError> {
    match decode(payload)? {
        Message::Batch { commands } => Ok(commands),
        other => Err(WireError::Unexpected {
            expected: "batch",
            found: other.type_name(),
        }),
    }
}
