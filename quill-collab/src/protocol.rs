//! Wire envelope for broadcast channel payloads.
//!
//! Exactly two message kinds cross the channel (bincode-encoded):
//!
//! ```text
//! ┌───────────┬────────────┬───────────────────────────────┐
//! │ tag       │ sender     │ body                          │
//! │ Update    │ peer uuid  │ base64 text of merged delta   │
//! │ Awareness │ peer uuid  │ cursor + display identity     │
//! └───────────┴────────────┴───────────────────────────────┘
//! ```
//!
//! Decoding is an exhaustive match over the tagged union; an unknown tag
//! or malformed body is a [`CodecError`], never a best-effort parse.
//!
//! The `update` field carries the same text that is appended to the
//! persistence log, so a peer receiving the broadcast and a peer later
//! bootstrapping from the log replay byte-identical history.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::AwarenessState;
use crate::codec::CodecError;

/// A message broadcast on a document channel.
///
/// `sender` is the broadcasting replica's peer id; receivers drop their
/// own echoes by comparing it against their local id, so the protocol
/// stays correct on transports without self-delivery suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// A merged CRDT delta, text-encoded by the update codec.
    Update { sender: Uuid, update: String },
    /// The sender's full awareness state (cursor, identity).
    Awareness {
        sender: Uuid,
        state: AwarenessState,
    },
}

impl ChannelMessage {
    /// The broadcasting replica's peer id.
    pub fn sender(&self) -> Uuid {
        match self {
            Self::Update { sender, .. } => *sender,
            Self::Awareness { sender, .. } => *sender,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(message)
    }
}
