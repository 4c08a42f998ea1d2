//! Base64 text codec for CRDT update fragments.
//!
//! Updates are raw lib0 v1 binary, but both the broadcast channel payloads
//! and the persistence log carry text. Every update crosses this boundary
//! exactly once per direction, so the round-trip law
//! `decode(encode(x)) == x` is load-bearing for convergence.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Encode raw update bytes as transport-safe text.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode text produced by [`encode`] back into raw update bytes.
///
/// Malformed input is an error, never a truncated result.
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Codec errors.
///
/// Also used by the wire protocol for envelopes that fail to decode
/// (unknown tag, malformed body).
#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::Decode(e) => write!(f, "Decode error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}
