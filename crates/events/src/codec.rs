//! Canonical JSON codec for envelopes.
//!
//! The wire shape is snake_case with RFC-3339 timestamps; validation (event
//! type grammar, identifier well-formedness, schema version) happens during
//! deserialization through the field types themselves.

use thiserror::Error;

use crate::envelope::EventEnvelope;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("envelope decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode an envelope to its canonical JSON byte form.
pub fn encode(envelope: &EventEnvelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(CodecError::Encode)
}

/// Decode and validate an envelope from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<EventEnvelope, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
