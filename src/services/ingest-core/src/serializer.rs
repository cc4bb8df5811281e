//! JSON encoding and validation wrapper for [`MediaEvent`].
//!
//! Grounded in `events.rs`'s `serde_json::to_value`/`from_value` round-trip
//! conventions: marshalling validates first, unmarshalling only decodes
//! (the caller re-validates if it cares to).

use crate::error::{IngestError, Result};
use crate::model::MediaEvent;

/// Validate and JSON-encode an event.
pub fn marshal(event: &MediaEvent) -> Result<Vec<u8>> {
    event.validate()?;
    serde_json::to_vec(event).map_err(IngestError::from)
}

/// JSON-decode an event without validating it.
pub fn unmarshal(bytes: &[u8]) -> Result<MediaEvent> {
    serde_json::from_slice(bytes).map_err(IngestError::from)
}
