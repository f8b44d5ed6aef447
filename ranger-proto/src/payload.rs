//! Schema-tagged payloads (§9 "Dynamic-typed args and request_data").
//!
//! The source system relies on dynamically typed protobuf-like values; per
//! §9's redesign note we persist every payload with an explicit type tag and
//! fail the *flow* (not the worker) when a receiving state's expected schema
//! doesn't match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value tagged with the name of the schema it was encoded against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedPayload {
    pub type_tag: String,
    pub json: serde_json::Value,
}

impl TypedPayload {
    pub fn new<T: Serialize>(type_tag: &str, value: &T) -> Result<Self, PayloadError> {
        Ok(Self {
            type_tag: type_tag.to_string(),
            json: serde_json::to_value(value)?,
        })
    }

    /// Deserialize against an expected type tag, failing if the tag doesn't
    /// match what the caller asked for.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self, expected_tag: &str) -> Result<T, PayloadError> {
        if self.type_tag != expected_tag {
            return Err(PayloadError::TagMismatch {
                expected: expected_tag.to_string(),
                actual: self.type_tag.clone(),
            });
        }
        Ok(serde_json::from_value(self.json.clone())?)
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload type mismatch: expected `{expected}`, got `{actual}`")]
    TagMismatch { expected: String, actual: String },
    #[error("payload (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}
