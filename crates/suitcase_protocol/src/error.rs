//! Error types for protocol decoding and validation.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding or validating server payloads.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON for the expected type.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload decoded but violates a structural rule.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
