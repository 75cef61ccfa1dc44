//! Error types for the schema model and codec.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while encoding or decoding values.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The value has no wire form (runtime handles).
    #[error("value of type {0} cannot be serialized")]
    NotSerializable(&'static str),

    /// A tagged wire string could not be decoded.
    #[error("malformed wire value: {0}")]
    Malformed(String),

    /// The tag after the sentinel is not known to this codec.
    #[error("unknown wire tag: {0:?}")]
    UnknownTag(String),

    /// Embedded JSON inside a tagged string failed to parse.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
