//! Error types for document persistence.

use thiserror::Error;

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors that can occur when saving or loading documents.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// The saved bytes are not a valid document.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The document decoded but violates a structural invariant.
    #[error("corrupt document: {0}")]
    Corrupt(String),
}
