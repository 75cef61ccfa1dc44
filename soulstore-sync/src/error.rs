//! Error types for the sync layer.

use soulstore_crdt::CrdtError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// A document could not be encoded or decoded for transfer.
    #[error("document transfer error: {0}")]
    Document(#[from] CrdtError),
}
