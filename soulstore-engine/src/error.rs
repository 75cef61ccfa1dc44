//! Error types for the engine.

use soulstore_crdt::CrdtError;
use soulstore_crypto::CryptoError;
use soulstore_model::ModelError;
use soulstore_storage::StorageError;
use soulstore_sync::SyncError;
use soulstore_types::Soul;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the engine.
///
/// Attribute reads and writes never return these; they log and fall back to
/// `None`/`false`. Lifecycle operations (restore, materialize, flush, merge,
/// transactions) do.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown schema or attribute.
    #[error("schema error: {0}")]
    Schema(String),

    /// No stored record exists for the soul.
    #[error("no record for soul {0}")]
    NotFound(Soul),

    /// The entity cannot take on the requested identity.
    #[error("reservation error: {0}")]
    Reservation(String),

    /// A remote document could not be reconciled. Local state is unchanged.
    #[error("merge failed for {soul}: {reason}")]
    MergeFailure { soul: Soul, reason: String },

    /// Backend store failure.
    #[error("backend I/O error: {0}")]
    BackendIo(#[from] StorageError),

    /// Sync manager failure.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Encryption or decryption failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A persisted record could not be decoded.
    #[error("malformed record: {0}")]
    Envelope(String),

    /// Mutation attempted through a tombstone view.
    #[error("entity {0} is opened read-only")]
    ReadOnly(Soul),

    /// Illegal transaction state transition or failed prepare.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The session was built outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The session was shut down.
    #[error("session closed")]
    Closed,

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<CrdtError> for EngineError {
    fn from(err: CrdtError) -> Self {
        Self::Envelope(err.to_string())
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        Self::Envelope(err.to_string())
    }
}
