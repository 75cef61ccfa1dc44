//! Core type definitions for soulstore.
//!
//! This crate defines the fundamental types shared by every layer of the
//! object-persistence engine:
//! - Souls (graph node identifiers) and peer identifiers
//! - Hybrid Logical Clock timestamps
//! - The dynamic attribute [`Value`] model
//! - Change events emitted by decorated entities

mod event;
mod ids;
mod timestamp;
mod value;

pub use event::{AttributeChange, EntityEvent, EventKind};
pub use ids::{PeerId, Soul};
pub use timestamp::HybridTimestamp;
pub use value::Value;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid soul: {0:?}")]
    InvalidSoul(String),
}
