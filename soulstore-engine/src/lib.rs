//! Reactive object persistence over a replicated entity graph.
//!
//! A [`GraphSession`] hands out decorated [`Entity`] handles. Every write to
//! an entity updates its CRDT mirror document, emits an event, and schedules
//! a debounced flush that writes the document to the backend store and
//! publishes it to peers through the sync manager. Peer documents come back
//! through the same manager and are merged, resolving conflicting references
//! between entities on top of the document's own last-writer rule.
//!
//! ```no_run
//! use soulstore_engine::{EntityAccess, GraphSession};
//! use soulstore_model::{AttributeOptions, Schema};
//!
//! # async fn demo() -> soulstore_engine::EngineResult<()> {
//! let session = GraphSession::builder().build()?;
//! session.register_schema(
//!     Schema::builder("Person")
//!         .attribute("name", AttributeOptions::text())
//!         .build(),
//! );
//! let ada = session.create("Person")?;
//! ada.set("name", "Ada".into()).await;
//! ada.materialize().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Modules:
//! - [`registry`]: one live instance per soul
//! - `entity`: the decorator and its attribute access
//! - `scheduler`: the debounced pending set
//! - `merge`: peer document reconciliation
//! - [`transaction`]: deferred writes with rollback
//! - [`envelope`]: the persisted record format

mod config;
mod entity;
pub mod envelope;
mod error;
mod merge;
pub mod registry;
mod scheduler;
mod session;
mod storage_key;
pub mod transaction;

pub use config::EngineConfig;
pub use entity::{EMERGENT_ATTRIBUTES, Entity, EntityAccess, Lifecycle};
pub use envelope::{EntryMeta, RecordEntry, StoredRecord, open_record, seal_record};
pub use error::{EngineError, EngineResult};
pub use registry::{IdentityRegistry, Referrer};
pub use session::{GraphSession, GraphSessionBuilder};
pub use storage_key::KeyStrategy;
pub use transaction::{Transaction, TransactionState};
