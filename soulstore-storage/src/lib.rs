//! Backend record stores for soulstore.
//!
//! The engine persists one opaque record per soul. [`BackendStore`] is the
//! async capability it consumes; two implementations ship here:
//!
//! - [`MemoryStore`]: a process-local map, with write-failure injection for
//!   exercising retry paths
//! - [`SqliteStore`]: a single `records` table in an SQLite file, accessed
//!   from blocking tasks

mod error;
mod memory;
mod sqlite;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, open_sqlite_with_wal_recovery};
pub use store::{BackendStore, SetOptions};
