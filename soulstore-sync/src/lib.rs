//! Replica synchronization for soulstore.
//!
//! The engine hands every persisted entity's mirror document to a
//! [`SyncManager`] and receives peer state back through an [`OnSynced`]
//! callback. How documents travel between peers is up to the manager.
//!
//! [`LocalSyncHub`] connects several in-process replicas. It is what tests
//! and single-process multi-replica setups use: each replica gets its own
//! [`LocalSyncManager`] from [`LocalSyncHub::peer`], and a resource update is
//! forwarded to every other replica that registered the same soul, but only
//! when it carries something the receiver does not already have.

mod error;
mod hub;
mod manager;

pub use error::{SyncError, SyncResult};
pub use hub::{LocalSyncHub, LocalSyncManager};
pub use manager::{DiscoverOptions, OnSynced, SyncManager};
