use crate::error::SyncResult;
use async_trait::async_trait;
use soulstore_crdt::Document;
use soulstore_types::{PeerId, Soul};
use std::sync::Arc;

/// Invoked with a peer's document for a soul, possibly repeatedly.
pub type OnSynced = Arc<dyn Fn(Soul, Document) + Send + Sync>;

/// Options for [`SyncManager::discover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoverOptions {
    /// The local replica has no state of its own for the soul yet and only
    /// wants to receive. Its (empty) document is not offered to peers.
    pub incoming_sync: bool,
}

/// Exchanges entity documents with other replicas.
#[async_trait]
pub trait SyncManager: Send + Sync {
    /// The replica this manager speaks for.
    fn local_peer_id(&self) -> PeerId;

    /// Starts tracking `soul` and exchanges state with peers that hold it.
    async fn discover(
        &self,
        soul: &Soul,
        doc: &Document,
        on_synced: OnSynced,
        options: DiscoverOptions,
    ) -> SyncResult<()>;

    /// Publishes a new local state for `soul`.
    async fn set_resource(&self, soul: &Soul, doc: &Document, on_synced: OnSynced)
    -> SyncResult<()>;

    /// Returns whether this manager tracks `soul`.
    fn is_responsible(&self, soul: &Soul) -> bool;

    /// Stops tracking `soul`.
    async fn drop_resource(&self, soul: &Soul) -> SyncResult<()>;
}
