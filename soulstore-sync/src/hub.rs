use crate::error::{SyncError, SyncResult};
use crate::manager::{DiscoverOptions, OnSynced, SyncManager};
use async_trait::async_trait;
use soulstore_crdt::Document;
use soulstore_types::{PeerId, Soul};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct Resource {
    doc: Document,
    on_synced: OnSynced,
}

struct Replica {
    online: bool,
    failing: bool,
    resources: HashMap<Soul, Resource>,
}

impl Default for Replica {
    fn default() -> Self {
        Self {
            online: true,
            failing: false,
            resources: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct HubState {
    replicas: HashMap<PeerId, Replica>,
    deliveries: usize,
}

type Delivery = (OnSynced, Soul, Document);

/// Connects in-process replicas.
///
/// The hub remembers the last document each replica published per soul.
/// A document is delivered to another replica only if that replica's last
/// published heads do not already cover it. Every delivered document goes
/// through `save`/`load`, as it would over a real wire.
#[derive(Clone, Default)]
pub struct LocalSyncHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalSyncHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the manager for one replica, registering it if needed.
    pub fn peer(&self, peer_id: PeerId) -> LocalSyncManager {
        self.lock().replicas.entry(peer_id).or_default();
        LocalSyncManager {
            hub: self.clone(),
            peer_id,
        }
    }

    /// Total number of documents delivered to callbacks so far.
    pub fn delivery_count(&self) -> usize {
        self.lock().deliveries
    }

    /// The last document `peer_id` published for `soul`.
    pub fn published(&self, peer_id: PeerId, soul: &Soul) -> Option<Document> {
        self.lock()
            .replicas
            .get(&peer_id)?
            .resources
            .get(soul)
            .map(|r| r.doc.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `doc` as `from`'s state and works out what to deliver.
    ///
    /// `offer` sends `doc` to the other holders of `soul`; `pull` sends their
    /// state back to `from`.
    fn exchange(
        &self,
        from: PeerId,
        soul: &Soul,
        doc: Document,
        on_synced: OnSynced,
        offer: bool,
        pull: bool,
    ) -> SyncResult<Vec<Delivery>> {
        let mut state = self.lock();
        let replica = state.replicas.entry(from).or_default();
        if replica.failing {
            return Err(SyncError::Network(format!("replica {from} is unreachable")));
        }
        replica.resources.insert(
            soul.clone(),
            Resource {
                doc: doc.clone(),
                on_synced: on_synced.clone(),
            },
        );
        if !replica.online {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for (peer, other) in &state.replicas {
            if *peer == from || !other.online {
                continue;
            }
            let Some(theirs) = other.resources.get(soul) else {
                continue;
            };
            if offer && !doc.is_empty() && !theirs.doc.clock().dominates(doc.clock()) {
                out.push((Arc::clone(&theirs.on_synced), soul.clone(), doc.clone()));
            }
            if pull && !theirs.doc.is_empty() && !doc.clock().dominates(theirs.doc.clock()) {
                out.push((Arc::clone(&on_synced), soul.clone(), theirs.doc.clone()));
            }
        }
        state.deliveries += out.len();
        Ok(out)
    }

    fn deliver(deliveries: Vec<Delivery>) -> SyncResult<()> {
        for (on_synced, soul, doc) in deliveries {
            let wire = Document::load(&doc.save()?)?;
            debug!("delivering document for {soul}");
            on_synced(soul, wire);
        }
        Ok(())
    }
}

/// One replica's view of a [`LocalSyncHub`].
#[derive(Clone)]
pub struct LocalSyncManager {
    hub: LocalSyncHub,
    peer_id: PeerId,
}

impl LocalSyncManager {
    /// Simulates a network partition. Going back online exchanges every
    /// resource of this replica with its peers.
    pub fn set_online(&self, online: bool) -> SyncResult<()> {
        let resources: Vec<(Soul, Document, OnSynced)> = {
            let mut state = self.hub.lock();
            let replica = state.replicas.entry(self.peer_id).or_default();
            replica.online = online;
            if !online {
                return Ok(());
            }
            replica
                .resources
                .iter()
                .map(|(soul, r)| (soul.clone(), r.doc.clone(), Arc::clone(&r.on_synced)))
                .collect()
        };
        debug!("replica {} back online with {} resources", self.peer_id, resources.len());
        for (soul, doc, on_synced) in resources {
            let deliveries = self
                .hub
                .exchange(self.peer_id, &soul, doc, on_synced, true, true)?;
            LocalSyncHub::deliver(deliveries)?;
        }
        Ok(())
    }

    /// Makes every subsequent call fail with a network error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.hub
            .lock()
            .replicas
            .entry(self.peer_id)
            .or_default()
            .failing = failing;
    }
}

#[async_trait]
impl SyncManager for LocalSyncManager {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn discover(
        &self,
        soul: &Soul,
        doc: &Document,
        on_synced: OnSynced,
        options: DiscoverOptions,
    ) -> SyncResult<()> {
        debug!(
            "replica {} discovering {soul} (incoming only: {})",
            self.peer_id, options.incoming_sync
        );
        let deliveries = self.hub.exchange(
            self.peer_id,
            soul,
            doc.clone(),
            on_synced,
            !options.incoming_sync,
            true,
        )?;
        LocalSyncHub::deliver(deliveries)
    }

    async fn set_resource(
        &self,
        soul: &Soul,
        doc: &Document,
        on_synced: OnSynced,
    ) -> SyncResult<()> {
        let deliveries =
            self.hub
                .exchange(self.peer_id, soul, doc.clone(), on_synced, true, false)?;
        LocalSyncHub::deliver(deliveries)
    }

    fn is_responsible(&self, soul: &Soul) -> bool {
        self.hub
            .lock()
            .replicas
            .get(&self.peer_id)
            .is_some_and(|r| r.resources.contains_key(soul))
    }

    async fn drop_resource(&self, soul: &Soul) -> SyncResult<()> {
        let mut state = self.hub.lock();
        if let Some(replica) = state.replicas.get_mut(&self.peer_id) {
            if replica.failing {
                return Err(SyncError::Network(format!(
                    "replica {} is unreachable",
                    self.peer_id
                )));
            }
            replica.resources.remove(soul);
        }
        Ok(())
    }
}
