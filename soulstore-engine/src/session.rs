//! The graph session.
//!
//! A [`GraphSession`] owns everything process-wide: the identity registry,
//! the flush scheduler and its timer task, the transaction stack and the
//! event channel, plus the capabilities it was built with (backend store,
//! optional sync manager, envelope cipher, schema registry).
//!
//! Entities hold a weak reference back to the session. Dropping the last
//! `GraphSession` handle stops the timer; [`GraphSession::shutdown`] flushes
//! first and clears the registry.

use crate::config::EngineConfig;
use crate::entity::{
    Entity, EntityState, Lifecycle, META_CREATED, META_DELETED, META_MODIFIED, META_ORIGIN,
    SetOutcome, Snapshot, decode_values, now_millis,
};
use crate::envelope::{StoredRecord, build_entry, open_record, seal_record};
use crate::error::{EngineError, EngineResult};
use crate::scheduler::{self, FlushScheduler};
use crate::storage_key::{KeyStrategy, META_ENTITY_KEY};
use crate::transaction::Transaction;
use serde_json::{Value as JsonValue, json};
use soulstore_crdt::{Document, Head, LIST_LEN_KEY};
use soulstore_crypto::{EnvelopeCipher, PassthroughCipher, Salt, WrappedKey};
use soulstore_model::{OBJECT_ORIGIN, Schema, SchemaRegistry};
use soulstore_storage::{BackendStore, MemoryStore, SetOptions};
use soulstore_sync::{DiscoverOptions, OnSynced, SyncManager};
use soulstore_types::{EntityEvent, PeerId, Soul, Value};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) struct SessionInner {
    pub config: EngineConfig,
    pub peer: PeerId,
    pub store: Arc<dyn BackendStore>,
    pub sync: Option<Arc<dyn SyncManager>>,
    pub cipher: Arc<dyn EnvelopeCipher>,
    pub schemas: Arc<SchemaRegistry>,
    pub registry: crate::registry::IdentityRegistry,
    pub scheduler: Arc<FlushScheduler>,
    events: broadcast::Sender<EntityEvent>,
    transactions: Mutex<Vec<Transaction>>,
    next_transaction: AtomicU64,
    runtime: Handle,
    closed: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// Builds a [`GraphSession`].
#[derive(Default)]
pub struct GraphSessionBuilder {
    config: EngineConfig,
    peer_id: Option<PeerId>,
    store: Option<Arc<dyn BackendStore>>,
    sync: Option<Arc<dyn SyncManager>>,
    cipher: Option<Arc<dyn EnvelopeCipher>>,
    schemas: Option<Arc<SchemaRegistry>>,
}

impl GraphSessionBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The CRDT actor id. Defaults to the sync manager's peer id, or a new
    /// one.
    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// The backend store. Defaults to a fresh [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn BackendStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sync(mut self, sync: Arc<dyn SyncManager>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// The record cipher. Defaults to [`PassthroughCipher`].
    pub fn cipher(mut self, cipher: Arc<dyn EnvelopeCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    /// Builds the session and starts its flush timer on the current tokio
    /// runtime.
    pub fn build(self) -> EngineResult<GraphSession> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let peer = self
            .peer_id
            .or_else(|| self.sync.as_ref().map(|s| s.local_peer_id()))
            .unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn BackendStore>);
        let scheduler = Arc::new(FlushScheduler::new(
            self.config.debounce(),
            self.config.max_flush_retries,
        ));
        let (events, _) = broadcast::channel(self.config.event_capacity);

        info!(
            "starting graph session for peer {peer} on {} store (sync: {})",
            store.name(),
            self.sync.is_some()
        );
        let inner = Arc::new(SessionInner {
            config: self.config,
            peer,
            store,
            sync: self.sync,
            cipher: self.cipher.unwrap_or_else(|| Arc::new(PassthroughCipher)),
            schemas: self.schemas.unwrap_or_default(),
            registry: crate::registry::IdentityRegistry::new(),
            scheduler: Arc::clone(&scheduler),
            events,
            transactions: Mutex::new(Vec::new()),
            next_transaction: AtomicU64::new(1),
            runtime: runtime.clone(),
            closed: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        let timer = runtime.spawn(scheduler::run_timer(Arc::downgrade(&inner), scheduler));
        *inner.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        Ok(GraphSession { inner })
    }
}

/// Process-wide owner of decorated entities.
#[derive(Clone)]
pub struct GraphSession {
    inner: Arc<SessionInner>,
}

impl GraphSession {
    pub fn builder() -> GraphSessionBuilder {
        GraphSessionBuilder::default()
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.inner.schemas
    }

    /// Registers a schema with this session's registry.
    pub fn register_schema(&self, schema: Schema) -> Arc<Schema> {
        self.inner.schemas.register(schema)
    }

    /// Creates a new entity with a random soul. It is registered and
    /// reserved; its first write (or `materialize`) stores it.
    pub fn create(&self, origin: &str) -> EngineResult<Entity> {
        self.inner.ensure_open()?;
        let schema = self.inner.schema(origin)?;
        let entity = self
            .inner
            .new_entity(Soul::random(), schema, Lifecycle::Reserved)?;
        Ok(self.inner.registry.register(entity))
    }

    /// Creates a new entity under a caller-supplied soul, which must not be
    /// in use locally or in the backend.
    pub async fn create_with_soul(&self, origin: &str, soul: Soul) -> EngineResult<Entity> {
        self.inner.ensure_open()?;
        let schema = self.inner.schema(origin)?;
        if self.inner.registry.contains(&soul)
            || self.inner.registry.is_deleted(&soul)
            || self.inner.store.has(&soul).await?
        {
            return Err(EngineError::Reservation(format!("soul {soul} is already in use")));
        }
        let entity = self
            .inner
            .new_entity(soul.clone(), schema, Lifecycle::Reserved)?;
        let registered = self.inner.registry.register(entity.clone());
        if !registered.ptr_eq(&entity) {
            return Err(EngineError::Reservation(format!("soul {soul} is already in use")));
        }
        Ok(entity)
    }

    /// Creates an in-memory entity. It is not registered and never flushed
    /// until reserved or materialized.
    pub fn transient(&self, origin: &str) -> EngineResult<Entity> {
        self.inner.ensure_open()?;
        let schema = self.inner.schema(origin)?;
        self.inner
            .new_entity(Soul::random(), schema, Lifecycle::Transient)
    }

    /// Returns the live entity for `soul`: the registered instance, else one
    /// loaded from the backend, else one received from peers.
    pub async fn restore(&self, soul: &Soul) -> EngineResult<Entity> {
        self.inner.ensure_open()?;
        self.inner.restore(soul).await
    }

    /// Like [`GraphSession::restore`], with `None` instead of `NotFound`.
    pub async fn restore_or_none(&self, soul: &Soul) -> EngineResult<Option<Entity>> {
        match self.restore(soul).await {
            Ok(entity) => Ok(Some(entity)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Opens an entity read-only, deleted or not. Last-known attribute
    /// values stay readable.
    pub async fn open_tombstone(&self, soul: &Soul) -> EngineResult<Entity> {
        self.inner.ensure_open()?;
        if let Some(entity) = self
            .inner
            .registry
            .get(soul)
            .or_else(|| self.inner.scheduler.get(soul))
        {
            return Ok(entity.read_only_handle());
        }
        let bytes = self
            .inner
            .store
            .get(soul)
            .await?
            .ok_or_else(|| EngineError::NotFound(soul.clone()))?;
        Ok(self.inner.entity_from_record(soul, &bytes)?.read_only_handle())
    }

    /// The registered instance for `soul`, without loading.
    pub fn entity(&self, soul: &Soul) -> Option<Entity> {
        self.inner.registry.get(soul)
    }

    /// Reads and decodes the stored record of `soul`.
    pub async fn stored_record(&self, soul: &Soul) -> EngineResult<Option<StoredRecord>> {
        let Some(bytes) = self.inner.store.get(soul).await? else {
            return Ok(None);
        };
        open_record(&self.inner.config, self.inner.cipher.as_ref(), soul, &bytes).map(Some)
    }

    /// Flushes every pending entity now. Failed entities stay pending; the
    /// first error is returned.
    pub async fn flush(&self) -> EngineResult<()> {
        match scheduler::flush_pending(&self.inner).await {
            (_, Some(e)) => Err(e),
            (_, None) => Ok(()),
        }
    }

    /// Reconciles a peer's document for `soul` into the local state.
    pub async fn merge_remote(&self, soul: Soul, remote: Document) -> EngineResult<()> {
        self.inner.merge_remote(soul, remote).await
    }

    /// Starts a transaction and makes it current. A transaction begun while
    /// another is current becomes its child.
    pub fn begin(&self) -> EngineResult<Transaction> {
        self.inner.ensure_open()?;
        let id = self.inner.next_transaction.fetch_add(1, Ordering::SeqCst);
        let parent = self.inner.current_transaction();
        let transaction = Transaction::new(id, parent, Arc::downgrade(&self.inner));
        self.inner.lock_transactions().push(transaction.clone());
        debug!("transaction {id} started");
        Ok(transaction)
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.current_transaction()
    }

    /// Subscribes to entity events.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.inner.events.subscribe()
    }

    /// Number of registered entities.
    pub fn registered_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of entities waiting for a flush.
    pub fn pending_count(&self) -> usize {
        self.inner.scheduler.len()
    }

    /// Flushes, then closes the session and clears the registry.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let result = self.flush().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        let dropped = self.inner.scheduler.len();
        if dropped > 0 {
            warn!("shutting down with {dropped} entities still unflushed");
        }
        self.inner.scheduler.clear();
        self.inner.registry.clear();
        self.inner.lock_transactions().clear();
        self.inner.stop_timer();
        info!("graph session for peer {} shut down", self.inner.peer);
        result
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl SessionInner {
    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn schema(&self, origin: &str) -> EngineResult<Arc<Schema>> {
        self.schemas
            .get(origin)
            .ok_or_else(|| EngineError::Schema(format!("unknown origin {origin:?}")))
    }

    pub fn emit(&self, event: EntityEvent) {
        // No receiver is not an error.
        let _ = self.events.send(event);
    }

    // ── Transactions ─────────────────────────────────────────────

    fn lock_transactions(&self) -> MutexGuard<'_, Vec<Transaction>> {
        self.transactions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.lock_transactions().last().cloned()
    }

    pub fn remove_transaction(&self, id: u64) {
        self.lock_transactions().retain(|t| t.id() != id);
    }

    pub fn is_involved_in_transaction(&self, soul: &Soul) -> bool {
        self.lock_transactions().iter().any(|t| t.involves(soul))
    }

    /// Records `entity` with the current transaction, if any, before it is
    /// mutated. Returns whether a transaction is current.
    pub fn involve(&self, entity: &Entity, state: &EntityState) -> bool {
        let Some(transaction) = self.current_transaction() else {
            return false;
        };
        transaction.involve(entity, || Snapshot::capture(entity, state));
        true
    }

    // ── Construction ─────────────────────────────────────────────

    pub fn new_entity(
        self: &Arc<Self>,
        soul: Soul,
        schema: Arc<Schema>,
        lifecycle: Lifecycle,
    ) -> EngineResult<Entity> {
        let mut keys = KeyStrategy::for_new(&schema);
        let key_meta = keys.take_pending_meta(self.cipher.as_ref())?;
        let now = now_millis();
        let origin = schema.origin().to_string();
        let list = schema.is_list();
        let doc = Document::init().change(self.peer, |c| {
            c.put_meta(META_ORIGIN, json!(origin));
            c.put_meta(META_CREATED, json!(now));
            c.put_meta(META_MODIFIED, json!(now));
            if let Some((key, raw)) = key_meta {
                c.put_meta(key, raw);
            }
            if list {
                c.put_meta(LIST_LEN_KEY, json!(0));
            }
        });
        debug!("new {} entity {soul} ({lifecycle:?})", schema.origin());
        let state = EntityState {
            doc,
            values: Default::default(),
            keys,
            salt: Salt::random().to_base64(),
            stored_heads: None,
            synced_heads: None,
        };
        Ok(Entity::new(
            soul,
            Arc::downgrade(self),
            schema,
            lifecycle,
            false,
            state,
        ))
    }

    /// Creates and registers the child entity holding a promoted map or
    /// list value.
    pub fn build_child(
        self: &Arc<Self>,
        origin: &str,
        contents: Value,
        transient: bool,
    ) -> EngineResult<Entity> {
        let schema = self.schema(origin)?;
        let lifecycle = if transient {
            Lifecycle::Transient
        } else {
            Lifecycle::Reserved
        };
        let child = self
            .registry
            .register(self.new_entity(Soul::random(), schema, lifecycle)?);
        let items: Vec<(String, Value)> = match contents {
            Value::Map(map) => map.into_iter().collect(),
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => Vec::new(),
        };
        for (name, value) in items {
            if let SetOutcome::Rejected = child.apply_set(self, &name, value) {
                debug!("{origin} child {}: {name:?} not taken", child.soul());
            }
        }
        Ok(child)
    }

    /// Builds an entity around a document read from the backend or a peer.
    pub fn build_restored(
        self: &Arc<Self>,
        soul: &Soul,
        doc: Document,
        salt: String,
        stored: bool,
    ) -> EngineResult<Entity> {
        let origin = doc
            .get_meta(META_ORIGIN)
            .and_then(JsonValue::as_str)
            .unwrap_or(OBJECT_ORIGIN);
        let schema = self.schemas.get_or_untyped(origin);
        if schema.origin() != origin {
            warn!("{soul}: unknown origin {origin:?}, reading it as {}", schema.origin());
        }
        let keys = KeyStrategy::from_meta(schema.naming(), &doc, self.cipher.as_ref())?;
        let values = decode_values(&doc, &keys);
        for (name, value) in &values {
            if let Value::Entity(target) = value {
                self.registry.add_referrer(target, soul, name);
            }
        }
        let deleted = doc.get_meta(META_DELETED).is_some();
        let heads = doc.get_heads();
        let state = EntityState {
            doc,
            values,
            keys,
            salt,
            stored_heads: stored.then_some(heads),
            synced_heads: None,
        };
        Ok(Entity::new(
            soul.clone(),
            Arc::downgrade(self),
            schema,
            Lifecycle::Materialized,
            deleted,
            state,
        ))
    }

    pub fn entity_from_record(self: &Arc<Self>, soul: &Soul, bytes: &[u8]) -> EngineResult<Entity> {
        let record = open_record(&self.config, self.cipher.as_ref(), soul, bytes)?;
        if record.version > self.config.persister_version {
            warn!(
                "{soul}: record version {} is newer than {}",
                record.version, self.config.persister_version
            );
        }
        let doc = record.entry.document()?;
        self.build_restored(soul, doc, record.salt, true)
    }

    pub fn reserve(&self, entity: &Entity) -> EngineResult<()> {
        let registered = self.registry.register(entity.clone());
        if !registered.ptr_eq(entity) {
            return Err(EngineError::Reservation(format!(
                "soul {} is already in use",
                entity.soul()
            )));
        }
        entity.set_lifecycle(Lifecycle::Reserved);
        Ok(())
    }

    // ── Restore ──────────────────────────────────────────────────

    pub async fn restore(self: &Arc<Self>, soul: &Soul) -> EngineResult<Entity> {
        if let Some(entity) = self.registry.get(soul) {
            return Ok(entity);
        }
        if self.registry.is_deleted(soul) {
            return Err(EngineError::NotFound(soul.clone()));
        }
        let session = Arc::clone(self);
        let target = soul.clone();
        self.registry
            .get_or_try_init(soul, move || async move { session.load(&target).await })
            .await
    }

    /// Resolves a reference, logging anything but a missing record.
    pub async fn resolve(self: &Arc<Self>, soul: &Soul) -> Option<Entity> {
        match self.restore(soul).await {
            Ok(entity) => Some(entity),
            Err(EngineError::NotFound(_)) => None,
            Err(e) => {
                warn!("cannot resolve {soul}: {e}");
                None
            }
        }
    }

    async fn load(self: &Arc<Self>, soul: &Soul) -> EngineResult<Entity> {
        let Some(bytes) = self.store.get(soul).await? else {
            return self.load_from_peers(soul).await;
        };
        let entity = self.entity_from_record(soul, &bytes)?;
        if entity.is_deleted() {
            debug!("{soul} is a tombstone");
            return Err(EngineError::NotFound(soul.clone()));
        }
        debug!("restored {soul} from {} store", self.store.name());
        if self.sync.is_some() {
            // The next flush subscribes it with peers.
            self.scheduler.enqueue(&entity);
        }
        self.after_restore(&entity);
        Ok(entity)
    }

    async fn load_from_peers(self: &Arc<Self>, soul: &Soul) -> EngineResult<Entity> {
        let Some(sync) = self.sync.clone() else {
            return Err(EngineError::NotFound(soul.clone()));
        };
        let (tx, rx) = oneshot::channel::<Document>();
        let waiting = Arc::new(Mutex::new(Some(tx)));
        let fallback = self.on_synced();
        let on_synced: OnSynced = Arc::new(move |soul, doc| {
            let tx = waiting.lock().unwrap_or_else(PoisonError::into_inner).take();
            match tx {
                Some(tx) => {
                    if let Err(doc) = tx.send(doc) {
                        fallback(soul, doc);
                    }
                }
                None => fallback(soul, doc),
            }
        });
        sync.discover(
            soul,
            &Document::init(),
            on_synced,
            DiscoverOptions {
                incoming_sync: true,
            },
        )
        .await?;

        match tokio::time::timeout(self.config.sync_restore_timeout(), rx).await {
            Ok(Ok(doc)) if !doc.is_empty() => {
                let entity = self.build_restored(soul, doc, Salt::random().to_base64(), false)?;
                if entity.is_deleted() {
                    self.registry.mark_deleted(soul);
                    return Err(EngineError::NotFound(soul.clone()));
                }
                debug!("restored {soul} from peers");
                self.scheduler.enqueue(&entity);
                self.after_restore(&entity);
                Ok(entity)
            }
            _ => {
                if let Err(e) = sync.drop_resource(soul).await {
                    debug!("dropping unanswered discovery of {soul}: {e}");
                }
                Err(EngineError::NotFound(soul.clone()))
            }
        }
    }

    fn after_restore(&self, entity: &Entity) {
        if let Some(hooks) = entity.schema().hooks() {
            hooks.on_after_restore(&entity.view());
        }
    }

    // ── Materialize, flush and sync ──────────────────────────────

    /// Hands a mutated entity to the scheduler, or flushes it right away for
    /// immediate schemas.
    pub fn schedule(self: &Arc<Self>, entity: &Entity) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !entity.schema().is_immediate() {
            self.scheduler.enqueue(entity);
            return;
        }
        let session = Arc::clone(self);
        let entity = entity.clone();
        self.runtime.spawn(async move {
            if let Err(e) = session.flush_entity(&entity).await {
                warn!("immediate flush of {} failed: {e}", entity.soul());
                session.scheduler.requeue_failed(entity, 1);
            }
        });
    }

    pub async fn materialize(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        if entity.is_read_only() {
            return Err(EngineError::ReadOnly(entity.soul().clone()));
        }
        let deferred = {
            let state = entity.lock_state();
            self.involve(entity, &state)
        };
        if deferred || entity.schema().is_ephemeral() {
            return Ok(());
        }
        let mut visited = HashSet::new();
        let mut written = Vec::new();
        self.materialize_tree(entity.clone(), &mut visited, &mut written)
            .await
    }

    /// Writes `entity` and, recursively, the registered entities it
    /// references. Every visited entity is appended to `written`.
    fn materialize_tree<'a>(
        self: &'a Arc<Self>,
        entity: Entity,
        visited: &'a mut HashSet<Soul>,
        written: &'a mut Vec<Entity>,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if !visited.insert(entity.soul().clone()) {
                return Ok(());
            }
            let schema = entity.schema();
            if schema.is_ephemeral() {
                return Ok(());
            }
            if entity.lifecycle() == Lifecycle::Transient {
                self.reserve(&entity)?;
            }
            if let Some((bytes, heads)) = self.prepare_record(&entity)? {
                let options = if schema.is_immediate() {
                    SetOptions::immediate()
                } else {
                    SetOptions::default()
                };
                self.store.set(entity.soul(), bytes, options).await?;
                entity.lock_state().stored_heads = Some(heads);
                debug!("materialized {}", entity.soul());
            }
            if entity.lifecycle() == Lifecycle::Reserved {
                entity.set_lifecycle(Lifecycle::Materialized);
            }
            written.push(entity.clone());
            if entity.is_deleted() {
                return Ok(());
            }
            for child in entity.referenced_souls() {
                if let Some(child) = self.registry.get(&child) {
                    self.materialize_tree(child, visited, written).await?;
                }
            }
            Ok(())
        })
    }

    /// Seals the current document unless it is already stored.
    fn prepare_record(&self, entity: &Entity) -> EngineResult<Option<(Vec<u8>, Vec<Head>)>> {
        let state = entity.lock_state();
        let heads = state.doc.get_heads();
        if state.stored_heads.as_ref() == Some(&heads) {
            return Ok(None);
        }
        let origin = state
            .doc
            .get_meta(META_ORIGIN)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| entity.origin());
        let wrapped = state
            .doc
            .get_meta(META_ENTITY_KEY)
            .map(|raw| serde_json::from_value::<WrappedKey>(raw.clone()))
            .transpose()
            .map_err(|e| EngineError::Envelope(format!("entity key: {e}")))?;
        let entry = build_entry(
            &state.doc,
            &origin,
            state.keys.reference_keys(),
            wrapped,
            entity.is_deleted(),
        )?;
        let bytes = seal_record(
            &self.config,
            self.cipher.as_ref(),
            entity.soul(),
            &state.salt,
            &entry,
        )?;
        Ok(Some((bytes, heads)))
    }

    /// Materializes `entity` and its unstored references, then publishes
    /// each of them to the sync manager.
    pub async fn flush_entity(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        let mut visited = HashSet::new();
        let mut written = Vec::new();
        self.materialize_tree(entity.clone(), &mut visited, &mut written)
            .await?;
        for entity in &written {
            self.sync_entity(entity).await?;
        }
        Ok(())
    }

    async fn sync_entity(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        let Some(sync) = &self.sync else {
            return Ok(());
        };
        if entity.schema().is_ephemeral() {
            return Ok(());
        }
        let (doc, heads) = {
            let state = entity.lock_state();
            let heads = state.doc.get_heads();
            if state.synced_heads.as_ref() == Some(&heads) {
                return Ok(());
            }
            (state.doc.clone(), heads)
        };
        let soul = entity.soul();
        if sync.is_responsible(soul) {
            sync.set_resource(soul, &doc, self.on_synced()).await?;
        } else {
            debug!("discovering peers for {soul}");
            sync.discover(soul, &doc, self.on_synced(), DiscoverOptions::default())
                .await?;
        }
        entity.lock_state().synced_heads = Some(heads);
        Ok(())
    }

    /// The callback peers' documents arrive through: each one is merged on
    /// the session's runtime.
    pub fn on_synced(self: &Arc<Self>) -> OnSynced {
        let session = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        Arc::new(move |soul: Soul, doc: Document| {
            let Some(session) = session.upgrade() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = session.merge_remote(soul, doc).await {
                    warn!("{e}");
                }
            });
        })
    }

    // ── Deletion ─────────────────────────────────────────────────

    pub async fn delete_entity(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        if entity.is_read_only() {
            return Err(EngineError::ReadOnly(entity.soul().clone()));
        }
        let soul = entity.soul().clone();
        let in_transaction = {
            let _turn = entity.write_turn().await;
            if entity.is_deleted() {
                return Ok(());
            }
            let now = now_millis();
            let mut state = entity.lock_state();
            let in_transaction = self.involve(entity, &state);
            state.doc = state.doc.change(self.peer, |c| {
                c.put_meta(META_DELETED, json!(now));
                c.put_meta(META_MODIFIED, json!(now));
            });
            entity.set_deleted(true);
            self.emit(EntityEvent::entity_deleted(soul.clone()));
            in_transaction
        };
        info!("deleted {soul}");

        self.registry.remove(&soul);
        self.registry.mark_deleted(&soul);
        self.clear_referrers(&soul).await;

        if in_transaction || entity.lifecycle() == Lifecycle::Transient {
            return Ok(());
        }
        entity.set_lifecycle(Lifecycle::Materialized);
        if self.config.tombstone_purges_backend {
            self.publish_and_drop(entity).await
        } else {
            self.schedule(entity);
            Ok(())
        }
    }

    pub async fn purge_entity(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        self.delete_entity(entity).await?;
        self.publish_and_drop(entity).await
    }

    /// Publishes a tombstone to peers, then drops it from the sync manager
    /// and the backend.
    pub async fn publish_and_drop(self: &Arc<Self>, entity: &Entity) -> EngineResult<()> {
        self.scheduler.remove(entity.soul());
        if let Err(e) = self.sync_entity(entity).await {
            warn!("cannot publish tombstone of {}: {e}", entity.soul());
        }
        self.drop_entity(entity.soul()).await
    }

    /// Forgets `soul` everywhere: registry, pending set, sync manager and
    /// backend.
    pub async fn drop_entity(&self, soul: &Soul) -> EngineResult<()> {
        self.scheduler.remove(soul);
        self.registry.remove(soul);
        self.registry.mark_deleted(soul);
        if let Some(sync) = &self.sync {
            sync.drop_resource(soul).await?;
        }
        if self.store.del(soul).await? {
            debug!("dropped record of {soul}");
        }
        Ok(())
    }

    /// Clears every attribute still referencing the deleted `soul`.
    pub async fn clear_referrers(&self, soul: &Soul) {
        for (parent, attribute) in self.registry.take_referrers(soul) {
            if let Some(parent) = self.registry.get(&parent) {
                parent.clear_reference(&attribute, soul).await;
            }
        }
    }
}
