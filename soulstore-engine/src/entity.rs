//! The entity decorator.
//!
//! An [`Entity`] is the live, shared handle of one graph node. It keeps the
//! decoded attribute values next to the mirror document they are stored in,
//! applies every write to both under one lock, and hands itself to the
//! session's flush scheduler afterwards.
//!
//! Writes to one entity are serialized through an async FIFO queue: a `set`
//! issued while another is in flight runs after it, and a `get` waits for
//! queued writes before reading. Applying a write never awaits, so a caller
//! abandoning a `set` cannot leave the mirror half-updated.
//!
//! References to other entities are stored as `{"s": soul, "o": origin}` and
//! held in memory as [`Value::Entity`]. They are resolved lazily on read,
//! through the identity registry first and the backend store second.

use crate::error::{EngineError, EngineResult};
use crate::session::SessionInner;
use crate::storage_key::KeyStrategy;
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value as JsonValue, json};
use soulstore_crdt::{Document, Head, LIST_LEN_KEY};
use soulstore_model::codec;
use soulstore_model::{
    ARRAY_ORIGIN, AttributeSpec, AttributeView, AutoComplete, OBJECT_ORIGIN, Schema,
};
use soulstore_types::{AttributeChange, EntityEvent, Soul, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

pub(crate) const META_ORIGIN: &str = "o";
pub(crate) const META_CREATED: &str = "c";
pub(crate) const META_MODIFIED: &str = "u";
pub(crate) const META_DELETED: &str = "x";

/// Attributes provided by the engine rather than stored.
pub const EMERGENT_ATTRIBUTES: [&str; 5] = ["soul", "origin", "created", "modified", "deleted"];

/// Where an entity is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// In memory only; not registered, never flushed.
    Transient,
    /// Has an identity in the registry, but no content was written yet.
    Reserved,
    /// Has content that is (or is about to be) in the backend.
    Materialized,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Transient,
            1 => Self::Reserved,
            _ => Self::Materialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 0,
            Self::Reserved => 1,
            Self::Materialized => 2,
        }
    }
}

/// Attribute access on a decorated entity.
///
/// None of these return errors: rejected or failed operations are logged
/// and reported as `None`/`false`.
#[async_trait]
pub trait EntityAccess: Send + Sync {
    /// Reads an attribute. References come back as [`Value::Entity`].
    async fn get(&self, name: &str) -> Option<Value>;

    /// Writes an attribute. `Value::Null` deletes it. Returns whether the
    /// write was accepted.
    async fn set(&self, name: &str, value: Value) -> bool;

    /// Deletes an attribute. Returns whether there was something to delete.
    async fn delete(&self, name: &str) -> bool;

    /// Enumerable attributes currently holding a value.
    async fn keys(&self) -> Vec<String>;
}

pub(crate) struct EntityState {
    pub doc: Document,
    pub values: BTreeMap<String, Value>,
    pub keys: KeyStrategy,
    pub salt: String,
    /// Heads of the last document written to the backend.
    pub stored_heads: Option<Vec<Head>>,
    /// Heads of the last document handed to the sync manager.
    pub synced_heads: Option<Vec<Head>>,
}

pub(crate) struct EntityInner {
    soul: Soul,
    session: Weak<SessionInner>,
    schema: RwLock<Arc<Schema>>,
    lifecycle: AtomicU8,
    deleted: AtomicBool,
    writes: tokio::sync::Mutex<()>,
    state: Mutex<EntityState>,
}

/// The pre-transaction state of an entity.
#[derive(Clone)]
pub(crate) struct Snapshot {
    doc: Document,
    values: BTreeMap<String, Value>,
    keys: KeyStrategy,
    schema: Arc<Schema>,
    lifecycle: Lifecycle,
    deleted: bool,
}

impl Snapshot {
    pub fn capture(entity: &Entity, state: &EntityState) -> Self {
        Self {
            doc: state.doc.clone(),
            values: state.values.clone(),
            keys: state.keys.clone(),
            schema: entity.schema(),
            lifecycle: entity.lifecycle(),
            deleted: entity.is_deleted(),
        }
    }

    pub fn was_deleted(&self) -> bool {
        self.deleted
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}

pub(crate) enum SetOutcome {
    Applied,
    Rejected,
    /// The value is to be merged into the already referenced child.
    MergeInto(Soul, BTreeMap<String, Value>),
}

/// A decorated entity. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
    read_only: bool,
}

impl Entity {
    pub(crate) fn new(
        soul: Soul,
        session: Weak<SessionInner>,
        schema: Arc<Schema>,
        lifecycle: Lifecycle,
        deleted: bool,
        state: EntityState,
    ) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                soul,
                session,
                schema: RwLock::new(schema),
                lifecycle: AtomicU8::new(lifecycle.as_u8()),
                deleted: AtomicBool::new(deleted),
                writes: tokio::sync::Mutex::new(()),
                state: Mutex::new(state),
            }),
            read_only: false,
        }
    }

    pub fn soul(&self) -> &Soul {
        &self.inner.soul
    }

    pub fn origin(&self) -> String {
        self.schema().origin().to_string()
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(
            &self
                .inner
                .schema
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::SeqCst))
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    /// True for handles opened in tombstone mode.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True if both handles decorate the same instance.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A copy of the current mirror document.
    pub fn document(&self) -> Document {
        self.lock_state().doc.clone()
    }

    /// Values concurrently written to an attribute by different peers, keyed
    /// by peer id, until the attribute is written again locally.
    pub fn get_conflicts(&self, name: &str) -> Option<BTreeMap<String, Value>> {
        let state = self.lock_state();
        let key = state.keys.existing_key_for(name)?;
        let conflicts = state.doc.get_conflicts(&key)?;
        Some(
            conflicts
                .iter()
                .filter_map(|(peer, wire)| codec::deserialize(wire).ok().map(|v| (peer.clone(), v)))
                .collect(),
        )
    }

    /// A snapshot of the current attribute values.
    pub fn view(&self) -> AttributeView {
        let state = self.lock_state();
        self.view_of(&state)
    }

    /// Reads a reference attribute and resolves it to the live entity.
    pub async fn get_entity(&self, name: &str) -> Option<Entity> {
        let soul = self.get(name).await?.as_soul()?.clone();
        self.session()?.resolve(&soul).await
    }

    /// Items of an array-valued entity, in index order.
    pub async fn list_values(&self) -> Vec<Value> {
        drop(self.inner.writes.lock().await);
        let state = self.lock_state();
        let mut items: Vec<(usize, Value)> = state
            .values
            .iter()
            .filter_map(|(name, value)| name.parse::<usize>().ok().map(|i| (i, value.clone())))
            .collect();
        items.sort_by_key(|(i, _)| *i);
        items.into_iter().map(|(_, v)| v).collect()
    }

    /// This entity as a reference value. A transient entity is reserved so
    /// the reference can be resolved.
    pub fn to_value(&self) -> Value {
        if self.lifecycle() == Lifecycle::Transient {
            if let Err(e) = self.reserve() {
                warn!("cannot reserve {} for referencing: {e}", self.soul());
            }
        }
        Value::Entity(self.soul().clone())
    }

    /// Gives a transient entity its identity in the registry.
    pub fn reserve(&self) -> EngineResult<()> {
        if self.lifecycle() != Lifecycle::Transient {
            return Err(EngineError::Reservation(format!(
                "{} is already reserved",
                self.soul()
            )));
        }
        let session = self.session().ok_or(EngineError::Closed)?;
        session.reserve(self)
    }

    /// Writes the mirror document to the backend, then every referenced
    /// entity not yet stored. Deferred inside a transaction.
    pub async fn materialize(&self) -> EngineResult<()> {
        let session = self.session().ok_or(EngineError::Closed)?;
        session.materialize(self).await
    }

    /// Tombstones the entity.
    pub async fn delete_entity(&self) -> EngineResult<()> {
        let session = self.session().ok_or(EngineError::Closed)?;
        session.delete_entity(self).await
    }

    /// Tombstones the entity, publishes the tombstone and drops it from the
    /// backend and the sync manager.
    pub async fn purge(&self) -> EngineResult<()> {
        let session = self.session().ok_or(EngineError::Closed)?;
        session.purge_entity(self).await
    }

    // ── Crate internals ──────────────────────────────────────────

    pub(crate) fn session(&self) -> Option<Arc<SessionInner>> {
        self.inner.session.upgrade()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntityState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn write_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.writes.lock().await
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.inner.lifecycle.store(lifecycle.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn set_deleted(&self, deleted: bool) {
        self.inner.deleted.store(deleted, Ordering::SeqCst);
    }

    pub(crate) fn set_schema(&self, schema: Arc<Schema>) {
        *self
            .inner
            .schema
            .write()
            .unwrap_or_else(PoisonError::into_inner) = schema;
    }

    pub(crate) fn read_only_handle(&self) -> Entity {
        Entity {
            inner: Arc::clone(&self.inner),
            read_only: true,
        }
    }

    pub(crate) fn view_of(&self, state: &EntityState) -> AttributeView {
        AttributeView {
            soul: Some(self.soul().clone()),
            origin: self.origin(),
            attributes: state.values.clone(),
        }
    }

    /// Souls referenced by attribute values.
    pub(crate) fn referenced_souls(&self) -> Vec<Soul> {
        self.lock_state()
            .values
            .values()
            .filter_map(Value::as_soul)
            .cloned()
            .collect()
    }

    /// Replaces the state with a transaction snapshot. Returns the attribute
    /// changes this reverted.
    pub(crate) fn restore_snapshot(&self, snapshot: Snapshot) -> Vec<AttributeChange> {
        let mut state = self.lock_state();
        let changes = diff_values(&state.values, &snapshot.values);
        state.doc = snapshot.doc;
        state.values = snapshot.values;
        state.keys = snapshot.keys;
        drop(state);
        self.set_schema(snapshot.schema);
        self.set_lifecycle(snapshot.lifecycle);
        self.set_deleted(snapshot.deleted);
        changes
    }

    /// Applies a write. Never awaits.
    pub(crate) fn apply_set(
        &self,
        session: &Arc<SessionInner>,
        name: &str,
        value: Value,
    ) -> SetOutcome {
        if self.read_only {
            warn!("write to {name:?} on tombstone view of {} ignored", self.soul());
            return SetOutcome::Rejected;
        }
        if self.is_deleted() {
            debug!("write to {name:?} on deleted {} ignored", self.soul());
            return SetOutcome::Rejected;
        }
        if value.is_null() {
            return if self.apply_delete(session, name, None) {
                SetOutcome::Applied
            } else {
                SetOutcome::Rejected
            };
        }
        let schema = self.schema();
        let Some(spec) = writable_spec(&schema, name) else {
            return SetOutcome::Rejected;
        };
        if !spec.admits(&value) {
            warn!(
                "{}.{name}: {} value rejected for {:?} attribute",
                schema.origin(),
                value.type_name(),
                spec.kind
            );
            return SetOutcome::Rejected;
        }

        let mut state = self.lock_state();
        let value = if spec.merge {
            match (state.values.get(name), value) {
                (Some(Value::Map(existing)), Value::Map(incoming)) => {
                    let mut merged = existing.clone();
                    deep_merge(&mut merged, incoming);
                    Value::Map(merged)
                }
                (Some(Value::Entity(child)), Value::Map(incoming)) if child != self.soul() => {
                    return SetOutcome::MergeInto(child.clone(), incoming);
                }
                (_, value) => value,
            }
        } else {
            value
        };

        let in_transaction = session.involve(self, &state);
        let old = state.values.get(name).cloned().unwrap_or(Value::Null);

        if matches!(value, Value::Handle(_)) || !spec.is_stored() {
            state.values.insert(name.to_string(), value.clone());
            session.emit(EntityEvent::changed(self.soul().clone(), name, old, value));
            return SetOutcome::Applied;
        }

        let (value, wire) = match value {
            value @ (Value::Map(_) | Value::List(_)) if !spec.embedded => {
                let origin = spec.target.clone().unwrap_or_else(|| {
                    if matches!(value, Value::List(_)) {
                        ARRAY_ORIGIN.to_string()
                    } else {
                        OBJECT_ORIGIN.to_string()
                    }
                });
                let transient = self.lifecycle() == Lifecycle::Transient;
                let child = match session.build_child(&origin, value, transient) {
                    Ok(child) => child,
                    Err(e) => {
                        warn!("{}.{name}: cannot create child entity: {e}", schema.origin());
                        return SetOutcome::Rejected;
                    }
                };
                let wire = codec::reference(child.soul(), Some(&origin));
                (Value::Entity(child.soul().clone()), wire)
            }
            Value::Entity(target) => {
                let origin = session.registry.get(&target).map(|t| {
                    if t.lifecycle() == Lifecycle::Transient {
                        if let Err(e) = session.reserve(&t) {
                            warn!("cannot reserve referenced {target}: {e}");
                        }
                    }
                    t.origin()
                });
                let wire = codec::reference(&target, origin.as_deref());
                (Value::Entity(target), wire)
            }
            value => match codec::serialize(&value) {
                Ok(wire) => (value, wire),
                Err(e) => {
                    warn!("{}.{name}: {e}", schema.origin());
                    return SetOutcome::Rejected;
                }
            },
        };

        let storage_key = match state.keys.storage_key_for(name, spec.is_referencing()) {
            Ok(key) => key,
            Err(e) => {
                warn!("{}.{name}: no storage key: {e}", schema.origin());
                return SetOutcome::Rejected;
            }
        };
        let key_meta = match state.keys.take_pending_meta(session.cipher.as_ref()) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("{}: cannot record key material: {e}", self.soul());
                return SetOutcome::Rejected;
            }
        };

        if let Value::Entity(previous) = &old {
            if value.as_soul() != Some(previous) {
                session.registry.remove_referrer(previous, self.soul(), name);
            }
        }
        if let Value::Entity(target) = &value {
            session.registry.add_referrer(target, self.soul(), name);
        }
        state.values.insert(name.to_string(), value.clone());
        let len = list_len(&schema, &state.values);
        let now = now_millis();
        let first_write = state.doc.get_meta(META_CREATED).is_none();
        state.doc = state.doc.change(session.peer, |c| {
            c.put(storage_key, wire);
            c.put_meta(META_MODIFIED, json!(now));
            if first_write {
                c.put_meta(META_CREATED, json!(now));
            }
            if let Some((key, raw)) = key_meta {
                c.put_meta(key, raw);
            }
            if let Some(len) = len {
                c.put_meta(LIST_LEN_KEY, json!(len));
            }
        });
        session.emit(EntityEvent::changed(self.soul().clone(), name, old, value));
        drop(state);

        self.after_write(session, in_transaction);
        SetOutcome::Applied
    }

    /// Applies an attribute delete. With `only_if`, deletes only while the
    /// attribute still references that soul. Never awaits.
    pub(crate) fn apply_delete(
        &self,
        session: &Arc<SessionInner>,
        name: &str,
        only_if: Option<&Soul>,
    ) -> bool {
        if self.read_only || self.is_deleted() {
            return false;
        }
        let schema = self.schema();
        let Some(spec) = writable_spec(&schema, name) else {
            return false;
        };

        let mut state = self.lock_state();
        if let Some(expected) = only_if {
            if state.values.get(name).and_then(Value::as_soul) != Some(expected) {
                return false;
            }
        }
        let storage_key = spec
            .is_stored()
            .then(|| state.keys.existing_key_for(name))
            .flatten();
        let in_doc = storage_key
            .as_deref()
            .and_then(|key| state.doc.get(key))
            .is_some_and(|wire| !wire.is_null());
        if !state.values.contains_key(name) && !in_doc {
            return false;
        }

        let in_transaction = session.involve(self, &state);
        let old = state.values.remove(name).unwrap_or(Value::Null);
        if let Value::Entity(previous) = &old {
            session.registry.remove_referrer(previous, self.soul(), name);
        }
        let stored = match storage_key {
            Some(key) if in_doc => {
                let len = list_len(&schema, &state.values);
                let now = now_millis();
                state.doc = state.doc.change(session.peer, |c| {
                    c.delete(key);
                    c.put_meta(META_MODIFIED, json!(now));
                    if let Some(len) = len {
                        c.put_meta(LIST_LEN_KEY, json!(len));
                    }
                });
                true
            }
            _ => false,
        };
        session.emit(EntityEvent::deleted(self.soul().clone(), name, old));
        drop(state);

        if stored {
            self.after_write(session, in_transaction);
        }
        true
    }

    fn after_write(&self, session: &Arc<SessionInner>, in_transaction: bool) {
        if in_transaction {
            return;
        }
        match self.lifecycle() {
            Lifecycle::Transient => {}
            Lifecycle::Reserved | Lifecycle::Materialized => {
                self.set_lifecycle(Lifecycle::Materialized);
                if !self.schema().is_ephemeral() {
                    session.schedule(self);
                }
            }
        }
    }

    /// Deletes `name` if it still references `target`.
    pub(crate) async fn clear_reference(&self, name: &str, target: &Soul) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let _turn = self.write_turn().await;
        let cleared = self.apply_delete(&session, name, Some(target));
        if cleared {
            debug!("{}.{name}: cleared reference to deleted {target}", self.soul());
        }
        cleared
    }

    async fn resolve_reference(&self, name: &str, target: Soul) -> Option<Entity> {
        let session = self.session()?;
        match session.resolve(&target).await {
            Some(entity) if entity.is_deleted() => {
                if !self.read_only {
                    self.clear_reference(name, &target).await;
                }
                None
            }
            Some(entity) => {
                session.registry.add_referrer(&target, self.soul(), name);
                Some(entity)
            }
            None if session.registry.is_deleted(&target) => {
                if !self.read_only {
                    self.clear_reference(name, &target).await;
                }
                None
            }
            None => None,
        }
    }

    async fn complete(&self, schema: &Schema, name: &str) -> Option<Value> {
        let view = self.view();
        match schema.autocomplete_for(&view, name) {
            Some(AutoComplete::Value(value)) => {
                if self.read_only || !self.set(name, value.clone()).await {
                    return Some(value);
                }
            }
            Some(AutoComplete::Instance { origin }) => {
                let session = self.session()?;
                let list = session.schemas.get(&origin).is_some_and(|s| s.is_list());
                let empty = if list {
                    Value::List(Vec::new())
                } else {
                    Value::Map(BTreeMap::new())
                };
                if self.read_only || !self.set(name, empty).await {
                    return None;
                }
            }
            None => return schema.get_default_value(name),
        }
        self.lock_state().values.get(name).cloned()
    }

    fn emergent_value(&self, name: &str) -> Option<Value> {
        let state = self.lock_state();
        let date = |key: &str| {
            state
                .doc
                .get_meta(key)
                .and_then(JsonValue::as_i64)
                .and_then(DateTime::from_timestamp_millis)
                .map(Value::Date)
        };
        match name {
            "soul" => Some(Value::Text(self.soul().to_string())),
            "origin" => Some(Value::Text(self.origin())),
            "created" => date(META_CREATED),
            "modified" => date(META_MODIFIED),
            "deleted" => date(META_DELETED),
            _ => None,
        }
    }
}

#[async_trait]
impl EntityAccess for Entity {
    async fn get(&self, name: &str) -> Option<Value> {
        drop(self.inner.writes.lock().await);
        if self.is_deleted() && !self.read_only {
            return None;
        }
        let schema = self.schema();
        if is_emergent(&schema, name) {
            return self.emergent_value(name);
        }
        let Some(spec) = schema.get_attribute(name) else {
            debug!("{}: read of unknown attribute {name:?}", schema.origin());
            return None;
        };
        if spec.derived {
            let view = self.view();
            return schema.derive(name, &view);
        }
        let current = self.lock_state().values.get(name).cloned();
        match current {
            Some(Value::Entity(target)) => self
                .resolve_reference(name, target)
                .await
                .map(|entity| Value::Entity(entity.soul().clone())),
            Some(value) => Some(value),
            None => self.complete(&schema, name).await,
        }
    }

    async fn set(&self, name: &str, value: Value) -> bool {
        let Some(session) = self.session() else {
            warn!("write to {name:?} on {} after session shutdown", self.soul());
            return false;
        };
        let outcome = {
            let _turn = self.write_turn().await;
            self.apply_set(&session, name, value)
        };
        match outcome {
            SetOutcome::Applied => true,
            SetOutcome::Rejected => false,
            SetOutcome::MergeInto(child, incoming) => {
                let Some(child) = session.resolve(&child).await else {
                    warn!("{}.{name}: referenced {child} is unavailable for merge", self.soul());
                    return false;
                };
                let mut all = true;
                for (key, value) in incoming {
                    all &= child.set(&key, value).await;
                }
                all
            }
        }
    }

    async fn delete(&self, name: &str) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        let _turn = self.write_turn().await;
        self.apply_delete(&session, name, None)
    }

    async fn keys(&self) -> Vec<String> {
        drop(self.inner.writes.lock().await);
        if self.is_deleted() && !self.read_only {
            return Vec::new();
        }
        let schema = self.schema();
        let state = self.lock_state();
        let mut keys: Vec<String> = state
            .values
            .iter()
            .filter(|(name, value)| {
                !value.is_null()
                    && schema
                        .get_attribute(name)
                        .is_some_and(|spec| spec.enumerable)
            })
            .map(|(name, _)| name.clone())
            .collect();
        if schema.is_list() {
            keys.sort_by_key(|k| k.parse::<usize>().unwrap_or(usize::MAX));
        }
        keys
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("soul", self.soul())
            .field("origin", &self.origin())
            .field("lifecycle", &self.lifecycle())
            .field("deleted", &self.is_deleted())
            .field("read_only", &self.read_only)
            .finish()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn is_emergent(schema: &Schema, name: &str) -> bool {
    match schema.get_attribute(name) {
        Some(Cow::Borrowed(spec)) => spec.emergent,
        _ => EMERGENT_ATTRIBUTES.contains(&name),
    }
}

/// The spec of an attribute that accepts writes.
fn writable_spec(schema: &Schema, name: &str) -> Option<AttributeSpec> {
    if is_emergent(schema, name) {
        debug!("{}: {name:?} is provided by the engine", schema.origin());
        return None;
    }
    let Some(spec) = schema.get_attribute(name) else {
        warn!("{}: unknown attribute {name:?}", schema.origin());
        return None;
    };
    if spec.derived {
        debug!("{}: {name:?} is derived", schema.origin());
        return None;
    }
    Some(spec.into_owned())
}

fn list_len(schema: &Schema, values: &BTreeMap<String, Value>) -> Option<usize> {
    schema.is_list().then(|| {
        values
            .keys()
            .filter_map(|k| k.parse::<usize>().ok())
            .max()
            .map_or(0, |max| max + 1)
    })
}

fn deep_merge(base: &mut BTreeMap<String, Value>, incoming: BTreeMap<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Null => {
                base.remove(&key);
            }
            Value::Map(inner) => {
                if let Some(Value::Map(existing)) = base.get_mut(&key) {
                    deep_merge(existing, inner);
                } else {
                    base.insert(key, Value::Map(inner));
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decodes the live entries of a document into attribute values.
pub(crate) fn decode_values(doc: &Document, keys: &KeyStrategy) -> BTreeMap<String, Value> {
    doc.live_entries()
        .filter_map(|(key, wire)| {
            let name = keys.attribute_for(key)?;
            match codec::deserialize(wire) {
                Ok(value) => Some((name, value)),
                Err(e) => {
                    warn!("cannot decode attribute {name:?}: {e}");
                    None
                }
            }
        })
        .collect()
}

/// Attribute-level differences between two value maps.
pub(crate) fn diff_values(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    for (name, new) in after {
        let old = before.get(name).cloned().unwrap_or(Value::Null);
        if &old != new {
            changes.push(AttributeChange::Set {
                attribute: name.clone(),
                old,
                new: new.clone(),
            });
        }
    }
    for (name, old) in before {
        if !after.contains_key(name) {
            changes.push(AttributeChange::Deleted {
                attribute: name.clone(),
                old: old.clone(),
            });
        }
    }
    changes
}
