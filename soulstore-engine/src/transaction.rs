//! Transactions.
//!
//! While a transaction is current, every entity a write touches is recorded
//! as involved (with a snapshot of its state at first touch) instead of
//! being scheduled. `commit` performs the deferred materialize and sync;
//! `rollback` restores the snapshots.
//!
//! ```text
//! Active -> PartiallyCommitted -> Committed
//! Active -> PartiallyCommitted -> Failed -> Aborted
//! Active | PartiallyCommitted -> Aborted
//! ```
//!
//! A transaction begun while another is current is its child. Committing a
//! child hands its involved entities to the parent, so they are written when
//! the outermost transaction commits. Rolling a child back only reverts what
//! the child touched.

use crate::entity::{Entity, Lifecycle, Snapshot};
use crate::error::{EngineError, EngineResult};
use crate::session::SessionInner;
use soulstore_types::{AttributeChange, EntityEvent, Soul, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Being validated, or prepared and waiting for commit.
    PartiallyCommitted,
    Committed,
    /// Prepare rejected an involved entity, or a commit write failed.
    Failed,
    Aborted,
}

type Involved = BTreeMap<Soul, (Entity, Snapshot)>;

struct TransactionInner {
    id: u64,
    parent: Option<Transaction>,
    session: Weak<SessionInner>,
    state: Mutex<TransactionState>,
    involved: Mutex<Involved>,
}

/// A unit of deferred writes. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(id: u64, parent: Option<Transaction>, session: Weak<SessionInner>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                parent,
                session,
                state: Mutex::new(TransactionState::Active),
                involved: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        *self.lock_state()
    }

    pub fn parent(&self) -> Option<&Transaction> {
        self.inner.parent.as_ref()
    }

    /// Souls of the involved entities.
    pub fn involved(&self) -> Vec<Soul> {
        self.lock_involved().keys().cloned().collect()
    }

    pub fn involves(&self, soul: &Soul) -> bool {
        self.lock_involved().contains_key(soul)
    }

    fn lock_state(&self) -> MutexGuard<'_, TransactionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_involved(&self) -> MutexGuard<'_, Involved> {
        self.inner.involved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransactionState) {
        *self.lock_state() = state;
    }

    fn session(&self) -> EngineResult<Arc<SessionInner>> {
        self.inner.session.upgrade().ok_or(EngineError::Closed)
    }

    /// Records `entity`. The snapshot is only captured on first touch.
    pub(crate) fn involve(&self, entity: &Entity, capture: impl FnOnce() -> Snapshot) {
        self.lock_involved()
            .entry(entity.soul().clone())
            .or_insert_with(|| (entity.clone(), capture()));
    }

    /// Validates every involved entity: mandatory attributes must hold a
    /// value, and the schema hooks must accept it.
    pub fn prepare(&self) -> EngineResult<()> {
        let current = self.state();
        if current != TransactionState::Active {
            return Err(EngineError::Transaction(format!(
                "cannot prepare transaction {} in state {current:?}",
                self.id()
            )));
        }
        self.set_state(TransactionState::PartiallyCommitted);
        let entities: Vec<Entity> = self
            .lock_involved()
            .values()
            .map(|(entity, _)| entity.clone())
            .collect();
        for entity in entities.iter().filter(|e| !e.is_deleted()) {
            if let Err(reason) = validate(entity) {
                warn!("transaction {} failed: {reason}", self.id());
                self.set_state(TransactionState::Failed);
                return Err(EngineError::Transaction(reason));
            }
        }
        Ok(())
    }

    /// Prepares if needed, then writes every involved entity (or hands them
    /// to the parent transaction).
    pub async fn commit(&self) -> EngineResult<()> {
        if self.state() == TransactionState::Active {
            self.prepare()?;
        }
        let current = self.state();
        if current != TransactionState::PartiallyCommitted {
            return Err(EngineError::Transaction(format!(
                "cannot commit transaction {} in state {current:?}",
                self.id()
            )));
        }
        let session = self.session()?;
        session.remove_transaction(self.id());
        let involved = std::mem::take(&mut *self.lock_involved());

        if let Some(parent) = self.parent() {
            debug!(
                "transaction {} hands {} entities to {}",
                self.id(),
                involved.len(),
                parent.id()
            );
            let mut target = parent.lock_involved();
            for (soul, slot) in involved {
                target.entry(soul).or_insert(slot);
            }
            drop(target);
            self.set_state(TransactionState::Committed);
            return Ok(());
        }

        let count = involved.len();
        let mut first_error = None;
        for (entity, _) in involved.into_values() {
            if entity.lifecycle() == Lifecycle::Transient || entity.schema().is_ephemeral() {
                continue;
            }
            let result = if entity.is_deleted() && session.config.tombstone_purges_backend {
                session.publish_and_drop(&entity).await
            } else {
                session.flush_entity(&entity).await
            };
            match result {
                Ok(()) if session.scheduler.is_pending(entity.soul()) => session.schedule(&entity),
                Ok(()) => {}
                Err(e) => {
                    warn!("commit flush of {} failed, retrying later: {e}", entity.soul());
                    session.scheduler.requeue_failed(entity, 1);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.set_state(TransactionState::Failed);
            return Err(e);
        }
        self.set_state(TransactionState::Committed);
        info!("transaction {} committed {count} entities", self.id());
        Ok(())
    }

    /// Reverts every involved entity to its state before the transaction.
    pub fn rollback(&self) -> EngineResult<()> {
        let current = self.state();
        if matches!(
            current,
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Err(EngineError::Transaction(format!(
                "cannot roll back transaction {} in state {current:?}",
                self.id()
            )));
        }
        self.set_state(TransactionState::Aborted);
        let session = self.session()?;
        session.remove_transaction(self.id());
        let involved = std::mem::take(&mut *self.lock_involved());

        let count = involved.len();
        for (soul, (entity, snapshot)) in involved {
            let revived = entity.is_deleted() && !snapshot.was_deleted();
            let transient = snapshot.lifecycle() == Lifecycle::Transient;
            let changes = entity.restore_snapshot(snapshot);
            if revived {
                session.registry.unmark_deleted(&soul);
                if !transient {
                    session.registry.register(entity.clone());
                }
            }
            for (name, value) in &entity.lock_state().values {
                if let Value::Entity(target) = value {
                    session.registry.add_referrer(target, &soul, name);
                }
            }
            for change in changes {
                if let AttributeChange::Set {
                    old: Value::Entity(dropped),
                    ..
                }
                | AttributeChange::Deleted {
                    old: Value::Entity(dropped),
                    ..
                } = &change
                {
                    session
                        .registry
                        .remove_referrer(dropped, &soul, change.attribute());
                }
                session.emit(change_event(&soul, change));
            }
            if session.scheduler.is_pending(&soul) {
                // Writes made before the transaction still await a flush.
                session.schedule(&entity);
            }
        }
        info!("transaction {} rolled back {count} entities", self.id());
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("parent", &self.parent().map(Transaction::id))
            .finish()
    }
}

fn validate(entity: &Entity) -> Result<(), String> {
    let schema = entity.schema();
    let view = entity.view();
    for spec in schema.attributes() {
        if !spec.mandatory || spec.derived || spec.emergent {
            continue;
        }
        if view.get(&spec.name).is_none_or(Value::is_null) {
            return Err(format!(
                "{} {}: mandatory attribute {:?} has no value",
                schema.origin(),
                entity.soul(),
                spec.name
            ));
        }
    }
    match schema.hooks() {
        Some(hooks) => hooks
            .validate(&view)
            .map_err(|reason| format!("{} {}: {reason}", schema.origin(), entity.soul())),
        None => Ok(()),
    }
}

fn change_event(soul: &Soul, change: AttributeChange) -> EntityEvent {
    match change {
        AttributeChange::Set {
            attribute,
            old,
            new,
        } => EntityEvent::changed(soul.clone(), attribute, old, new),
        AttributeChange::Deleted { attribute, old } => {
            EntityEvent::deleted(soul.clone(), attribute, old)
        }
    }
}
