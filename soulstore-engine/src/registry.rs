//! Identity registry: at most one live [`Entity`] per soul.
//!
//! Every soul maps to a `OnceCell`. Concurrent restores of the same soul all
//! wait on the same cell, so the first load wins and every caller observes
//! the same instance. A failed load leaves the cell empty and it is removed,
//! so a later restore can try again.
//!
//! The registry also keeps the reverse reference index (child soul to the
//! parent attributes pointing at it) that lets a deleted child clear its
//! referrers, and the set of souls deleted during this session, which are
//! never resurrected by a late peer document.

use crate::entity::Entity;
use crate::error::EngineResult;
use soulstore_types::Soul;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;

type Cell = Arc<OnceCell<Entity>>;

/// A parent attribute holding a reference.
pub type Referrer = (Soul, String);

#[derive(Default)]
pub struct IdentityRegistry {
    cells: RwLock<HashMap<Soul, Cell>>,
    referrers: RwLock<HashMap<Soul, BTreeSet<Referrer>>>,
    tombstones: RwLock<HashSet<Soul>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registered instance for `soul`, if any.
    pub fn get(&self, soul: &Soul) -> Option<Entity> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(soul)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, soul: &Soul) -> bool {
        self.get(soul).is_some()
    }

    /// Registers `entity` under its soul and returns the instance every
    /// caller should use: the one already registered, if any.
    pub fn register(&self, entity: Entity) -> Entity {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        let cell = cells.entry(entity.soul().clone()).or_default();
        match cell.get() {
            Some(existing) => existing.clone(),
            None => match cell.set(entity.clone()) {
                Ok(()) => entity,
                Err(_) => cell.get().cloned().unwrap_or(entity),
            },
        }
    }

    /// Returns the registered instance, or runs `init` exactly once across
    /// concurrent callers to produce it.
    pub async fn get_or_try_init<F, Fut>(&self, soul: &Soul, init: F) -> EngineResult<Entity>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Entity>>,
    {
        let cell = {
            let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(soul.clone()).or_default())
        };
        let result = cell.get_or_try_init(init).await.cloned();
        if result.is_err() {
            self.discard_empty(soul);
        }
        result
    }

    fn discard_empty(&self, soul: &Soul) {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        if cells.get(soul).is_some_and(|cell| !cell.initialized()) {
            cells.remove(soul);
        }
    }

    /// Forgets the instance for `soul`. Returns it if one was registered.
    pub fn remove(&self, soul: &Soul) -> Option<Entity> {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(soul)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every instance, reference edge and tombstone.
    pub fn clear(&self) {
        self.cells.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.referrers.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.tombstones.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    // ── Reference index ──────────────────────────────────────────

    pub fn add_referrer(&self, child: &Soul, parent: &Soul, attribute: &str) {
        self.referrers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(child.clone())
            .or_default()
            .insert((parent.clone(), attribute.to_string()));
    }

    pub fn remove_referrer(&self, child: &Soul, parent: &Soul, attribute: &str) {
        let mut referrers = self.referrers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = referrers.get_mut(child) {
            set.remove(&(parent.clone(), attribute.to_string()));
            if set.is_empty() {
                referrers.remove(child);
            }
        }
    }

    /// Removes and returns every attribute referencing `child`.
    pub fn take_referrers(&self, child: &Soul) -> BTreeSet<Referrer> {
        self.referrers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(child)
            .unwrap_or_default()
    }

    // ── Tombstones ───────────────────────────────────────────────

    pub fn mark_deleted(&self, soul: &Soul) {
        self.tombstones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(soul.clone());
    }

    pub fn unmark_deleted(&self, soul: &Soul) {
        self.tombstones
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(soul);
    }

    pub fn is_deleted(&self, soul: &Soul) -> bool {
        self.tombstones
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(soul)
    }
}
