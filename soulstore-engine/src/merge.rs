//! Reconciliation of peer documents.
//!
//! A peer document is merged into the local mirror with the CRDT merge, and
//! the attribute values are re-derived from the result. Primitive conflicts
//! are left to the document's last-writer rule. On top of that:
//!
//! - A reference attribute whose two sides point at different entities is a
//!   real conflict. A typed entity beats an untyped container, otherwise the
//!   document's winner stays. The loser's contents are absorbed into the
//!   winner and the loser is dropped.
//! - Deletion wins over any concurrent edit.
//! - A known typed origin beats the untyped origin.
//!
//! Merges can cascade through the entity graph, which may be cyclic, so every
//! merge carries a set of visited souls.

use crate::entity::{
    Entity, EntityAccess, EntityState, META_DELETED, META_ORIGIN, decode_values, diff_values,
};
use crate::error::{EngineError, EngineResult};
use crate::session::{BoxFuture, SessionInner};
use crate::storage_key::KeyStrategy;
use serde_json::{Value as JsonValue, json};
use soulstore_crdt::Document;
use soulstore_crypto::Salt;
use soulstore_types::{AttributeChange, EntityEvent, HybridTimestamp, Soul, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Two entities competing for one attribute.
struct ReferenceConflict {
    attribute: String,
    local: Soul,
    remote: Soul,
    /// The document's last-writer choice.
    merged: Soul,
}

struct MergePlan {
    changes: Vec<AttributeChange>,
    conflicts: Vec<ReferenceConflict>,
    newly_deleted: bool,
}

enum Side {
    Live(Entity),
    Deleted,
    Unavailable,
}

impl SessionInner {
    pub async fn merge_remote(self: &Arc<Self>, soul: Soul, remote: Document) -> EngineResult<()> {
        let mut visited = HashSet::new();
        self.merge_into(soul, remote, &mut visited).await
    }

    fn merge_into<'a>(
        self: &'a Arc<Self>,
        soul: Soul,
        remote: Document,
        visited: &'a mut HashSet<Soul>,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if !visited.insert(soul.clone()) || remote.is_empty() {
                return Ok(());
            }
            if self.registry.is_deleted(&soul) {
                debug!("{soul} was deleted here, dropping peer state");
                return match self.scheduler.get(&soul) {
                    Some(pending) => self.publish_and_drop(&pending).await,
                    None => self.drop_entity(&soul).await,
                };
            }
            let entity = match self.registry.get(&soul) {
                Some(entity) => entity,
                None => match self.store.get(&soul).await? {
                    Some(bytes) => {
                        let entity = self.entity_from_record(&soul, &bytes)?;
                        if entity.is_deleted() {
                            debug!("{soul} is stored as a tombstone, dropping peer state");
                            return self.drop_entity(&soul).await;
                        }
                        self.registry.register(entity)
                    }
                    None => return self.adopt_remote(soul, remote, visited).await,
                },
            };
            self.merge_document(entity, remote, visited).await
        })
    }

    /// Takes in a peer's entity this replica has no state for.
    async fn adopt_remote(
        self: &Arc<Self>,
        soul: Soul,
        remote: Document,
        visited: &mut HashSet<Soul>,
    ) -> EngineResult<()> {
        let entity = self.build_restored(&soul, remote.clone(), Salt::random().to_base64(), false)?;
        if entity.is_deleted() {
            return self.drop_entity(&soul).await;
        }
        let registered = self.registry.register(entity.clone());
        if !registered.ptr_eq(&entity) {
            return self.merge_document(registered, remote, visited).await;
        }
        if !entity.schema().is_ephemeral() {
            self.scheduler.enqueue(&entity);
        }
        let changes = {
            let state = entity.lock_state();
            diff_values(&BTreeMap::new(), &state.values)
        };
        debug!("adopted {soul} from a peer");
        if !changes.is_empty() {
            self.emit(EntityEvent::merged(soul, changes));
        }
        Ok(())
    }

    async fn merge_document(
        self: &Arc<Self>,
        entity: Entity,
        remote: Document,
        visited: &mut HashSet<Soul>,
    ) -> EngineResult<()> {
        let soul = entity.soul().clone();
        let plan = {
            let _turn = entity.write_turn().await;
            self.plan_merge(&entity, &remote)
        };
        let plan = match plan {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                debug!("{soul}: peer state already known");
                return Ok(());
            }
            Err(e) => {
                warn!("{e}");
                return Err(e);
            }
        };

        for conflict in plan.conflicts {
            self.resolve_conflict(&entity, conflict, visited).await?;
        }

        if plan.newly_deleted {
            info!("{soul} was deleted by a peer");
            self.registry.remove(&soul);
            self.registry.mark_deleted(&soul);
            self.clear_referrers(&soul).await;
            self.emit(EntityEvent::entity_deleted(soul.clone()));
            return self.drop_entity(&soul).await;
        }
        if !entity.schema().is_ephemeral() {
            self.scheduler.enqueue(&entity);
        }
        if !plan.changes.is_empty() {
            debug!("{soul}: merged {} attribute changes", plan.changes.len());
            self.emit(EntityEvent::merged(soul, plan.changes));
        }
        Ok(())
    }

    /// Merges `remote` into the entity's state. Leaves the state untouched
    /// on error and returns `None` when the peer brought nothing new.
    fn plan_merge(&self, entity: &Entity, remote: &Document) -> EngineResult<Option<MergePlan>> {
        let soul = entity.soul();
        let failure = |reason: String| EngineError::MergeFailure {
            soul: soul.clone(),
            reason,
        };
        let mut state = entity.lock_state();
        let mut merged = state.doc.merge(remote);
        if merged.equals(&state.doc) {
            return Ok(None);
        }

        let current = entity.schema();
        let schema = match remote.get_meta(META_ORIGIN).and_then(JsonValue::as_str) {
            Some(origin) if current.is_untyped() => self
                .schemas
                .get(origin)
                .filter(|s| !s.is_untyped())
                .unwrap_or_else(|| Arc::clone(&current)),
            _ => Arc::clone(&current),
        };
        let merged_origin = merged.get_meta(META_ORIGIN).and_then(JsonValue::as_str);
        if !schema.is_untyped() && merged_origin != Some(schema.origin()) {
            let origin = schema.origin().to_string();
            merged = merged.change(self.peer, |c| c.put_meta(META_ORIGIN, json!(origin)));
        }

        let cipher = self.cipher.as_ref();
        let merged_keys = KeyStrategy::from_meta(schema.naming(), &merged, cipher)
            .map_err(|e| failure(e.to_string()))?;
        let remote_keys = KeyStrategy::from_meta(schema.naming(), remote, cipher)
            .map_err(|e| failure(e.to_string()))?;
        let mut values = decode_values(&merged, &merged_keys);
        let remote_values = decode_values(remote, &remote_keys);

        let mut conflicts = Vec::new();
        for (name, value) in &values {
            let Value::Entity(winner) = value else {
                continue;
            };
            let conflicted = merged_keys
                .existing_key_for(name)
                .is_some_and(|key| merged.get_conflicts(&key).is_some());
            if !conflicted {
                continue;
            }
            let ours = state.values.get(name).and_then(Value::as_soul);
            let theirs = remote_values.get(name).and_then(Value::as_soul);
            if let (Some(ours), Some(theirs)) = (ours, theirs) {
                if ours != theirs {
                    conflicts.push(ReferenceConflict {
                        attribute: name.clone(),
                        local: ours.clone(),
                        remote: theirs.clone(),
                        merged: winner.clone(),
                    });
                }
            }
        }

        // Values that never reach the document survive the merge.
        for (name, value) in &state.values {
            let local_only = matches!(value, Value::Handle(_))
                || schema
                    .get_attribute(name)
                    .is_some_and(|spec| !spec.is_stored());
            if local_only {
                values.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }

        let changes = diff_values(&state.values, &values);
        for change in &changes {
            let (old, new) = match change {
                AttributeChange::Set { old, new, .. } => (old, Some(new)),
                AttributeChange::Deleted { old, .. } => (old, None),
            };
            if let Value::Entity(previous) = old {
                self.registry
                    .remove_referrer(previous, soul, change.attribute());
            }
            if let Some(Value::Entity(target)) = new {
                self.registry.add_referrer(target, soul, change.attribute());
            }
        }
        let newly_deleted = merged.get_meta(META_DELETED).is_some() && !entity.is_deleted();

        state.doc = merged;
        state.values = values;
        state.keys = merged_keys;
        drop(state);
        if !Arc::ptr_eq(&schema, &current) {
            info!("{soul}: now a {} entity", schema.origin());
            entity.set_schema(schema);
        }
        if newly_deleted {
            entity.set_deleted(true);
        }
        Ok(Some(MergePlan {
            changes,
            conflicts,
            newly_deleted,
        }))
    }

    async fn conflict_side(self: &Arc<Self>, soul: &Soul) -> Side {
        if self.registry.is_deleted(soul) {
            return Side::Deleted;
        }
        match self.resolve(soul).await {
            Some(entity) if entity.is_deleted() => Side::Deleted,
            Some(entity) => Side::Live(entity),
            None if self.registry.is_deleted(soul) => Side::Deleted,
            None => Side::Unavailable,
        }
    }

    async fn resolve_conflict(
        self: &Arc<Self>,
        entity: &Entity,
        conflict: ReferenceConflict,
        visited: &mut HashSet<Soul>,
    ) -> EngineResult<()> {
        let ReferenceConflict {
            attribute,
            local,
            remote,
            merged,
        } = conflict;
        let soul = entity.soul();
        let local_side = self.conflict_side(&local).await;
        let remote_side = self.conflict_side(&remote).await;

        let (winner, loser) = match (local_side, remote_side) {
            (Side::Deleted, _) | (_, Side::Deleted) => {
                info!("{soul}.{attribute}: referenced entity was deleted, clearing");
                entity.delete(&attribute).await;
                for side in [&local, &remote] {
                    if self.registry.is_deleted(side) {
                        self.drop_entity(side).await?;
                    }
                }
                return Ok(());
            }
            (Side::Live(l), Side::Live(r)) => match pick_winner(l, r, &merged) {
                Some(pair) => pair,
                None => {
                    debug!("{soul}.{attribute}: different entity types, keeping {merged}");
                    return Ok(());
                }
            },
            _ => {
                debug!("{soul}.{attribute}: one side is unavailable, keeping {merged}");
                return Ok(());
            }
        };

        info!(
            "{soul}.{attribute}: merging {} into {}",
            loser.soul(),
            winner.soul()
        );
        self.absorb(winner.clone(), loser.clone(), visited).await?;
        let points_at_winner = entity
            .lock_state()
            .values
            .get(&attribute)
            .and_then(Value::as_soul)
            == Some(winner.soul());
        if !points_at_winner {
            entity.set(&attribute, Value::Entity(winner.soul().clone())).await;
        }
        self.drop_entity(loser.soul()).await
    }

    /// Copies into `winner` what `loser` holds that the winner lacks or
    /// wrote earlier, recursing into nested reference conflicts.
    fn absorb<'a>(
        self: &'a Arc<Self>,
        winner: Entity,
        loser: Entity,
        visited: &'a mut HashSet<Soul>,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if winner.ptr_eq(&loser) || !visited.insert(loser.soul().clone()) {
                return Ok(());
            }
            let taken: Vec<(String, Value, Option<HybridTimestamp>)> = {
                let state = loser.lock_state();
                state
                    .values
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone(), written_at(&state, name)))
                    .collect()
            };
            for (name, value, loser_written) in taken {
                let (current, winner_written) = {
                    let state = winner.lock_state();
                    (state.values.get(&name).cloned(), written_at(&state, &name))
                };
                match (current, value) {
                    (Some(Value::Entity(kept)), Value::Entity(lost)) if kept != lost => {
                        let (Some(kept), Some(lost)) =
                            (self.resolve(&kept).await, self.resolve(&lost).await)
                        else {
                            continue;
                        };
                        if kept.origin() == lost.origin() || lost.schema().is_untyped() {
                            let lost_soul = lost.soul().clone();
                            self.absorb(kept, lost, visited).await?;
                            self.drop_entity(&lost_soul).await?;
                        }
                    }
                    (None, value) => {
                        winner.set(&name, value).await;
                    }
                    (Some(current), value)
                        if current != value && loser_written > winner_written =>
                    {
                        winner.set(&name, value).await;
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

/// Orders two live candidates as (winner, loser). `None` when neither is
/// preferable and the document's choice stands as is.
fn pick_winner(local: Entity, remote: Entity, merged: &Soul) -> Option<(Entity, Entity)> {
    match (local.schema().is_untyped(), remote.schema().is_untyped()) {
        (true, false) => return Some((remote, local)),
        (false, true) => return Some((local, remote)),
        (false, false) if local.origin() != remote.origin() => return None,
        _ => {}
    }
    if remote.soul() == merged || (local.soul() != merged && remote.soul() > local.soul()) {
        Some((remote, local))
    } else {
        Some((local, remote))
    }
}

fn written_at(state: &EntityState, name: &str) -> Option<HybridTimestamp> {
    let key = state.keys.existing_key_for(name)?;
    state.doc.register(&key).map(|register| register.timestamp())
}
