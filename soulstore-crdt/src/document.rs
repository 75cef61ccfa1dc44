//! Convergent mirror document.
//!
//! A [`Document`] holds two last-writer-wins maps of JSON values: `entries`
//! (one per stored attribute) and `meta` (origin, timestamps, tombstone,
//! key material). Its heads are a [`VectorClock`] counting the changes each
//! peer contributed.
//!
//! Two writes to the same key are *causal* when one side had already seen the
//! other's write (its heads cover the write's dot); the later write wins
//! outright. Otherwise the writes are *concurrent*: the higher
//! `(timestamp, peer)` wins and both values are kept as conflicts for that
//! key until it is written again locally.
//!
//! Array-valued entities store their items under decimal index keys with a
//! `len` metadata register; [`Document::list_values`] reads them back in
//! order.

use crate::error::{CrdtError, CrdtResult};
use crate::lww_register::{Dot, LWWRegister};
use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use soulstore_types::{HybridTimestamp, PeerId};
use std::collections::BTreeMap;

/// Metadata key holding the list length of array-valued entities.
pub const LIST_LEN_KEY: &str = "len";

type Registers = BTreeMap<String, LWWRegister<JsonValue>>;

/// One entry of a document's heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Head {
    pub peer: PeerId,
    pub counter: u64,
}

#[derive(Debug, Clone)]
enum Op {
    Put(String, JsonValue),
    Delete(String),
    PutMeta(String, JsonValue),
    DeleteMeta(String),
}

/// Mutations collected by [`Document::change`].
///
/// All operations recorded in one change share a single dot and timestamp.
#[derive(Debug, Default)]
pub struct Change {
    ops: Vec<Op>,
}

impl Change {
    /// Sets an entry.
    pub fn put(&mut self, key: impl Into<String>, value: JsonValue) {
        self.ops.push(Op::Put(key.into(), value));
    }

    /// Marks an entry deleted. A deleted entry reads as JSON `null`, which is
    /// distinguishable from a key that was never written.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(Op::Delete(key.into()));
    }

    /// Sets a metadata register.
    pub fn put_meta(&mut self, key: impl Into<String>, value: JsonValue) {
        self.ops.push(Op::PutMeta(key.into(), value));
    }

    /// Marks a metadata register deleted.
    pub fn delete_meta(&mut self, key: impl Into<String>) {
        self.ops.push(Op::DeleteMeta(key.into()));
    }

    /// Returns true if no operation was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A convergent map document mirroring one entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "e", default)]
    entries: Registers,
    #[serde(rename = "m", default)]
    meta: Registers,
    #[serde(rename = "h", default)]
    heads: VectorClock,
    #[serde(rename = "t", default = "HybridTimestamp::zero")]
    clock: HybridTimestamp,
    /// Local introspection only: never saved, never compared.
    #[serde(skip)]
    conflicts: BTreeMap<String, BTreeMap<String, JsonValue>>,
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn init() -> Self {
        Self {
            clock: HybridTimestamp::zero(),
            ..Self::default()
        }
    }

    /// Applies the mutations recorded by `f` and returns the new document.
    ///
    /// The receiver is left untouched. A change that records no operation
    /// returns an identical copy without advancing the heads.
    #[must_use]
    pub fn change<F>(&self, actor: PeerId, f: F) -> Self
    where
        F: FnOnce(&mut Change),
    {
        let mut doc = self.clone();
        let mut change = Change::default();
        f(&mut change);
        if change.is_empty() {
            return doc;
        }

        let counter = doc.heads.increment(actor);
        let dot = Dot::new(actor, counter);
        doc.clock = doc.clock.tick();
        let ts = doc.clock;

        for op in change.ops {
            match op {
                Op::Put(key, value) => {
                    doc.conflicts.remove(&key);
                    doc.entries.insert(key, LWWRegister::new(value, ts, dot));
                }
                Op::Delete(key) => {
                    doc.conflicts.remove(&key);
                    doc.entries
                        .insert(key, LWWRegister::new(JsonValue::Null, ts, dot));
                }
                Op::PutMeta(key, value) => {
                    doc.meta.insert(key, LWWRegister::new(value, ts, dot));
                }
                Op::DeleteMeta(key) => {
                    doc.meta
                        .insert(key, LWWRegister::new(JsonValue::Null, ts, dot));
                }
            }
        }
        doc
    }

    /// Merges two documents. The result contains every change of both.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut conflicts = self.conflicts.clone();
        for (key, values) in &other.conflicts {
            conflicts
                .entry(key.clone())
                .or_default()
                .extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let entries = merge_registers(
            &self.entries,
            &self.heads,
            &other.entries,
            &other.heads,
            Some(&mut conflicts),
        );
        let meta = merge_registers(&self.meta, &self.heads, &other.meta, &other.heads, None);

        Self {
            entries,
            meta,
            heads: self.heads.merged(&other.heads),
            clock: self.clock.max(other.clock),
            conflicts,
        }
    }

    /// Returns the entry for `key`: `None` if never written, `Some(Null)` if
    /// deleted.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key).map(LWWRegister::value)
    }

    /// Returns the metadata register for `key`, treating deleted as absent.
    #[must_use]
    pub fn get_meta(&self, key: &str) -> Option<&JsonValue> {
        self.meta
            .get(key)
            .map(LWWRegister::value)
            .filter(|v| !v.is_null())
    }

    /// Returns the register for `key`, including its timestamp and dot.
    #[must_use]
    pub fn register(&self, key: &str) -> Option<&LWWRegister<JsonValue>> {
        self.entries.get(key)
    }

    /// Iterates over all entry keys, including deleted ones.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over live (non-deleted) entries.
    pub fn live_entries(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.entries
            .iter()
            .filter(|(_, reg)| !reg.value().is_null())
            .map(|(k, reg)| (k.as_str(), reg.value()))
    }

    /// Iterates over live metadata registers.
    pub fn live_meta(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.meta
            .iter()
            .filter(|(_, reg)| !reg.value().is_null())
            .map(|(k, reg)| (k.as_str(), reg.value()))
    }

    /// Returns the values of an array-valued entity in index order.
    #[must_use]
    pub fn list_values(&self) -> Vec<&JsonValue> {
        let len = self
            .get_meta(LIST_LEN_KEY)
            .and_then(JsonValue::as_u64)
            .map(|n| n as usize);
        let mut indexed: Vec<(usize, &JsonValue)> = self
            .live_entries()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
            .filter(|(i, _)| len.is_none_or(|n| *i < n))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, v)| v).collect()
    }

    /// Returns true if the document has never been changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Returns the document heads as a sorted list.
    #[must_use]
    pub fn get_heads(&self) -> Vec<Head> {
        self.heads
            .peers()
            .map(|(peer, counter)| Head {
                peer: *peer,
                counter: *counter,
            })
            .collect()
    }

    /// Returns the vector clock of this document.
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.heads
    }

    /// Returns all values concurrently written to `key`, keyed by peer ID,
    /// or `None` when the key has no unresolved concurrent writes.
    #[must_use]
    pub fn get_conflicts(&self, key: &str) -> Option<&BTreeMap<String, JsonValue>> {
        self.conflicts.get(key).filter(|values| values.len() > 1)
    }

    /// Structural equality: same heads and same register contents.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self.heads == other.heads && self.entries == other.entries && self.meta == other.meta
    }

    /// Serializes the document to bytes.
    pub fn save(&self) -> CrdtResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Loads a document previously produced by [`Document::save`].
    pub fn load(bytes: &[u8]) -> CrdtResult<Self> {
        let doc: Self = serde_json::from_slice(bytes)?;
        for (key, reg) in doc.entries.iter().chain(doc.meta.iter()) {
            if !doc.heads.covers(&reg.dot()) {
                return Err(CrdtError::Corrupt(format!(
                    "register {key:?} written by a change outside the heads"
                )));
            }
        }
        Ok(doc)
    }
}

fn merge_registers(
    left: &Registers,
    left_heads: &VectorClock,
    right: &Registers,
    right_heads: &VectorClock,
    mut conflicts: Option<&mut BTreeMap<String, BTreeMap<String, JsonValue>>>,
) -> Registers {
    let mut out = left.clone();
    for (key, theirs) in right {
        let Some(ours) = left.get(key) else {
            out.insert(key.clone(), theirs.clone());
            continue;
        };
        if ours.dot() == theirs.dot() {
            continue;
        }

        let they_saw_ours = right_heads.covers(&ours.dot());
        let we_saw_theirs = left_heads.covers(&theirs.dot());
        let winner = match (they_saw_ours, we_saw_theirs) {
            (true, false) => theirs,
            (false, true) => ours,
            _ => {
                if let Some(table) = conflicts.as_deref_mut() {
                    let slot = table.entry(key.clone()).or_default();
                    slot.insert(ours.peer_id().to_string(), ours.value().clone());
                    slot.insert(theirs.peer_id().to_string(), theirs.value().clone());
                }
                if theirs.wins_over(ours) { theirs } else { ours }
            }
        };
        out.insert(key.clone(), winner.clone());
    }
    out
}

impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}
