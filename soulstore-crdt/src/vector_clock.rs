//! Vector Clock for causality tracking.
//!
//! A document's heads: for every peer, the number of changes from that peer
//! the document has incorporated. Comparing two documents' clocks tells
//! whether one has seen everything the other has (and so whether two writes
//! to the same key were concurrent).

use crate::lww_register::Dot;
use soulstore_types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Clocks are concurrent (neither happened before the other).
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// A Vector Clock keyed by peer.
///
/// Backed by a `BTreeMap` so serialized documents are byte-for-byte
/// deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the logical time for a peer (0 if not present).
    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> u64 {
        self.clocks.get(peer_id).copied().unwrap_or(0)
    }

    /// Returns all peers and their times in peer order.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &u64)> {
        self.clocks.iter()
    }

    /// Returns the number of peers in the clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Returns true if the clock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Increments the clock for a peer and returns the new time.
    pub fn increment(&mut self, peer_id: PeerId) -> u64 {
        let entry = self.clocks.entry(peer_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Returns true if the change identified by `dot` is included.
    #[must_use]
    pub fn covers(&self, dot: &Dot) -> bool {
        self.get(&dot.peer) >= dot.counter
    }

    /// Merges another vector clock into this one (pointwise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (peer_id, &time) in &other.clocks {
            let entry = self.clocks.entry(*peer_id).or_insert(0);
            if time > *entry {
                *entry = time;
            }
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_dominates = true;
        let mut other_dominates = true;

        for peer_id in self.clocks.keys().chain(other.clocks.keys()) {
            let self_time = self.get(peer_id);
            let other_time = other.get(peer_id);
            if self_time < other_time {
                self_dominates = false;
            }
            if other_time < self_time {
                other_dominates = false;
            }
        }

        match (self_dominates, other_dominates) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Returns true if this clock dominates the other (is >= for all peers).
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}
