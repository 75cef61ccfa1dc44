//! Last-Writer-Wins Register (LWW-Register).
//!
//! A CRDT that stores a single value. Every write is tagged with a [`Dot`]
//! (the writing peer plus that peer's change counter) so that documents can
//! tell causally-later writes from concurrent ones. Concurrent writes are
//! resolved by comparing timestamps, with the peer ID as a deterministic
//! tie-breaker.

use soulstore_types::{HybridTimestamp, PeerId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Identifies one change: the peer that made it and its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dot {
    #[serde(rename = "p")]
    pub peer: PeerId,
    #[serde(rename = "n")]
    pub counter: u64,
}

impl Dot {
    #[must_use]
    pub const fn new(peer: PeerId, counter: u64) -> Self {
        Self { peer, counter }
    }
}

/// A Last-Writer-Wins Register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LWWRegister<T> {
    #[serde(rename = "v")]
    value: T,
    #[serde(rename = "t")]
    timestamp: HybridTimestamp,
    #[serde(rename = "d")]
    dot: Dot,
}

impl<T> LWWRegister<T> {
    /// Creates a register for a write made by `dot` at `timestamp`.
    #[must_use]
    pub fn new(value: T, timestamp: HybridTimestamp, dot: Dot) -> Self {
        Self {
            value,
            timestamp,
            dot,
        }
    }

    /// Returns a reference to the current value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Returns the timestamp of the last write.
    #[must_use]
    pub fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }

    /// Returns the change that produced the current value.
    #[must_use]
    pub fn dot(&self) -> Dot {
        self.dot
    }

    /// Returns the peer that performed the last write.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.dot.peer
    }

    /// Total order used when two writes are concurrent: timestamp first, then
    /// peer ID, then the peer's change counter.
    #[must_use]
    pub fn wins_over(&self, other: &Self) -> bool {
        let key = |r: &Self| (r.timestamp, r.dot.peer, r.dot.counter);
        key(self).cmp(&key(other)) == Ordering::Greater
    }
}

impl<T: Clone> LWWRegister<T> {
    /// Merges another register into this one by pure last-writer-wins.
    pub fn merge(&mut self, other: &Self) {
        if other.wins_over(self) {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.dot = other.dot;
        }
    }

    /// Creates a new register that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }
}

impl<T: PartialEq> PartialEq for LWWRegister<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.timestamp == other.timestamp && self.dot == other.dot
    }
}

impl<T: Eq> Eq for LWWRegister<T> {}
