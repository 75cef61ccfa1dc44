//! CRDT primitives for soulstore.
//!
//! This crate provides the convergent document every decorated entity
//! mirrors its persistent attributes into:
//!
//! - [`LWWRegister<T>`]: Last-Writer-Wins Register tagged with a causal [`Dot`]
//! - [`VectorClock`]: Causality tracking across replicas (document heads)
//! - [`Document`]: Two LWW maps (attributes and metadata) with causal merge
//!   and conflict introspection
//!
//! Merging documents is:
//! - **Commutative**: merge(a, b) == merge(b, a)
//! - **Associative**: merge(merge(a, b), c) == merge(a, merge(b, c))
//! - **Idempotent**: merge(a, a) == a
//!
//! so replicas converge regardless of the order snapshots are exchanged in.

mod document;
mod error;
mod lww_register;
mod vector_clock;

pub use document::{Change, Document, Head, LIST_LEN_KEY};
pub use error::{CrdtError, CrdtResult};
pub use lww_register::{Dot, LWWRegister};
pub use vector_clock::{CausalOrder, VectorClock};
