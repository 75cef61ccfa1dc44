//! Change events emitted by decorated entities.
//!
//! Every successful local mutation and every merged remote change produces an
//! [`EntityEvent`]. Events are delivered in the order the mutations were
//! applied to the entity's mirror document.

use crate::{Soul, Value};

/// A single attribute-level difference.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeChange {
    /// The attribute now holds `new` (it held `old` before, `Null` if unset).
    Set {
        attribute: String,
        old: Value,
        new: Value,
    },
    /// The attribute was removed; it held `old` before.
    Deleted { attribute: String, old: Value },
}

impl AttributeChange {
    /// The attribute this change applies to.
    #[must_use]
    pub fn attribute(&self) -> &str {
        match self {
            Self::Set { attribute, .. } | Self::Deleted { attribute, .. } => attribute,
        }
    }
}

/// What happened to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A local write changed one attribute.
    Changed(AttributeChange),
    /// The entity itself was tombstoned.
    EntityDeleted,
    /// A peer snapshot was merged, producing this change-set.
    Merged(Vec<AttributeChange>),
}

/// An event about one entity, identified by soul.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub soul: Soul,
    pub kind: EventKind,
}

impl EntityEvent {
    /// Creates a local attribute-set event.
    #[must_use]
    pub fn changed(soul: Soul, attribute: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            soul,
            kind: EventKind::Changed(AttributeChange::Set {
                attribute: attribute.into(),
                old,
                new,
            }),
        }
    }

    /// Creates a local attribute-delete event.
    #[must_use]
    pub fn deleted(soul: Soul, attribute: impl Into<String>, old: Value) -> Self {
        Self {
            soul,
            kind: EventKind::Changed(AttributeChange::Deleted {
                attribute: attribute.into(),
                old,
            }),
        }
    }

    /// Creates an entity tombstone event.
    #[must_use]
    pub fn entity_deleted(soul: Soul) -> Self {
        Self {
            soul,
            kind: EventKind::EntityDeleted,
        }
    }

    /// Creates a merge event carrying the full change-set.
    #[must_use]
    pub fn merged(soul: Soul, changes: Vec<AttributeChange>) -> Self {
        Self {
            soul,
            kind: EventKind::Merged(changes),
        }
    }
}
