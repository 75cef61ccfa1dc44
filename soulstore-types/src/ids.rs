//! Identifier types used throughout soulstore.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier of a graph node.
///
/// A soul is the storage key of an entity's record, its key in the identity
/// registry and the address peers use to exchange its document. Random souls
/// are UUID v4 in simple (hyphen-less) form; callers may also supply derived
/// souls of their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Soul(String);

impl Soul {
    /// Creates a new random soul.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parses a caller-supplied soul. Empty strings and whitespace are rejected.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidSoul(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the soul as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Soul {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Soul {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for Soul {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Soul {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Soul {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a replica (process) participating in sync.
///
/// Used as the CRDT actor id: every register written by this replica is
/// tagged with it, and it breaks timestamp ties deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Creates a new peer ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a peer ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a peer ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
