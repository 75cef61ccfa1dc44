//! Dynamic attribute values.
//!
//! Entities are schema-described but dynamically typed: every attribute holds
//! a [`Value`]. Simple variants are inlined into the mirror document, `List`
//! and `Map` are either embedded or promoted to their own graph node, and
//! `Entity` points at another node by soul.

use crate::Soul;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value. Assigning it to an attribute deletes the attribute.
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
    /// A regular expression kept as source text plus flags.
    Regex { source: String, flags: String },
    Binary(Vec<u8>),
    /// A captured error (name and message only; stacks are not kept).
    Error { name: String, message: String },
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A reference to another decorated entity.
    Entity(Soul),
    /// A reference to a schema itself, by origin name.
    Class(String),
    /// A process-local runtime handle (socket, callback, ...). Never
    /// serialized and never referenced; it only lives in the local copy.
    Handle(String),
}

impl Value {
    /// Returns true for `Value::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the text content, if this is a `Text` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric content, if this is a `Number` value.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a `Bool` value.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the referenced soul, if this is an `Entity` value.
    #[must_use]
    pub fn as_soul(&self) -> Option<&Soul> {
        match self {
            Self::Entity(soul) => Some(soul),
            _ => None,
        }
    }

    /// Returns the map content, if this is a `Map` value.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the list content, if this is a `List` value.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// A short name of the variant, used in logs and error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Regex { .. } => "regex",
            Self::Binary(_) => "binary",
            Self::Error { .. } => "error",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Entity(_) => "entity",
            Self::Class(_) => "class",
            Self::Handle(_) => "handle",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Soul> for Value {
    fn from(soul: Soul) -> Self {
        Self::Entity(soul)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}
