use soulstore_types::{Soul, Value};
use std::collections::BTreeMap;

/// A read-only snapshot of an entity's attributes.
///
/// Handed to derive functions and [`EntityHooks`](crate::EntityHooks), which
/// must not observe a live, mutating entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeView {
    pub soul: Option<Soul>,
    pub origin: String,
    pub attributes: BTreeMap<String, Value>,
}

impl AttributeView {
    /// Returns an attribute value, if present and not null.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    /// Extract a string attribute.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Extract a boolean attribute.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Extract a numeric attribute.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }
}
