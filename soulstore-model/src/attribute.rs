use serde::{Deserialize, Serialize};
use soulstore_types::Value;

/// The value type of a simple (always inlined) attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleType {
    Any,
    Text,
    Number,
    Bool,
    Date,
    Regex,
    Binary,
    Error,
}

impl SimpleType {
    /// Returns true if `value` is acceptable for this type. `Null` always is.
    pub fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::Text, Value::Text(_))
            | (Self::Number, Value::Number(_))
            | (Self::Bool, Value::Bool(_))
            | (Self::Date, Value::Date(_))
            | (Self::Regex, Value::Regex { .. })
            | (Self::Binary, Value::Binary(_))
            | (Self::Error, Value::Error { .. }) => true,
            _ => false,
        }
    }
}

/// What an attribute holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "type")]
pub enum AttributeKind {
    /// A simple value, always inlined in the mirror document.
    Simple(SimpleType),
    /// A single object; by default stored as a separate graph node.
    Object,
    /// A list or set; by default stored as a separate graph node.
    Collection,
    /// A structured value inlined into its parent.
    Compound,
}

/// Fully resolved policy of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub name: String,
    pub kind: AttributeKind,
    /// Mirrored into the document and replicated. Non-persistent attributes
    /// live only in the local copy.
    pub persistent: bool,
    /// Inline the value instead of storing it as its own graph node.
    pub embedded: bool,
    /// Listed by `keys()`.
    pub enumerable: bool,
    /// Must hold a value for a transaction involving the entity to prepare.
    pub mandatory: bool,
    /// Deep-merge object values into the existing value instead of replacing.
    pub merge: bool,
    /// Computed from other attributes; never stored.
    pub derived: bool,
    /// Provided by the engine (soul, origin, timestamps); never stored.
    pub emergent: bool,
    /// Materialize a default (value or instance) on first read.
    pub autocomplete: bool,
    pub default_value: Option<Value>,
    /// Origin of the schema referenced or collected by this attribute.
    pub target: Option<String>,
}

impl AttributeSpec {
    /// True if the attribute is written to the mirror document.
    pub fn is_stored(&self) -> bool {
        self.persistent && !self.derived && !self.emergent
    }

    /// True if values of this attribute may become references.
    pub fn is_referencing(&self) -> bool {
        !self.embedded && matches!(self.kind, AttributeKind::Object | AttributeKind::Collection)
    }

    /// Checks the type of a value about to be assigned.
    pub fn admits(&self, value: &Value) -> bool {
        match self.kind {
            AttributeKind::Simple(t) => t.admits(value),
            AttributeKind::Object | AttributeKind::Compound => matches!(
                value,
                Value::Null | Value::Map(_) | Value::Entity(_) | Value::Handle(_)
            ),
            AttributeKind::Collection => matches!(
                value,
                Value::Null | Value::List(_) | Value::Entity(_) | Value::Handle(_)
            ),
        }
    }
}

/// Explicitly declared options for one attribute; unset fields fall back to
/// the kind preset, then to the global defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeOptions {
    pub kind: Option<AttributeKind>,
    pub persistent: Option<bool>,
    pub embedded: Option<bool>,
    pub enumerable: Option<bool>,
    pub mandatory: Option<bool>,
    pub merge: Option<bool>,
    pub derived: Option<bool>,
    pub emergent: Option<bool>,
    pub autocomplete: Option<bool>,
    pub default_value: Option<Value>,
    pub target: Option<String>,
}

impl AttributeOptions {
    fn of_kind(kind: AttributeKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Shorthand for an attribute of any simple type.
    pub fn any() -> Self {
        Self::of_kind(AttributeKind::Simple(SimpleType::Any))
    }

    /// Shorthand for a text attribute.
    pub fn text() -> Self {
        Self::of_kind(AttributeKind::Simple(SimpleType::Text))
    }

    /// Shorthand for a numeric attribute.
    pub fn number() -> Self {
        Self::of_kind(AttributeKind::Simple(SimpleType::Number))
    }

    /// Shorthand for a boolean attribute.
    pub fn bool() -> Self {
        Self::of_kind(AttributeKind::Simple(SimpleType::Bool))
    }

    /// Shorthand for a date attribute.
    pub fn date() -> Self {
        Self::of_kind(AttributeKind::Simple(SimpleType::Date))
    }

    /// Shorthand for a reference to an entity of schema `target`.
    pub fn object(target: &str) -> Self {
        Self {
            target: Some(target.to_string()),
            ..Self::of_kind(AttributeKind::Object)
        }
    }

    /// Shorthand for a reference to an untyped object.
    pub fn untyped_object() -> Self {
        Self::of_kind(AttributeKind::Object)
    }

    /// Shorthand for a collection attribute.
    pub fn collection() -> Self {
        Self::of_kind(AttributeKind::Collection)
    }

    /// Shorthand for an inlined structured attribute.
    pub fn compound() -> Self {
        Self::of_kind(AttributeKind::Compound)
    }

    pub fn persistent(mut self, on: bool) -> Self {
        self.persistent = Some(on);
        self
    }

    pub fn embedded(mut self, on: bool) -> Self {
        self.embedded = Some(on);
        self
    }

    pub fn enumerable(mut self, on: bool) -> Self {
        self.enumerable = Some(on);
        self
    }

    pub fn mandatory(mut self, on: bool) -> Self {
        self.mandatory = Some(on);
        self
    }

    pub fn merge(mut self, on: bool) -> Self {
        self.merge = Some(on);
        self
    }

    pub fn derived(mut self) -> Self {
        self.derived = Some(true);
        self
    }

    pub fn emergent(mut self) -> Self {
        self.emergent = Some(true);
        self
    }

    pub fn autocomplete(mut self, on: bool) -> Self {
        self.autocomplete = Some(on);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn target(mut self, origin: &str) -> Self {
        self.target = Some(origin.to_string());
        self
    }

    /// Type-level defaults for a kind.
    fn preset(kind: AttributeKind) -> Self {
        match kind {
            AttributeKind::Simple(_) => Self {
                embedded: Some(true),
                merge: Some(false),
                ..Self::default()
            },
            AttributeKind::Object | AttributeKind::Collection => Self {
                embedded: Some(false),
                merge: Some(false),
                ..Self::default()
            },
            AttributeKind::Compound => Self {
                embedded: Some(true),
                merge: Some(true),
                ..Self::default()
            },
        }
    }

    /// Resolves explicit options over the kind preset and global defaults.
    pub fn resolve(self, name: &str) -> AttributeSpec {
        let kind = self.kind.unwrap_or(AttributeKind::Simple(SimpleType::Any));
        let preset = Self::preset(kind);
        let pick = |explicit: Option<bool>, preset: Option<bool>, global: bool| {
            explicit.or(preset).unwrap_or(global)
        };

        let derived = pick(self.derived, preset.derived, false);
        let emergent = pick(self.emergent, preset.emergent, false);
        AttributeSpec {
            name: name.to_string(),
            kind,
            persistent: !derived && !emergent && pick(self.persistent, preset.persistent, true),
            embedded: pick(self.embedded, preset.embedded, false),
            enumerable: pick(self.enumerable, preset.enumerable, true),
            mandatory: pick(self.mandatory, preset.mandatory, false),
            merge: pick(self.merge, preset.merge, false),
            derived,
            emergent,
            autocomplete: pick(self.autocomplete, preset.autocomplete, false),
            default_value: self.default_value,
            target: self.target,
        }
    }
}
