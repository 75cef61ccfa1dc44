//! Entity schemas: attribute declarations, naming modes and the per-origin
//! schema cache.

use crate::attribute::{AttributeKind, AttributeOptions, AttributeSpec};
use crate::{AttributeView, EntityHooks};
use serde::{Deserialize, Serialize};
use soulstore_types::Value;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Origin of the untyped object schema.
pub const OBJECT_ORIGIN: &str = "Object";
/// Origin of the untyped array schema.
pub const ARRAY_ORIGIN: &str = "Array";

/// Computes a derived attribute from the entity's current attributes.
pub type DeriveFn = Arc<dyn Fn(&AttributeView) -> Value + Send + Sync>;

/// How attribute names map to storage keys in the mirror document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingMode {
    /// Only declared attributes; reference attributes get a random storage
    /// key recorded in the mirror metadata.
    #[default]
    Named,
    /// Any attribute; the name itself is the storage key.
    Variable,
    /// Any attribute; the storage key is the name encrypted with a
    /// per-entity key.
    VariableEncrypted,
}

/// What to materialize for an attribute read before it was ever written.
#[derive(Debug, Clone, PartialEq)]
pub enum AutoComplete {
    Value(Value),
    /// A fresh, empty entity of the given schema.
    Instance { origin: String },
}

/// An entity type: its attributes and persistence policy.
pub struct Schema {
    origin: String,
    attributes: BTreeMap<String, AttributeSpec>,
    naming: NamingMode,
    ephemeral: bool,
    immediate: bool,
    list: bool,
    hooks: Option<Arc<dyn EntityHooks>>,
    derivations: HashMap<String, DeriveFn>,
}

impl Schema {
    pub fn builder(origin: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(origin)
    }

    /// The untyped object schema: arbitrary attributes stored under their
    /// own names.
    pub fn untyped_object() -> Self {
        Self::builder(OBJECT_ORIGIN)
            .naming(NamingMode::Variable)
            .build()
    }

    /// The untyped array schema: items stored under their decimal index.
    pub fn untyped_array() -> Self {
        Self::builder(ARRAY_ORIGIN)
            .naming(NamingMode::Variable)
            .list(true)
            .build()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn naming(&self) -> NamingMode {
        self.naming
    }

    /// Entities of an ephemeral schema are never persisted.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Entities of an immediate schema bypass write debouncing.
    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    /// True for array-valued entities.
    pub fn is_list(&self) -> bool {
        self.list
    }

    /// True for the generic `Object` and `Array` schemas.
    pub fn is_untyped(&self) -> bool {
        self.origin == OBJECT_ORIGIN || self.origin == ARRAY_ORIGIN
    }

    pub fn hooks(&self) -> Option<&Arc<dyn EntityHooks>> {
        self.hooks.as_ref()
    }

    /// Returns true for names that can never be attributes.
    pub fn is_private_name(name: &str) -> bool {
        name.is_empty() || name.starts_with('_') || name.starts_with('$') || name.ends_with('_')
    }

    /// Looks up the policy of an attribute.
    ///
    /// Declared attributes are returned as is. Undeclared names are accepted
    /// only when the naming mode allows arbitrary attributes, in which case a
    /// persistent, enumerable, non-embedded `Any` attribute is synthesized.
    pub fn get_attribute(&self, name: &str) -> Option<Cow<'_, AttributeSpec>> {
        if Self::is_private_name(name) {
            return None;
        }
        if let Some(spec) = self.attributes.get(name) {
            return Some(Cow::Borrowed(spec));
        }
        match self.naming {
            NamingMode::Named => None,
            NamingMode::Variable | NamingMode::VariableEncrypted => Some(Cow::Owned(
                AttributeOptions::any().embedded(false).resolve(name),
            )),
        }
    }

    /// Names of the declared attributes, in name order.
    pub fn get_attribute_names(&self) -> Vec<&str> {
        self.attributes.keys().map(String::as_str).collect()
    }

    /// Declared attributes, in name order.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.values()
    }

    pub fn get_default_value(&self, name: &str) -> Option<Value> {
        self.attributes.get(name)?.default_value.clone()
    }

    /// Computes a derived attribute, if a derive function is registered.
    pub fn derive(&self, name: &str, view: &AttributeView) -> Option<Value> {
        self.derivations.get(name).map(|f| f(view))
    }

    /// Decides what to materialize for an autocompleting attribute that has
    /// no value yet.
    pub fn autocomplete_for(&self, view: &AttributeView, name: &str) -> Option<AutoComplete> {
        let spec = self.attributes.get(name)?;
        if !spec.autocomplete || view.get(name).is_some() {
            return None;
        }
        if let Some(value) = &spec.default_value {
            return Some(AutoComplete::Value(value.clone()));
        }
        let fallback = match spec.kind {
            AttributeKind::Object | AttributeKind::Compound => OBJECT_ORIGIN,
            AttributeKind::Collection => ARRAY_ORIGIN,
            AttributeKind::Simple(_) => return None,
        };
        Some(AutoComplete::Instance {
            origin: spec.target.clone().unwrap_or_else(|| fallback.to_string()),
        })
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("origin", &self.origin)
            .field("attributes", &self.attributes)
            .field("naming", &self.naming)
            .field("ephemeral", &self.ephemeral)
            .field("immediate", &self.immediate)
            .field("list", &self.list)
            .field("hooks", &self.hooks.is_some())
            .field("derivations", &self.derivations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a [`Schema`].
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            schema: Schema {
                origin: origin.into(),
                attributes: BTreeMap::new(),
                naming: NamingMode::default(),
                ephemeral: false,
                immediate: false,
                list: false,
                hooks: None,
                derivations: HashMap::new(),
            },
        }
    }

    /// Declares an attribute. Redeclaring a name replaces it.
    pub fn attribute(mut self, name: &str, options: AttributeOptions) -> Self {
        self.schema
            .attributes
            .insert(name.to_string(), options.resolve(name));
        self
    }

    pub fn naming(mut self, naming: NamingMode) -> Self {
        self.schema.naming = naming;
        self
    }

    pub fn ephemeral(mut self, on: bool) -> Self {
        self.schema.ephemeral = on;
        self
    }

    pub fn immediate(mut self, on: bool) -> Self {
        self.schema.immediate = on;
        self
    }

    pub fn list(mut self, on: bool) -> Self {
        self.schema.list = on;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn EntityHooks>) -> Self {
        self.schema.hooks = Some(hooks);
        self
    }

    /// Declares a derived attribute computed by `f`.
    pub fn derive<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&AttributeView) -> Value + Send + Sync + 'static,
    {
        let spec = match self.schema.attributes.remove(name) {
            Some(mut spec) => {
                spec.derived = true;
                spec.persistent = false;
                spec
            }
            None => AttributeOptions::any().derived().resolve(name),
        };
        self.schema.attributes.insert(name.to_string(), spec);
        self.schema.derivations.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

/// Caches one schema per origin.
///
/// Always contains the untyped [`OBJECT_ORIGIN`] and [`ARRAY_ORIGIN`] schemas.
#[derive(Debug)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut schemas = HashMap::new();
        schemas.insert(OBJECT_ORIGIN.to_string(), Arc::new(Schema::untyped_object()));
        schemas.insert(ARRAY_ORIGIN.to_string(), Arc::new(Schema::untyped_array()));
        Self {
            schemas: RwLock::new(schemas),
        }
    }

    /// Registers a schema and returns the cached instance for its origin.
    ///
    /// The first registration of an origin wins; later ones return the
    /// already cached schema.
    pub fn register(&self, schema: Schema) -> Arc<Schema> {
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        schemas
            .entry(schema.origin.clone())
            .or_insert_with(|| Arc::new(schema))
            .clone()
    }

    pub fn get(&self, origin: &str) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned()
    }

    /// Resolves an origin, falling back to the untyped object schema for
    /// origins this process does not know.
    pub fn get_or_untyped(&self, origin: &str) -> Arc<Schema> {
        self.get(origin)
            .or_else(|| self.get(OBJECT_ORIGIN))
            .unwrap_or_else(|| Arc::new(Schema::untyped_object()))
    }

    /// Registered origins, sorted.
    pub fn origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        origins.sort();
        origins
    }
}
