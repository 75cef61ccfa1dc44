//! Attribute name to storage key mapping.
//!
//! One strategy per naming mode. The strategy lives with the entity's state
//! and its key material is mirrored into document metadata (`r` for named
//! reference keys, `k` for the wrapped per-entity key) so every replica maps
//! names the same way.

use crate::error::{EngineError, EngineResult};
use serde_json::Value as JsonValue;
use soulstore_crdt::Document;
use soulstore_crypto::{EntityKey, EnvelopeCipher, WrappedKey};
use soulstore_model::{NamingMode, Schema};
use soulstore_types::Soul;
use std::collections::BTreeMap;
use tracing::warn;

pub(crate) const META_REFERENCE_KEYS: &str = "r";
pub(crate) const META_ENTITY_KEY: &str = "k";

/// Maps attribute names to storage keys.
#[derive(Debug, Clone)]
pub enum KeyStrategy {
    /// Simple attributes use their name; reference attributes use a random
    /// key recorded in metadata.
    Named {
        reference_keys: BTreeMap<String, String>,
        dirty: bool,
    },
    /// Every attribute uses its name.
    Variable,
    /// Every attribute name is encrypted with the entity key.
    VariableEncrypted { key: EntityKey, dirty: bool },
}

impl KeyStrategy {
    /// A fresh strategy for a new entity of `schema`.
    pub fn for_new(schema: &Schema) -> Self {
        match schema.naming() {
            NamingMode::Named => {
                let reference_keys = schema
                    .attributes()
                    .filter(|spec| spec.is_referencing() && spec.is_stored())
                    .map(|spec| (spec.name.clone(), random_key()))
                    .collect::<BTreeMap<_, _>>();
                let dirty = !reference_keys.is_empty();
                Self::Named {
                    reference_keys,
                    dirty,
                }
            }
            NamingMode::Variable => Self::Variable,
            NamingMode::VariableEncrypted => Self::VariableEncrypted {
                key: EntityKey::generate(),
                dirty: true,
            },
        }
    }

    /// Rebuilds the strategy recorded in a document's metadata.
    pub fn from_meta(
        naming: NamingMode,
        doc: &Document,
        cipher: &dyn EnvelopeCipher,
    ) -> EngineResult<Self> {
        Ok(match naming {
            NamingMode::Named => {
                let reference_keys = doc
                    .get_meta(META_REFERENCE_KEYS)
                    .and_then(JsonValue::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(name, key)| {
                                key.as_str().map(|k| (name.clone(), k.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Self::Named {
                    reference_keys,
                    dirty: false,
                }
            }
            NamingMode::Variable => Self::Variable,
            NamingMode::VariableEncrypted => match doc.get_meta(META_ENTITY_KEY) {
                Some(raw) => {
                    let wrapped: WrappedKey = serde_json::from_value(raw.clone())
                        .map_err(|e| EngineError::Envelope(format!("entity key: {e}")))?;
                    Self::VariableEncrypted {
                        key: cipher.unwrap_key(&wrapped)?,
                        dirty: false,
                    }
                }
                None => Self::VariableEncrypted {
                    key: EntityKey::generate(),
                    dirty: true,
                },
            },
        })
    }

    /// Returns the storage key of an attribute, allocating one if needed.
    pub fn storage_key_for(&mut self, name: &str, referencing: bool) -> EngineResult<String> {
        match self {
            Self::Named {
                reference_keys,
                dirty,
            } => {
                if !referencing {
                    return Ok(name.to_string());
                }
                let key = reference_keys.entry(name.to_string()).or_insert_with(|| {
                    *dirty = true;
                    random_key()
                });
                Ok(key.clone())
            }
            Self::Variable => Ok(name.to_string()),
            Self::VariableEncrypted { key, .. } => Ok(key.encrypt_name(name)?),
        }
    }

    /// Looks up the storage key of an attribute without allocating.
    pub fn existing_key_for(&self, name: &str) -> Option<String> {
        match self {
            Self::Named { reference_keys, .. } => Some(
                reference_keys
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.to_string()),
            ),
            Self::Variable => Some(name.to_string()),
            Self::VariableEncrypted { key, .. } => key.encrypt_name(name).ok(),
        }
    }

    /// Maps a storage key back to its attribute name.
    pub fn attribute_for(&self, storage_key: &str) -> Option<String> {
        match self {
            Self::Named { reference_keys, .. } => Some(
                reference_keys
                    .iter()
                    .find(|(_, key)| key.as_str() == storage_key)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_else(|| storage_key.to_string()),
            ),
            Self::Variable => Some(storage_key.to_string()),
            Self::VariableEncrypted { key, .. } => match key.decrypt_name(storage_key) {
                Ok(name) => Some(name),
                Err(e) => {
                    warn!("cannot decrypt attribute key {storage_key:?}: {e}");
                    None
                }
            },
        }
    }

    /// Takes key material not yet written to the document, as a metadata
    /// key and value.
    pub fn take_pending_meta(
        &mut self,
        cipher: &dyn EnvelopeCipher,
    ) -> EngineResult<Option<(&'static str, JsonValue)>> {
        match self {
            Self::Named {
                reference_keys,
                dirty,
            } if *dirty => {
                let map = reference_keys
                    .iter()
                    .map(|(name, key)| (name.clone(), JsonValue::String(key.clone())))
                    .collect::<serde_json::Map<_, _>>();
                *dirty = false;
                Ok(Some((META_REFERENCE_KEYS, JsonValue::Object(map))))
            }
            Self::VariableEncrypted { key, dirty } if *dirty => {
                let wrapped = cipher.wrap_key(key)?;
                let raw = serde_json::to_value(wrapped)
                    .map_err(|e| EngineError::Envelope(format!("entity key: {e}")))?;
                *dirty = false;
                Ok(Some((META_ENTITY_KEY, raw)))
            }
            _ => Ok(None),
        }
    }

    /// The named reference key map, for the record envelope.
    pub fn reference_keys(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Named { reference_keys, .. } if !reference_keys.is_empty() => {
                Some(reference_keys)
            }
            _ => None,
        }
    }
}

fn random_key() -> String {
    Soul::random().to_string()
}
