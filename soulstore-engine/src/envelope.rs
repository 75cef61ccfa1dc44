//! Persisted record envelope.
//!
//! A stored record is the configured marker followed by JSON
//! `{"v": version, "s": salt, "c": content}`. `c` is the entry object itself
//! when the cipher does not encrypt, or the base64 of the sealed entry JSON
//! when it does.
//!
//! The entry carries a readable projection of the mirror document (`e`
//! attribute wire values by storage key, `m` origin and key material, `x`
//! tombstone flag) plus `d`, the saved document itself, which is what a
//! restore loads.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use soulstore_crdt::Document;
use soulstore_crypto::{EnvelopeCipher, WrappedKey};
use soulstore_types::Soul;
use std::collections::BTreeMap;

/// Metadata projection of a record entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Origin (schema) of the entity.
    pub o: String,
    /// Named-mode reference keys by attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<BTreeMap<String, String>>,
    /// Wrapped per-entity key in variable-encrypted mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<WrappedKey>,
}

/// The plaintext content of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    /// Live attribute wire values by storage key.
    pub e: BTreeMap<String, JsonValue>,
    pub m: EntryMeta,
    /// Present and true in the record of a deleted entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<bool>,
    /// Base64 of the saved mirror document.
    pub d: String,
}

impl RecordEntry {
    /// Loads the mirror document carried by the entry.
    pub fn document(&self) -> EngineResult<Document> {
        let bytes = STANDARD
            .decode(&self.d)
            .map_err(|e| EngineError::Envelope(format!("document payload: {e}")))?;
        Ok(Document::load(&bytes)?)
    }

    pub fn is_tombstone(&self) -> bool {
        self.x == Some(true)
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub version: u32,
    pub salt: String,
    pub entry: RecordEntry,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    s: String,
    c: JsonValue,
}

/// Builds the entry for a document.
pub(crate) fn build_entry(
    doc: &Document,
    origin: &str,
    reference_keys: Option<&BTreeMap<String, String>>,
    entity_key: Option<WrappedKey>,
    deleted: bool,
) -> EngineResult<RecordEntry> {
    let e = doc
        .live_entries()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect();
    Ok(RecordEntry {
        e,
        m: EntryMeta {
            o: origin.to_string(),
            r: reference_keys.cloned(),
            k: entity_key,
        },
        x: deleted.then_some(true),
        d: STANDARD.encode(doc.save()?),
    })
}

/// Serializes and (if the cipher encrypts) seals an entry.
pub fn seal_record(
    config: &EngineConfig,
    cipher: &dyn EnvelopeCipher,
    soul: &Soul,
    salt: &str,
    entry: &RecordEntry,
) -> EngineResult<Vec<u8>> {
    let plain =
        serde_json::to_value(entry).map_err(|e| EngineError::Envelope(e.to_string()))?;
    let c = if cipher.is_encrypting() {
        let bytes = serde_json::to_vec(&plain).map_err(|e| EngineError::Envelope(e.to_string()))?;
        JsonValue::String(STANDARD.encode(cipher.encrypt(soul.as_str(), &bytes)?))
    } else {
        plain
    };
    let envelope = Envelope {
        v: config.persister_version,
        s: salt.to_string(),
        c,
    };
    let json = serde_json::to_string(&envelope).map_err(|e| EngineError::Envelope(e.to_string()))?;
    Ok(format!("{}{json}", config.record_marker).into_bytes())
}

/// Decodes (and if needed decrypts) a stored record.
pub fn open_record(
    config: &EngineConfig,
    cipher: &dyn EnvelopeCipher,
    soul: &Soul,
    bytes: &[u8],
) -> EngineResult<StoredRecord> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EngineError::Envelope(format!("record is not text: {e}")))?;
    let json = text.strip_prefix(config.record_marker.as_str()).ok_or_else(|| {
        EngineError::Envelope(format!("record for {soul} lacks the marker"))
    })?;
    let envelope: Envelope =
        serde_json::from_str(json).map_err(|e| EngineError::Envelope(e.to_string()))?;
    let entry = match envelope.c {
        JsonValue::String(sealed) => {
            let sealed = STANDARD
                .decode(sealed)
                .map_err(|e| EngineError::Envelope(format!("sealed payload: {e}")))?;
            let plain = cipher.decrypt(soul.as_str(), &sealed)?;
            serde_json::from_slice(&plain).map_err(|e| EngineError::Envelope(e.to_string()))?
        }
        plain @ JsonValue::Object(_) => {
            serde_json::from_value(plain).map_err(|e| EngineError::Envelope(e.to_string()))?
        }
        other => {
            return Err(EngineError::Envelope(format!(
                "unexpected content type {}",
                json_kind(&other)
            )));
        }
    };
    Ok(StoredRecord {
        version: envelope.v,
        salt: envelope.s,
        entry,
    })
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
