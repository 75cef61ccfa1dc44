//! Wire encoding of attribute values.
//!
//! Values are stored in the mirror document as JSON. Booleans, finite numbers
//! and plain text map to their JSON counterparts; every other simple value is
//! a *tagged string*: [`SENTINEL`], a type tag, `|`, then the tag's fields.
//!
//! | Tag | Value | Fields |
//! |-----|-------|--------|
//! | `D` | date | milliseconds since the Unix epoch |
//! | `R` | regex | `flags|source` |
//! | `A` | list | JSON array of wire values |
//! | `O` | map | JSON object of wire values |
//! | `E` | error | `name|message` |
//! | `C` | class marker | origin |
//! | `B` | binary | standard base64 |
//! | `N` | non-finite number | `NaN`, `inf` or `-inf` |
//! | `S` | text that itself starts with the sentinel | the text |
//!
//! A reference to another entity is the JSON object `{"s": soul, "o": origin}`
//! (`o` is optional). JSON `null` is a deleted value.

use crate::error::{ModelError, ModelResult};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use soulstore_types::{Soul, Value};
use std::collections::BTreeMap;

/// Prefix of every tagged wire string.
pub const SENTINEL: &str = "\u{1F}~";

const REF_SOUL: &str = "s";
const REF_ORIGIN: &str = "o";

/// How the engine may store a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    /// Always inlined.
    Simple,
    /// May be stored as a separate graph node and referenced.
    Referenceable,
    /// Lives only in the local copy.
    NotSerializable,
}

/// Classifies a value.
pub fn classify(value: &Value) -> ValueClass {
    match value {
        Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::Text(_)
        | Value::Date(_)
        | Value::Regex { .. }
        | Value::Binary(_)
        | Value::Error { .. }
        | Value::Class(_) => ValueClass::Simple,
        Value::List(_) | Value::Map(_) | Value::Entity(_) => ValueClass::Referenceable,
        Value::Handle(_) => ValueClass::NotSerializable,
    }
}

/// True for values that are always inlined, never referenced.
pub fn classify_simple(value: &Value) -> bool {
    classify(value) == ValueClass::Simple
}

/// True for values that may become a separate graph node.
pub fn can_reference(value: &Value) -> bool {
    classify(value) == ValueClass::Referenceable
}

/// Encodes a value into its wire form.
///
/// Entity values become references without an origin; use [`reference`]
/// when the origin is known.
pub fn serialize(value: &Value) -> ModelResult<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) if n.is_finite() => json!(n),
        Value::Number(n) => tagged('N', non_finite_label(*n)),
        Value::Text(s) if s.starts_with(SENTINEL) => tagged('S', s),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Date(d) => tagged('D', &d.timestamp_millis().to_string()),
        Value::Regex { source, flags } => {
            if flags.contains('|') {
                return Err(ModelError::Malformed(format!("regex flags {flags:?}")));
            }
            tagged('R', &format!("{flags}|{source}"))
        }
        Value::Binary(bytes) => tagged('B', &STANDARD.encode(bytes)),
        Value::Error { name, message } => {
            if name.contains('|') {
                return Err(ModelError::Malformed(format!("error name {name:?}")));
            }
            tagged('E', &format!("{name}|{message}"))
        }
        Value::Class(origin) => tagged('C', origin),
        Value::List(items) => {
            let wire = items.iter().map(serialize).collect::<ModelResult<Vec<_>>>()?;
            tagged('A', &serde_json::to_string(&wire)?)
        }
        Value::Map(map) => {
            let mut wire = JsonMap::new();
            for (key, item) in map {
                wire.insert(key.clone(), serialize(item)?);
            }
            tagged('O', &serde_json::to_string(&wire)?)
        }
        Value::Entity(soul) => reference(soul, None),
        Value::Handle(_) => return Err(ModelError::NotSerializable("handle")),
    })
}

/// Decodes a wire value.
pub fn deserialize(wire: &JsonValue) -> ModelResult<Value> {
    match wire {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(Value::Number)
            .ok_or_else(|| ModelError::Malformed(n.to_string())),
        JsonValue::String(s) => match s.strip_prefix(SENTINEL) {
            Some(tagged) => decode_tagged(tagged),
            None => Ok(Value::Text(s.clone())),
        },
        JsonValue::Object(_) => match as_reference(wire) {
            Some((soul, _)) => Ok(Value::Entity(soul)),
            None => Err(ModelError::Malformed(wire.to_string())),
        },
        JsonValue::Array(items) => Ok(Value::List(
            items.iter().map(deserialize).collect::<ModelResult<_>>()?,
        )),
    }
}

/// Builds the wire form of a reference to another entity.
pub fn reference(soul: &Soul, origin: Option<&str>) -> JsonValue {
    let mut map = JsonMap::new();
    map.insert(REF_SOUL.to_string(), JsonValue::String(soul.to_string()));
    if let Some(origin) = origin {
        map.insert(REF_ORIGIN.to_string(), JsonValue::String(origin.to_string()));
    }
    JsonValue::Object(map)
}

/// Reads a reference, returning the soul and the origin if recorded.
pub fn as_reference(wire: &JsonValue) -> Option<(Soul, Option<String>)> {
    let map = wire.as_object()?;
    let soul = map.get(REF_SOUL)?.as_str().filter(|s| !s.trim().is_empty())?;
    let origin = map
        .get(REF_ORIGIN)
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    Some((Soul::from(soul), origin))
}

fn tagged(tag: char, payload: &str) -> JsonValue {
    JsonValue::String(format!("{SENTINEL}{tag}|{payload}"))
}

fn non_finite_label(n: f64) -> &'static str {
    if n.is_nan() {
        "NaN"
    } else if n > 0.0 {
        "inf"
    } else {
        "-inf"
    }
}

fn decode_tagged(tagged: &str) -> ModelResult<Value> {
    let (tag, payload) = tagged
        .split_once('|')
        .ok_or_else(|| ModelError::Malformed(tagged.to_string()))?;
    match tag {
        "D" => {
            let millis: i64 = payload
                .parse()
                .map_err(|_| ModelError::Malformed(format!("date {payload:?}")))?;
            DateTime::<Utc>::from_timestamp_millis(millis)
                .map(Value::Date)
                .ok_or_else(|| ModelError::Malformed(format!("date {payload:?}")))
        }
        "R" => {
            let (flags, source) = payload
                .split_once('|')
                .ok_or_else(|| ModelError::Malformed(format!("regex {payload:?}")))?;
            Ok(Value::Regex {
                source: source.to_string(),
                flags: flags.to_string(),
            })
        }
        "E" => {
            let (name, message) = payload
                .split_once('|')
                .ok_or_else(|| ModelError::Malformed(format!("error {payload:?}")))?;
            Ok(Value::Error {
                name: name.to_string(),
                message: message.to_string(),
            })
        }
        "C" => Ok(Value::Class(payload.to_string())),
        "B" => STANDARD
            .decode(payload)
            .map(Value::Binary)
            .map_err(|e| ModelError::Malformed(format!("binary: {e}"))),
        "N" => match payload {
            "NaN" => Ok(Value::Number(f64::NAN)),
            "inf" => Ok(Value::Number(f64::INFINITY)),
            "-inf" => Ok(Value::Number(f64::NEG_INFINITY)),
            other => Err(ModelError::Malformed(format!("number {other:?}"))),
        },
        "S" => Ok(Value::Text(payload.to_string())),
        "A" => {
            let items: Vec<JsonValue> = serde_json::from_str(payload)?;
            Ok(Value::List(
                items.iter().map(deserialize).collect::<ModelResult<_>>()?,
            ))
        }
        "O" => {
            let items: JsonMap<String, JsonValue> = serde_json::from_str(payload)?;
            let mut map = BTreeMap::new();
            for (key, item) in &items {
                map.insert(key.clone(), deserialize(item)?);
            }
            Ok(Value::Map(map))
        }
        other => Err(ModelError::UnknownTag(other.to_string())),
    }
}
