//! Canonical JSON encoder for content hashing.
//!
//! Canonical rules:
//! - object keys sorted by UTF-8 byte order, recursively
//! - no insignificant whitespace
//! - arrays keep their order
//! - absent optionals are omitted by the value's own serde attributes
//! - only integral numbers; floats have no stable cross-platform rendering

use crate::types::LoomError;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serialize a value to its canonical JSON string.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, LoomError> {
    let value =
        serde_json::to_value(value).map_err(|e| LoomError::SerializationError(e.to_string()))?;
    ensure_integral(&value)?;
    serde_json::to_string(&canon_value(value))
        .map_err(|e| LoomError::SerializationError(e.to_string()))
}

fn ensure_integral(value: &Value) -> Result<(), LoomError> {
    match value {
        Value::Number(n) if n.is_f64() => Err(LoomError::Validation(format!(
            "non-integral number {} cannot be canonicalized",
            n
        ))),
        Value::Array(values) => values.iter().try_for_each(ensure_integral),
        Value::Object(map) => map.values().try_for_each(ensure_integral),
        _ => Ok(()),
    }
}

fn canon_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut canon = Map::new();
            for (key, value) in entries {
                canon.insert(key, canon_value(value));
            }
            Value::Object(canon)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canon_value).collect()),
        other => other,
    }
}
