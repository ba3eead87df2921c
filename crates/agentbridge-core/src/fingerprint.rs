//! Content fingerprints for artifact deduplication.
//!
//! JSON content is hashed over a canonical serialization (keys sorted at every
//! level) so that formatting and key order never produce a second fingerprint
//! for the same artifact.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint of a JSON value in canonical form.
pub fn fingerprint_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    // Serializing a Value cannot fail: keys are always strings.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    fingerprint_bytes(&bytes)
}

/// Fingerprint of file content: canonical JSON when it parses, raw bytes otherwise.
pub fn fingerprint_content(bytes: &[u8]) -> String {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => fingerprint_value(&value),
        Err(_) => fingerprint_bytes(bytes),
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
