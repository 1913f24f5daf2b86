//! Deterministic request fingerprints.
//!
//! Two requests that mean the same thing must hash the same, so the body is
//! canonicalized before hashing: map keys sorted, whole-valued floats
//! collapsed to integers, and volatile fields (timestamps, generated ids)
//! stripped at every depth. Only the fingerprint is ever stored — never the
//! raw request.

use blake2::{Blake2s256, Digest};
use serde_json::{Map, Number, Value};

/// Fields excluded from the fingerprint at every nesting depth.
pub const VOLATILE_FIELDS: &[&str] = &["timestamp", "requestId", "traceId", "nonce"];

/// Canonicalize a JSON value: sorted keys, normalized numbers, volatile
/// fields removed.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json maps iterate in sorted key order (BTreeMap-backed),
            // so rebuilding the object is enough to canonicalize ordering.
            let mut canonical = Map::new();
            for (key, child) in map {
                if VOLATILE_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                canonical.insert(key.clone(), canonicalize(child));
            }
            Value::Object(canonical)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && n.as_u64().is_none() && f.fract() == 0.0 {
            let whole = f as i64;
            if whole as f64 == f {
                return Number::from(whole);
            }
        }
    }
    n.clone()
}

/// Hash a canonicalized request body to a stable hex fingerprint.
pub fn fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value);
    let serialized =
        serde_json::to_vec(&canonical).unwrap_or_else(|_| canonical.to_string().into_bytes());
    let mut hasher = Blake2s256::new();
    hasher.update(&serialized);
    hex::encode(hasher.finalize())
}
