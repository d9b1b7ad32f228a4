//! Canonical spec hashing shared across the write path and the scheduler.
//!
//! The single source of truth for change detection: the hash is computed
//! over a canonicalized serialization (object keys sorted recursively) so
//! that map-order differences never bump a resource's generation.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical form of a spec document.
pub fn spec_hash(spec: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(spec, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string rendering handles escaping
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_hash() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"x": true, "y": [1, 2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"y": [1, 2], "x": true}, "a": 1}"#).unwrap();
        assert_eq!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn value_changes_change_the_hash() {
        let a = json!({"replicas": 3});
        let b = json!({"replicas": 4});
        assert_ne!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"items": [1, 2]});
        let b = json!({"items": [2, 1]});
        assert_ne!(spec_hash(&a), spec_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = spec_hash(&json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
