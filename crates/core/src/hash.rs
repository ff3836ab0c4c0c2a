//! Canonical JSON serialization and definition hashing.
//!
//! Workflow definitions are hashed over a canonical rendering: object keys
//! sorted, no whitespace. Identifier stringification happens at the model
//! layer, so two submissions that differ only in UUID-vs-string encoding
//! hash identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::workflow::WorkflowDefinition;

/// Render a JSON value canonically: sorted object keys, compact separators.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                // Scalar serialization always succeeds for strings.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).unwrap_or_default()),
    }
}

/// SHA-256 of the canonical JSON rendering of a workflow definition.
#[must_use]
pub fn definition_hash(workflow: &WorkflowDefinition) -> String {
    let value = serde_json::to_value(workflow).unwrap_or(Value::Null);
    let canonical = canonical_json(&value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_sorts_keys_recursively() {
        let value = serde_json::json!({"b": {"z": 1, "a": [true, null]}, "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":{"a":[true,null],"z":1}}"#);
    }

    #[test]
    fn canonical_escapes_strings() {
        let value = serde_json::json!({"k": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"k":"line\nbreak"}"#);
    }

    #[test]
    fn hash_is_deterministic_across_key_order() {
        let a: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "nodes": [{"id": "n", "type": "t"}],
            "metadata": {"x": 1, "y": 2}
        }))
        .unwrap();
        let b: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "metadata": {"y": 2, "x": 1},
            "nodes": [{"type": "t", "id": "n"}],
            "id": "wf"
        }))
        .unwrap();
        assert_eq!(definition_hash(&a), definition_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a: WorkflowDefinition =
            serde_json::from_value(serde_json::json!({"id": "wf-1"})).unwrap();
        let b: WorkflowDefinition =
            serde_json::from_value(serde_json::json!({"id": "wf-2"})).unwrap();
        assert_ne!(definition_hash(&a), definition_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let wf: WorkflowDefinition =
            serde_json::from_value(serde_json::json!({"id": "wf"})).unwrap();
        let hash = definition_hash(&wf);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
