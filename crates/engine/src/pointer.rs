//! Nested-value access, binding path parsing and result-delta merging.

use lattice_events::DeltaOperation;
use serde_json::{Map, Value};

use crate::model::BindingRoot;

/// Escape a path segment for a JSON pointer.
#[must_use]
pub fn encode_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn decode_pointer_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Parse a binding path into its root and remaining segments.
///
/// Accepts JSON-pointer form (`/results/value`) and dotted form
/// (`results.value`, with `[index]` treated as a segment). The root must be
/// `parameters` or `results`.
#[must_use]
pub fn parse_binding_path(path: &str) -> Option<(BindingRoot, Vec<String>)> {
    if path.is_empty() {
        return None;
    }
    let segments: Vec<String> = if let Some(rest) = path.strip_prefix('/') {
        rest.split('/')
            .filter(|segment| !segment.is_empty())
            .map(decode_pointer_segment)
            .collect()
    } else {
        path.replace('[', ".")
            .replace(']', "")
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect()
    };
    let (root, rest) = segments.split_first()?;
    let root = match root.as_str() {
        "parameters" => BindingRoot::Parameters,
        "results" => BindingRoot::Results,
        _ => return None,
    };
    Some((root, rest.to_vec()))
}

/// Read a nested value, cloning it out of the container.
///
/// An empty path yields the whole container.
#[must_use]
pub fn get_nested(container: &Map<String, Value>, path: &[String]) -> Option<Value> {
    let Some((last, parents)) = path.split_last() else {
        return Some(Value::Object(container.clone()));
    };
    let mut current = container;
    for key in parents {
        current = current.get(key)?.as_object()?;
    }
    current.get(last).cloned()
}

/// Write a nested value, creating intermediate objects as needed.
///
/// An empty path replaces the container's contents and requires an object
/// value; anything else is refused.
pub fn set_nested(container: &mut Map<String, Value>, path: &[String], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        let Value::Object(object) = value else {
            return false;
        };
        container.clear();
        container.extend(object);
        return true;
    };
    let mut current = container;
    for key in parents {
        let entry = current
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().unwrap_or_else(|| unreachable!());
    }
    current.insert(last.clone(), value);
    true
}

/// One JSON-pointer mutation produced by a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultDelta {
    /// JSON pointer of the mutation.
    pub path: String,
    /// New value (`Null` for removals).
    pub value: Value,
    /// Mutation kind.
    pub operation: DeltaOperation,
}

/// Deep-merge `updates` into `target`, returning per-path deltas.
///
/// `null` removes a key; nested objects merge recursively; everything else
/// replaces when the value actually changed.
pub fn merge_result_updates(
    target: &mut Map<String, Value>,
    updates: &Map<String, Value>,
) -> Vec<ResultDelta> {
    merge_at(target, updates, "")
}

fn merge_at(
    target: &mut Map<String, Value>,
    updates: &Map<String, Value>,
    path_prefix: &str,
) -> Vec<ResultDelta> {
    let mut deltas = Vec::new();
    for (key, value) in updates {
        let pointer = format!("{path_prefix}/{}", encode_pointer_segment(key));
        match value {
            Value::Null => {
                if target.remove(key).is_some() {
                    deltas.push(ResultDelta {
                        path: pointer,
                        value: Value::Null,
                        operation: DeltaOperation::Remove,
                    });
                }
            }
            Value::Object(updates_object) if !updates_object.is_empty() => {
                if let Some(Value::Object(existing)) = target.get_mut(key) {
                    deltas.extend(merge_at(existing, updates_object, &pointer));
                    continue;
                }
                let new_value = Value::Object(updates_object.clone());
                if target.get(key) != Some(&new_value) {
                    target.insert(key.clone(), new_value.clone());
                    deltas.push(ResultDelta {
                        path: pointer,
                        value: new_value,
                        operation: DeltaOperation::Replace,
                    });
                }
            }
            Value::Object(_) => {
                // Empty object replaces unless it already is one.
                if target.get(key) != Some(value) {
                    target.insert(key.clone(), value.clone());
                    deltas.push(ResultDelta {
                        path: pointer,
                        value: value.clone(),
                        operation: DeltaOperation::Replace,
                    });
                }
            }
            other => {
                if target.get(key) != Some(other) {
                    target.insert(key.clone(), other.clone());
                    deltas.push(ResultDelta {
                        path: pointer,
                        value: other.clone(),
                        operation: DeltaOperation::Replace,
                    });
                }
            }
        }
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parse_pointer_form() {
        let (root, path) = parse_binding_path("/results/outer/inner").unwrap();
        assert_eq!(root, BindingRoot::Results);
        assert_eq!(path, vec!["outer", "inner"]);
    }

    #[test]
    fn parse_dotted_form_with_index() {
        let (root, path) = parse_binding_path("parameters.items[0].name").unwrap();
        assert_eq!(root, BindingRoot::Parameters);
        assert_eq!(path, vec!["items", "0", "name"]);
    }

    #[test]
    fn parse_rejects_unknown_root() {
        assert!(parse_binding_path("/metadata/x").is_none());
        assert!(parse_binding_path("").is_none());
    }

    #[test]
    fn pointer_escapes_roundtrip() {
        let (_, path) = parse_binding_path("/results/a~1b~0c").unwrap();
        assert_eq!(path, vec!["a/b~c"]);
        assert_eq!(encode_pointer_segment("a/b~c"), "a~1b~0c");
    }

    #[test]
    fn get_nested_empty_path_returns_container() {
        let container = map(serde_json::json!({"a": 1}));
        assert_eq!(
            get_nested(&container, &[]),
            Some(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn get_nested_walks_objects() {
        let container = map(serde_json::json!({"a": {"b": {"c": 7}}}));
        assert_eq!(
            get_nested(&container, &["a".into(), "b".into(), "c".into()]),
            Some(serde_json::json!(7))
        );
        assert_eq!(get_nested(&container, &["a".into(), "x".into()]), None);
    }

    #[test]
    fn set_nested_creates_intermediates() {
        let mut container = Map::new();
        assert!(set_nested(
            &mut container,
            &["a".into(), "b".into()],
            serde_json::json!(1)
        ));
        assert_eq!(Value::Object(container), serde_json::json!({"a": {"b": 1}}));
    }

    #[test]
    fn set_nested_empty_path_requires_object() {
        let mut container = map(serde_json::json!({"old": true}));
        assert!(set_nested(&mut container, &[], serde_json::json!({"new": 1})));
        assert_eq!(Value::Object(container.clone()), serde_json::json!({"new": 1}));
        assert!(!set_nested(&mut container, &[], serde_json::json!(5)));
    }

    #[test]
    fn merge_emits_replace_and_remove_deltas() {
        let mut target = map(serde_json::json!({"keep": 1, "drop": 2, "nested": {"a": 1}}));
        let updates = map(serde_json::json!({"drop": null, "nested": {"a": 2, "b": 3}}));
        let mut deltas = merge_result_updates(&mut target, &updates);
        deltas.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            Value::Object(target),
            serde_json::json!({"keep": 1, "nested": {"a": 2, "b": 3}})
        );
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].path, "/drop");
        assert_eq!(deltas[0].operation, DeltaOperation::Remove);
        assert_eq!(deltas[1].path, "/nested/a");
        assert_eq!(deltas[1].value, serde_json::json!(2));
        assert_eq!(deltas[2].path, "/nested/b");
    }

    #[test]
    fn merge_is_idempotent() {
        let mut target = map(serde_json::json!({"a": {"b": 1}}));
        let updates = map(serde_json::json!({"a": {"b": 1}}));
        let deltas = merge_result_updates(&mut target, &updates);
        assert!(deltas.is_empty());
    }

    #[test]
    fn merge_scalar_over_object_replaces() {
        let mut target = map(serde_json::json!({"a": {"b": 1}}));
        let updates = map(serde_json::json!({"a": "text"}));
        let deltas = merge_result_updates(&mut target, &updates);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].value, serde_json::json!("text"));
    }
}
