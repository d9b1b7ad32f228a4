//! JSON Patch application for mutating webhooks.
//!
//! Supports `add`, `replace`, and `remove`. Paths may target the spec
//! absolutely (`/spec/x`) or relatively (`/x` or `x`); the bare forms are
//! kept for compatibility with existing webhooks but log a deprecation
//! warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// A single patch operation as returned by a webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatchError {
    #[error("invalid patch path: {0}")]
    InvalidPath(String),

    #[error("patch path not found: {0}")]
    PathNotFound(String),

    #[error("unsupported patch operation: {0}")]
    UnsupportedOp(String),

    #[error("patch '{op}' requires a value")]
    MissingValue { op: String },
}

/// Apply patches to a spec document in order, returning the patched copy.
/// The first failing operation aborts the whole set.
pub fn apply_patches(spec: &Value, patches: &[PatchOp]) -> Result<Value, PatchError> {
    let mut result = spec.clone();
    for patch in patches {
        apply_one(&mut result, patch)?;
    }
    Ok(result)
}

fn apply_one(spec: &mut Value, patch: &PatchOp) -> Result<(), PatchError> {
    let segments = split_path(&patch.path)?;
    match patch.op.as_str() {
        "add" | "replace" => {
            let value = patch
                .value
                .clone()
                .ok_or_else(|| PatchError::MissingValue {
                    op: patch.op.clone(),
                })?;
            let target = navigate(spec, &segments[..segments.len() - 1], &patch.path)?;
            let map = target
                .as_object_mut()
                .ok_or_else(|| PatchError::PathNotFound(patch.path.clone()))?;
            map.insert(segments[segments.len() - 1].clone(), value);
        }
        "remove" => {
            let target = navigate(spec, &segments[..segments.len() - 1], &patch.path)?;
            let map = target
                .as_object_mut()
                .ok_or_else(|| PatchError::PathNotFound(patch.path.clone()))?;
            if map.remove(&segments[segments.len() - 1]).is_none() {
                return Err(PatchError::PathNotFound(patch.path.clone()));
            }
        }
        other => return Err(PatchError::UnsupportedOp(other.to_string())),
    }
    Ok(())
}

/// Normalize a patch path to spec-relative segments.
///
/// `/spec/a/b` and `/a/b` (and `a/b`) all address `a.b` within the spec.
fn split_path(path: &str) -> Result<Vec<String>, PatchError> {
    let relative = if let Some(stripped) = path.strip_prefix("/spec/") {
        stripped
    } else {
        warn!(
            path,
            "Patch path without /spec/ prefix is deprecated; treating as spec-relative"
        );
        path.strip_prefix('/').unwrap_or(path)
    };

    let segments: Vec<String> = relative
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Err(PatchError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

/// Walk intermediate segments; every hop must already exist.
fn navigate<'a>(
    spec: &'a mut Value,
    segments: &[String],
    full_path: &str,
) -> Result<&'a mut Value, PatchError> {
    let mut current = spec;
    for segment in segments {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(segment))
            .ok_or_else(|| PatchError::PathNotFound(full_path.to_string()))?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(path: &str, value: Value) -> PatchOp {
        PatchOp {
            op: "add".to_string(),
            path: path.to_string(),
            value: Some(value),
        }
    }

    #[test]
    fn add_and_replace_set_values() {
        let spec = json!({"a": 1, "nested": {"x": true}});
        let patched = apply_patches(
            &spec,
            &[
                add("/spec/b", json!(2)),
                PatchOp {
                    op: "replace".to_string(),
                    path: "/spec/a".to_string(),
                    value: Some(json!(9)),
                },
                add("/spec/nested/y", json!("z")),
            ],
        )
        .unwrap();
        assert_eq!(patched, json!({"a": 9, "b": 2, "nested": {"x": true, "y": "z"}}));
    }

    #[test]
    fn spec_prefixed_and_bare_paths_are_equivalent() {
        let spec = json!({"a": 1});
        let with_prefix = apply_patches(&spec, &[add("/spec/b", json!(2))]).unwrap();
        let bare_slash = apply_patches(&spec, &[add("/b", json!(2))]).unwrap();
        let bare = apply_patches(&spec, &[add("b", json!(2))]).unwrap();
        assert_eq!(with_prefix, bare_slash);
        assert_eq!(with_prefix, bare);
    }

    #[test]
    fn remove_deletes_existing_keys_only() {
        let spec = json!({"a": 1, "b": 2});
        let removed = apply_patches(
            &spec,
            &[PatchOp {
                op: "remove".to_string(),
                path: "/spec/b".to_string(),
                value: None,
            }],
        )
        .unwrap();
        assert_eq!(removed, json!({"a": 1}));

        let err = apply_patches(
            &spec,
            &[PatchOp {
                op: "remove".to_string(),
                path: "/spec/missing".to_string(),
                value: None,
            }],
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));
    }

    #[test]
    fn intermediate_segments_must_exist() {
        let spec = json!({"a": 1});
        let err = apply_patches(&spec, &[add("/spec/no/such/parent", json!(1))]).unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound(_)));
    }

    #[test]
    fn unsupported_op_and_empty_path_are_rejected() {
        let spec = json!({"a": 1});
        let err = apply_patches(
            &spec,
            &[PatchOp {
                op: "move".to_string(),
                path: "/spec/a".to_string(),
                value: None,
            }],
        )
        .unwrap_err();
        assert_eq!(err, PatchError::UnsupportedOp("move".to_string()));

        let err = apply_patches(&spec, &[add("/spec/", json!(1))]).unwrap_err();
        assert!(matches!(err, PatchError::InvalidPath(_)));
    }

    #[test]
    fn failed_op_leaves_input_untouched() {
        let spec = json!({"a": 1});
        let _ = apply_patches(&spec, &[add("/spec/b", json!(2)), add("/spec/c/d", json!(3))])
            .unwrap_err();
        assert_eq!(spec, json!({"a": 1}));
    }
}
