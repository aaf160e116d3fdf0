//! JSON-Patch-like edits to a step's config map.
//!
//! Paths are JSON pointers (`/headers/0/name`). Object members are upserted
//! by both `add` and `replace`, and removing a member that is already gone
//! is a no-op. An array `add` whose value already sits at the target slot
//! (the last element for `-`) is also a no-op, so replaying the same change
//! list is harmless. Intermediate containers must already exist.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApplyError;

/// A single config edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Apply `changes` in order to `config`. On error `config` is unchanged.
pub fn apply_patch(config: &Map<String, Value>, changes: &[PatchOp]) -> Result<Map<String, Value>, ApplyError> {
    let mut root = Value::Object(config.clone());
    for change in changes {
        apply_one(&mut root, change)?;
    }
    match root {
        Value::Object(map) => Ok(map),
        // Every path has at least one token, so the root is never replaced.
        _ => Ok(config.clone()),
    }
}

fn apply_one(root: &mut Value, change: &PatchOp) -> Result<(), ApplyError> {
    let path = change.path();
    let tokens = parse_pointer(path)?;
    let (last, parents) = match tokens.split_last() {
        Some(split) => split,
        None => return Err(invalid(path, "path must name a member")),
    };

    let mut target = root;
    for token in parents {
        target = match target {
            Value::Object(map) => map
                .get_mut(token.as_str())
                .ok_or_else(|| invalid(path, format!("missing container {token:?}")))?,
            Value::Array(items) => {
                let idx = parse_index(path, token, items.len())?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| invalid(path, format!("index {idx} out of range")))?
            }
            _ => return Err(invalid(path, format!("{token:?} is not a container"))),
        };
    }

    match (target, change) {
        (Value::Object(map), PatchOp::Add { value, .. } | PatchOp::Replace { value, .. }) => {
            map.insert(last.clone(), value.clone());
            Ok(())
        }
        (Value::Object(map), PatchOp::Remove { .. }) => {
            map.remove(last.as_str());
            Ok(())
        }
        (Value::Array(items), PatchOp::Add { value, .. }) => {
            if last == "-" {
                if items.last() != Some(value) {
                    items.push(value.clone());
                }
                return Ok(());
            }
            let idx = parse_index(path, last, items.len() + 1)?;
            if items.get(idx) != Some(value) {
                items.insert(idx, value.clone());
            }
            Ok(())
        }
        (Value::Array(items), PatchOp::Replace { value, .. }) => {
            let idx = parse_index(path, last, items.len())?;
            items[idx] = value.clone();
            Ok(())
        }
        (Value::Array(items), PatchOp::Remove { .. }) => {
            let idx = parse_index(path, last, usize::MAX)?;
            if idx < items.len() {
                items.remove(idx);
            }
            Ok(())
        }
        _ => Err(invalid(path, "parent is not a container")),
    }
}

/// Split a JSON pointer into unescaped reference tokens.
fn parse_pointer(path: &str) -> Result<Vec<String>, ApplyError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| invalid(path, "path must start with '/'"))?;
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Parse an array index token, requiring `idx < bound`.
fn parse_index(path: &str, token: &str, bound: usize) -> Result<usize, ApplyError> {
    let idx: usize = token
        .parse()
        .map_err(|_| invalid(path, format!("{token:?} is not an array index")))?;
    if idx >= bound {
        return Err(invalid(path, format!("index {idx} out of range")));
    }
    Ok(idx)
}

fn invalid(path: &str, reason: impl Into<String>) -> ApplyError {
    ApplyError::InvalidPatch {
        path: path.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("config must be an object"),
        }
    }

    #[test]
    fn add_replace_remove_members() {
        let base = config(json!({"url": "http://a", "retries": 1}));
        let out = apply_patch(
            &base,
            &[
                PatchOp::Replace { path: "/url".into(), value: json!("http://b") },
                PatchOp::Add { path: "/method".into(), value: json!("POST") },
                PatchOp::Remove { path: "/retries".into() },
            ],
        )
        .unwrap();
        assert_eq!(Value::Object(out), json!({"url": "http://b", "method": "POST"}));
    }

    #[test]
    fn replace_of_missing_member_upserts() {
        let out = apply_patch(&Map::new(), &[PatchOp::Replace { path: "/k".into(), value: json!(1) }]).unwrap();
        assert_eq!(out.get("k"), Some(&json!(1)));
    }

    #[test]
    fn removing_missing_member_is_noop() {
        let base = config(json!({"a": 1}));
        let out = apply_patch(&base, &[PatchOp::Remove { path: "/gone".into() }]).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn nested_and_array_paths() {
        let base = config(json!({"headers": [{"name": "a"}], "auth": {"kind": "none"}}));
        let out = apply_patch(
            &base,
            &[
                PatchOp::Add { path: "/headers/-".into(), value: json!({"name": "b"}) },
                PatchOp::Replace { path: "/headers/0/name".into(), value: json!("x") },
                PatchOp::Add { path: "/auth/token".into(), value: json!("t") },
            ],
        )
        .unwrap();
        assert_eq!(
            Value::Object(out),
            json!({"headers": [{"name": "x"}, {"name": "b"}], "auth": {"kind": "none", "token": "t"}})
        );
    }

    #[test]
    fn replayed_array_add_is_a_noop() {
        let base = config(json!({"headers": ["a"]}));
        let changes = [
            PatchOp::Add { path: "/headers/-".into(), value: json!("x") },
            PatchOp::Add { path: "/headers/0".into(), value: json!("first") },
        ];
        let once = apply_patch(&base, &changes).unwrap();
        let twice = apply_patch(&once, &changes).unwrap();
        assert_eq!(Value::Object(once.clone()), json!({"headers": ["first", "a", "x"]}));
        assert_eq!(once, twice);
    }

    #[test]
    fn escaped_tokens() {
        let out = apply_patch(&Map::new(), &[PatchOp::Add { path: "/a~1b~0c".into(), value: json!(true) }]).unwrap();
        assert_eq!(out.get("a/b~c"), Some(&json!(true)));
    }

    #[test]
    fn missing_intermediate_container_fails_without_partial_change() {
        let base = config(json!({"a": 1}));
        let err = apply_patch(
            &base,
            &[
                PatchOp::Add { path: "/b".into(), value: json!(2) },
                PatchOp::Add { path: "/missing/c".into(), value: json!(3) },
            ],
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_patch");
        assert_eq!(base, config(json!({"a": 1})));
    }

    #[test]
    fn out_of_range_index_fails() {
        let base = config(json!({"list": [1]}));
        let err = apply_patch(&base, &[PatchOp::Replace { path: "/list/5".into(), value: json!(0) }]).unwrap_err();
        assert!(matches!(err, ApplyError::InvalidPatch { .. }));
    }

    #[test]
    fn op_tag_is_lowercase_on_the_wire() {
        let op: PatchOp = serde_json::from_value(json!({"op": "remove", "path": "/x"})).unwrap();
        assert_eq!(op, PatchOp::Remove { path: "/x".into() });
    }
}
