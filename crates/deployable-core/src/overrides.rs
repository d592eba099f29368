//! Override engine: applies per-cluster patches to a decoded template.
//!
//! Each [`ClusterOverride`](crate::model::ClusterOverride) is `{path,
//! value}` where `path` is a dot path into the decoded template. Applying an
//! override navigates the path, creating missing intermediate objects, and
//! replaces the subtree at the final segment with `value`. Array-index
//! paths are rejected outright rather than silently doing something
//! array-shaped.

use serde_json::{Map, Value};

use crate::{
    error::{MalformedOverrideSnafu, OverridePathUnsupportedSnafu},
    model::{ClusterName, ClusterOverride},
    Error, Result,
};

/// Applies every override patch for one cluster to a decoded template,
/// in order, and returns the resulting tree. Does not re-encode to bytes --
/// callers canonicalize via `serde_json::to_vec`/`to_string` as needed.
pub fn apply_overrides(
    template: &Value,
    cluster: &ClusterName,
    patches: &[ClusterOverride],
) -> Result<Value> {
    let mut tree = template.clone();
    for patch in patches {
        apply_one(&mut tree, cluster, patch)?;
    }
    Ok(tree)
}

fn apply_one(tree: &mut Value, cluster: &ClusterName, patch: &ClusterOverride) -> Result<()> {
    let segments: Vec<&str> = patch.path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return MalformedOverrideSnafu {
            cluster: cluster.clone(),
            path: patch.path.clone(),
            reason: "path must not be empty".to_string(),
        }
        .fail();
    }

    if tree.is_null() {
        *tree = Value::Object(Map::new());
    }

    let mut cursor = tree;
    for segment in &segments[..segments.len() - 1] {
        reject_array_index(segment, cluster, &patch.path)?;

        let object = cursor.as_object_mut().ok_or_else(|| Error::MalformedOverride {
            cluster: cluster.clone(),
            path: patch.path.clone(),
            reason: format!("cannot descend into non-object at {segment:?}"),
        })?;

        cursor = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        if !cursor.is_object() {
            if cursor.is_null() {
                *cursor = Value::Object(Map::new());
            } else {
                return Err(Error::MalformedOverride {
                    cluster: cluster.clone(),
                    path: patch.path.clone(),
                    reason: format!("{segment:?} is not an object"),
                });
            }
        }
    }

    let last = segments[segments.len() - 1];
    reject_array_index(last, cluster, &patch.path)?;

    let object = cursor.as_object_mut().ok_or_else(|| Error::MalformedOverride {
        cluster: cluster.clone(),
        path: patch.path.clone(),
        reason: "cannot set a field on a non-object".to_string(),
    })?;
    object.insert(last.to_string(), patch.value.clone());
    Ok(())
}

/// A bare integer segment (`"0"`, `"12"`) reads as an array index, which is
/// left undefined, so it's rejected rather than guessed at.
fn reject_array_index(segment: &str, cluster: &ClusterName, path: &str) -> Result<()> {
    if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
        return OverridePathUnsupportedSnafu {
            cluster: cluster.clone(),
            path: path.to_string(),
        }
        .fail();
    }
    Ok(())
}
