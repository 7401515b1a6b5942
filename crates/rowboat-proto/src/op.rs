//! Field-level patches and the helpers that apply and invert them.
//!
//! A submitted operation is a list of patches. Each patch addresses a value
//! by path and carries both the new and the replaced value, so any applied
//! operation can be undone by applying its inverses in reverse order. That
//! property is what makes optimistic local apply safe: a rejected submission
//! is rolled back with the previous values the patch itself carried.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// One step of a patch path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A single field-level change. Closed set: every application site matches
/// exhaustively instead of probing which optional key happens to be present.
///
/// The wire shape keeps the json0-style keys (`p`, `oi`, `od`, `na`) so the
/// frames stay readable next to existing OT tooling. The untagged variants
/// are unambiguous: `Insert` requires `oi`, `Delete` carries only `od`, and
/// `Increment` requires `na`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Patch {
    /// Set the value at `path`, remembering the value it replaced.
    Insert {
        #[serde(rename = "p")]
        path: Vec<PathSegment>,
        #[serde(rename = "oi")]
        value: Value,
        #[serde(rename = "od", default, skip_serializing_if = "Option::is_none")]
        previous: Option<Value>,
    },
    /// Remove the value at `path`, carrying the removed value for undo.
    Delete {
        #[serde(rename = "p")]
        path: Vec<PathSegment>,
        #[serde(rename = "od")]
        removed: Value,
    },
    /// Add a signed number to the numeric value at `path`.
    Increment {
        #[serde(rename = "p")]
        path: Vec<PathSegment>,
        #[serde(rename = "na")]
        delta: f64,
    },
}

impl Patch {
    pub fn insert(
        path: Vec<PathSegment>,
        value: impl Into<Value>,
        previous: Option<Value>,
    ) -> Self {
        Patch::Insert {
            path,
            value: value.into(),
            previous,
        }
    }

    pub fn delete(path: Vec<PathSegment>, removed: impl Into<Value>) -> Self {
        Patch::Delete {
            path,
            removed: removed.into(),
        }
    }

    pub fn increment(path: Vec<PathSegment>, delta: f64) -> Self {
        Patch::Increment { path, delta }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            Patch::Insert { path, .. } | Patch::Delete { path, .. } | Patch::Increment { path, .. } => {
                path
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("operation list cannot be empty")]
    EmptyOps,
    #[error("patch path cannot be empty")]
    EmptyPath,
    #[error("path does not resolve to an object or array")]
    NotContainer,
    #[error("no value at the patch path")]
    PathNotFound,
    #[error("array index {0} is out of bounds")]
    IndexOutOfBounds(usize),
    #[error("numeric delta applied to a non-numeric value")]
    NotNumeric,
}

/// Reject operations the server would refuse anyway: empty lists and
/// patches with empty paths.
pub fn validate_ops(patches: &[Patch]) -> Result<(), PatchError> {
    if patches.is_empty() {
        return Err(PatchError::EmptyOps);
    }
    for patch in patches {
        if patch.path().is_empty() {
            return Err(PatchError::EmptyPath);
        }
    }
    Ok(())
}

/// Apply a single patch to `root` in place.
///
/// Inserts create missing intermediate objects along the path; deletes and
/// increments require the path to already resolve.
pub fn apply_patch(root: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let path = patch.path();
    if path.is_empty() {
        return Err(PatchError::EmptyPath);
    }
    let create = matches!(patch, Patch::Insert { .. });
    let parent = resolve_parent(root, path, create)?;
    let terminal = &path[path.len() - 1];

    match patch {
        Patch::Insert { value, .. } => match (parent, terminal) {
            (Value::Object(map), PathSegment::Key(key)) => {
                map.insert(key.clone(), value.clone());
                Ok(())
            }
            (Value::Array(items), PathSegment::Index(index)) => {
                if *index < items.len() {
                    items[*index] = value.clone();
                    Ok(())
                } else if *index == items.len() {
                    items.push(value.clone());
                    Ok(())
                } else {
                    Err(PatchError::IndexOutOfBounds(*index))
                }
            }
            _ => Err(PatchError::NotContainer),
        },
        Patch::Delete { .. } => match (parent, terminal) {
            (Value::Object(map), PathSegment::Key(key)) => map
                .remove(key)
                .map(|_| ())
                .ok_or(PatchError::PathNotFound),
            (Value::Array(items), PathSegment::Index(index)) => {
                if *index < items.len() {
                    items.remove(*index);
                    Ok(())
                } else {
                    Err(PatchError::IndexOutOfBounds(*index))
                }
            }
            _ => Err(PatchError::NotContainer),
        },
        Patch::Increment { delta, .. } => {
            let slot = match (parent, terminal) {
                (Value::Object(map), PathSegment::Key(key)) => {
                    map.get_mut(key).ok_or(PatchError::PathNotFound)?
                }
                (Value::Array(items), PathSegment::Index(index)) => items
                    .get_mut(*index)
                    .ok_or(PatchError::IndexOutOfBounds(*index))?,
                _ => return Err(PatchError::NotContainer),
            };
            *slot = add_number(slot, *delta)?;
            Ok(())
        }
    }
}

/// Apply every patch in order, failing on the first error. The caller is
/// responsible for rolling back any prefix that already applied.
pub fn apply_patches(root: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_patch(root, patch)?;
    }
    Ok(())
}

/// Build the patch that undoes `patch`. Rolling back an operation means
/// applying the inverses of its patches in reverse order.
pub fn invert(patch: &Patch) -> Patch {
    match patch {
        Patch::Insert {
            path,
            value,
            previous: Some(previous),
        } => Patch::Insert {
            path: path.clone(),
            value: previous.clone(),
            previous: Some(value.clone()),
        },
        Patch::Insert {
            path,
            value,
            previous: None,
        } => Patch::Delete {
            path: path.clone(),
            removed: value.clone(),
        },
        Patch::Delete { path, removed } => Patch::Insert {
            path: path.clone(),
            value: removed.clone(),
            previous: None,
        },
        Patch::Increment { path, delta } => Patch::Increment {
            path: path.clone(),
            delta: -delta,
        },
    }
}

fn resolve_parent<'a>(
    root: &'a mut Value,
    path: &[PathSegment],
    create: bool,
) -> Result<&'a mut Value, PatchError> {
    let mut current = root;
    for segment in &path[..path.len() - 1] {
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => {
                if create {
                    map.entry(key.clone())
                        .or_insert_with(|| Value::Object(Map::new()))
                } else {
                    map.get_mut(key).ok_or(PatchError::PathNotFound)?
                }
            }
            (Value::Array(items), PathSegment::Index(index)) => items
                .get_mut(*index)
                .ok_or(PatchError::IndexOutOfBounds(*index))?,
            _ => return Err(PatchError::NotContainer),
        };
    }
    Ok(current)
}

fn add_number(value: &Value, delta: f64) -> Result<Value, PatchError> {
    let current = value.as_f64().ok_or(PatchError::NotNumeric)?;
    // Keep integer fields integral when the delta is whole and the sum
    // stays in range; an overflowing sum falls back to float arithmetic.
    if let Some(int) = value.as_i64() {
        if delta.fract() == 0.0 && delta.abs() <= i64::MAX as f64 {
            if let Some(sum) = int.checked_add(delta as i64) {
                return Ok(Value::from(sum));
            }
        }
    }
    Ok(Value::from(current + delta))
}
