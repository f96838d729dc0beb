//! Structural JSON diff and patch (RFC 6902 operations)
//!
//! Used on both sides of the engine: update requests arrive as patch
//! documents, and insert/update responses return the difference between what
//! the caller asked for and what was persisted.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single JSON-patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

/// Compute the operations that turn `from` into `to`.
pub fn diff(from: &Value, to: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_into(from, to, String::new(), &mut ops);
    ops
}

fn diff_into(from: &Value, to: &Value, path: String, ops: &mut Vec<PatchOp>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let child = format!("{}/{}", path, escape(key));
                match b.get(key) {
                    Some(new) => diff_into(old, new, child, ops),
                    None => ops.push(PatchOp::Remove { path: child }),
                }
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    ops.push(PatchOp::Add {
                        path: format!("{}/{}", path, escape(key)),
                        value: new.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let shared = a.len().min(b.len());
            for i in 0..shared {
                diff_into(&a[i], &b[i], format!("{}/{}", path, i), ops);
            }
            // Remove from the tail backwards so indexes stay valid
            for i in (shared..a.len()).rev() {
                ops.push(PatchOp::Remove {
                    path: format!("{}/{}", path, i),
                });
            }
            for item in &b[shared..] {
                ops.push(PatchOp::Add {
                    path: format!("{}/-", path),
                    value: item.clone(),
                });
            }
        }
        _ => ops.push(PatchOp::Replace {
            path,
            value: to.clone(),
        }),
    }
}

/// Parse a patch document supplied by a caller.
pub fn parse(patch: &Value) -> Result<Vec<PatchOp>> {
    match patch {
        Value::Array(_) => serde_json::from_value(patch.clone())
            .map_err(|e| DataError::validation(format!("Invalid patch: {}", e))),
        Value::Null => Ok(Vec::new()),
        _ => Err(DataError::validation("Patch must be an array of operations")),
    }
}

/// Apply operations to a document, returning the patched copy.
pub fn apply(mut doc: Value, ops: &[PatchOp]) -> Result<Value> {
    for op in ops {
        match op {
            PatchOp::Add { path, value } => add(&mut doc, path, value.clone())?,
            PatchOp::Remove { path } => {
                remove(&mut doc, path)?;
            }
            PatchOp::Replace { path, value } => {
                if path.is_empty() {
                    doc = value.clone();
                } else {
                    let target = doc
                        .pointer_mut(path)
                        .ok_or_else(|| missing(path))?;
                    *target = value.clone();
                }
            }
            PatchOp::Move { from, path } => {
                let value = remove(&mut doc, from)?;
                add(&mut doc, path, value)?;
            }
            PatchOp::Copy { from, path } => {
                let value = doc.pointer(from).cloned().ok_or_else(|| missing(from))?;
                add(&mut doc, path, value)?;
            }
            PatchOp::Test { path, value } => {
                if doc.pointer(path) != Some(value) {
                    return Err(DataError::validation(format!(
                        "Patch test failed at '{}'",
                        path
                    )));
                }
            }
        }
    }
    Ok(doc)
}

/// Serialize operations into the response shape.
pub fn to_value(ops: &[PatchOp]) -> Value {
    serde_json::to_value(ops).unwrap_or(Value::Array(Vec::new()))
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn missing(path: &str) -> DataError {
    DataError::validation(format!("Patch path '{}' does not exist", path))
}

fn split(path: &str) -> Result<(&str, String)> {
    let idx = path
        .rfind('/')
        .ok_or_else(|| DataError::validation(format!("Invalid patch path '{}'", path)))?;
    Ok((&path[..idx], unescape(&path[idx + 1..])))
}

fn add(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    if path.is_empty() {
        *doc = value;
        return Ok(());
    }
    let (parent, key) = split(path)?;
    match doc.pointer_mut(parent).ok_or_else(|| missing(parent))? {
        Value::Object(map) => {
            map.insert(key, value);
        }
        Value::Array(items) => {
            if key == "-" {
                items.push(value);
            } else {
                let idx: usize = key
                    .parse()
                    .map_err(|_| DataError::validation(format!("Invalid index in '{}'", path)))?;
                if idx > items.len() {
                    return Err(missing(path));
                }
                items.insert(idx, value);
            }
        }
        _ => return Err(missing(path)),
    }
    Ok(())
}

fn remove(doc: &mut Value, path: &str) -> Result<Value> {
    let (parent, key) = split(path)?;
    match doc.pointer_mut(parent).ok_or_else(|| missing(parent))? {
        Value::Object(map) => map.remove(&key).ok_or_else(|| missing(path)),
        Value::Array(items) => {
            let idx: usize = key
                .parse()
                .map_err(|_| DataError::validation(format!("Invalid index in '{}'", path)))?;
            if idx >= items.len() {
                return Err(missing(path));
            }
            Ok(items.remove(idx))
        }
        _ => Err(missing(path)),
    }
}
