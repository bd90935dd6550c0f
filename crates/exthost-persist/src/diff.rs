//! Leaf-level diff between two versions of a hive.

use exthost_core::set_value_at;
use serde_json::{Map, Value};

use crate::persistor::PersistKey;

/// One persistor operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Write a leaf.
    Set { path: PersistKey, value: Value },

    /// Delete a leaf.
    Remove { path: PersistKey },
}

impl DiffOp {
    /// Path of the affected leaf.
    pub fn path(&self) -> &[String] {
        match self {
            Self::Set { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Operations turning the persisted form of `old` into that of `new`.
///
/// Objects are descended into; every other value (arrays included) is a
/// leaf. A `Null` hive counts as absent. At each level removals and changes
/// of existing keys come before additions.
pub fn diff(old: &Value, new: &Value) -> Vec<DiffOp> {
    let empty = Value::Object(Map::new());
    let old = if old.is_null() { &empty } else { old };
    let new = if new.is_null() { &empty } else { new };

    let mut ops = Vec::new();
    diff_into(&mut ops, &mut Vec::new(), old, new);
    ops
}

fn diff_into(ops: &mut Vec<DiffOp>, prefix: &mut PersistKey, old: &Value, new: &Value) {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                prefix.push(key.clone());
                match new.get(key) {
                    None => remove_all(ops, prefix, old_value),
                    Some(new_value) if new_value != old_value => {
                        diff_into(ops, prefix, old_value, new_value)
                    }
                    Some(_) => {}
                }
                prefix.pop();
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    prefix.push(key.clone());
                    add_all(ops, prefix, new_value);
                    prefix.pop();
                }
            }
        }
        _ if old == new => {}
        (Value::Object(_), _) | (_, Value::Object(_)) => {
            remove_all(ops, prefix, old);
            add_all(ops, prefix, new);
        }
        _ => add_all(ops, prefix, new),
    }
}

fn remove_all(ops: &mut Vec<DiffOp>, prefix: &mut PersistKey, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                prefix.push(key.clone());
                remove_all(ops, prefix, child);
                prefix.pop();
            }
        }
        _ => ops.push(DiffOp::Remove {
            path: prefix.clone(),
        }),
    }
}

fn add_all(ops: &mut Vec<DiffOp>, prefix: &mut PersistKey, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                prefix.push(key.clone());
                add_all(ops, prefix, child);
                prefix.pop();
            }
        }
        _ => ops.push(DiffOp::Set {
            path: prefix.clone(),
            value: value.clone(),
        }),
    }
}

/// Rebuild a nested object from persisted leaves.
///
/// Leaves that are not valid JSON are kept as strings.
pub fn unflatten<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (PersistKey, String)>,
{
    let mut root = Value::Object(Map::new());
    for (key, raw) in entries {
        let value = serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::debug!(key = %key.join("."), error = %e, "Persisted value is not JSON");
            Value::String(raw)
        });
        if key.is_empty() {
            continue;
        }
        set_value_at(&mut root, &key, value);
    }
    root
}
