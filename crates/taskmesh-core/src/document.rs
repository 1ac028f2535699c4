// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partial-document merging and structural diffing.
//!
//! These are the pure functions the whole synchronization protocol rests on.
//! They operate on [`serde_json::Value`] documents and honor the tombstone
//! convention:
//!
//! - in an **object**, `null` means "delete this key" (the marker is retained
//!   by [`deep_merge`] and must be dropped with [`strip_nulls`] before the
//!   document is exposed externally);
//! - in an **array**, `null` means "keep the existing element at this index".
//!
//! The two meanings are the inverse of one another. This is a known footgun,
//! but it is load-bearing: arrays cannot address "delete at index" without
//! shifting, and existing callers depend on both meanings, so changing either
//! would break wire compatibility.
//!
//! The round-trip law the transport protocol depends on:
//! `deep_merge(a, get_object_difference(a, b))` reconstructs a document
//! equivalent to `b` for every key present in `b`. One exception: an array
//! shrink with no surviving element changed diffs to nothing, so senders
//! must ship a shrunk array whole rather than as a diff.

use serde_json::{Map, Value};

/// Whether a value is an object or an array.
pub fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

fn container_is_empty(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Deep-merge `update` over `prev`.
///
/// An empty object or empty array in `update` replaces the previous value
/// outright ("explicit replace with empty"). Arrays merge positionally and
/// the update's length dictates the merged length, so an update can shrink
/// an array; trailing elements of `prev` are dropped.
pub fn deep_merge(prev: &Value, update: &Value) -> Value {
    if is_container(update) && container_is_empty(update) {
        return update.clone();
    }

    match update {
        Value::Array(items) => {
            let prev_items = prev.as_array();
            let mut output = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let prev_item = prev_items.and_then(|p| p.get(i));
                match (prev_item, item) {
                    (None, _) => output.push(item.clone()),
                    // Null is a placeholder in arrays: keep the existing element.
                    (Some(p), Value::Null) => output.push(p.clone()),
                    (Some(p), u) if is_container(u) => {
                        let merged = deep_merge(p, u);
                        if merged.is_null() {
                            output.push(p.clone());
                        } else {
                            output.push(merged);
                        }
                    }
                    (Some(_), u) => output.push(u.clone()),
                }
            }
            Value::Array(output)
        }
        Value::Object(update_map) => {
            let mut output = match prev {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            for (key, val) in update_map {
                // Null is a deletion marker in objects: retained for the
                // caller to interpret or strip.
                if val.is_null() {
                    output.insert(key.clone(), Value::Null);
                } else if !output.contains_key(key) {
                    output.insert(key.clone(), val.clone());
                } else if is_container(val) {
                    let merged = deep_merge(&output[key], val);
                    output.insert(key.clone(), merged);
                } else {
                    output.insert(key.clone(), val.clone());
                }
            }
            Value::Object(output)
        }
        other => other.clone(),
    }
}

/// Structural difference of `b` against `a`.
///
/// Returns `None` when there is no difference. The diff walks every key and
/// index of `b`; keys only present in `a` do not appear (so merging the diff
/// preserves them). Array indices without changes become `null` placeholders,
/// and arrays whose diff is entirely placeholders collapse away.
pub fn get_object_difference(a: &Value, b: &Value) -> Option<Value> {
    diff_against(Some(a), b)
}

fn diff_against(a: Option<&Value>, b: &Value) -> Option<Value> {
    let Some(a) = a else {
        return Some(b.clone());
    };
    if !is_container(a) && a == b {
        return None;
    }
    // Null kept: it is being used to delete.
    if b.is_null() {
        return Some(Value::Null);
    }
    if !is_container(b) {
        return Some(b.clone());
    }
    if is_container(a) && container_is_empty(a) && container_is_empty(b) {
        return None;
    }
    if container_is_empty(b) {
        return Some(b.clone());
    }
    if !is_container(a) {
        return Some(b.clone());
    }

    match b {
        Value::Array(items) => {
            let mut diff_items = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let a_item = a.as_array().and_then(|arr| arr.get(i));
                diff_items.push(match diff_against(a_item, item) {
                    None => Value::Null,
                    Some(d) if !is_container(&d) => d,
                    Some(d) if !container_is_empty(&d) => d,
                    // Empty sub-diff becomes a placeholder.
                    Some(_) => Value::Null,
                });
            }
            // Collapse sub-diffs that carry no information.
            for item in diff_items.iter_mut() {
                if is_placeholder_array(item) {
                    *item = Value::Null;
                }
            }
            if diff_items.iter().all(Value::is_null) {
                None
            } else {
                Some(Value::Array(diff_items))
            }
        }
        Value::Object(map) => {
            let mut diff_map = Map::new();
            for (key, val) in map {
                let a_val = match a {
                    Value::Object(am) => am.get(key),
                    _ => None,
                };
                match diff_against(a_val, val) {
                    None => {}
                    Some(d) if !is_container(&d) => {
                        diff_map.insert(key.clone(), d);
                    }
                    Some(d) if !container_is_empty(&d) => {
                        diff_map.insert(key.clone(), d);
                    }
                    // Empty object sub-diffs survive for objects: they mean
                    // "replace with empty".
                    Some(d) if d.is_object() => {
                        diff_map.insert(key.clone(), d);
                    }
                    Some(_) => {}
                }
            }
            diff_map.retain(|_, v| !is_placeholder_array(v));
            if diff_map.is_empty() {
                None
            } else {
                Some(Value::Object(diff_map))
            }
        }
        _ => Some(b.clone()),
    }
}

fn is_placeholder_array(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty() || items.iter().all(Value::is_null),
        _ => false,
    }
}

/// The subset of keys present in both `a` and `b` whose values differ,
/// carrying `a`'s values.
///
/// This scopes hash verification to the slice of the previous state a diff
/// actually touches, instead of the whole document. Array indices where `b`
/// holds a `null` placeholder are skipped (the placeholder means "unchanged").
pub fn get_intersection_with_different_values(a: &Value, b: &Value) -> Option<Value> {
    if a == b {
        return None;
    }
    if is_container(a) && container_is_empty(a) && is_container(b) && container_is_empty(b) {
        return None;
    }
    if is_container(a) && container_is_empty(a) {
        return Some(a.clone());
    }
    if is_container(b) && container_is_empty(b) {
        return Some(a.clone());
    }

    match (a, b) {
        (Value::Object(am), Value::Object(bm)) => {
            let mut out = Map::new();
            for (key, a_val) in am {
                let Some(b_val) = bm.get(key) else { continue };
                if is_container(a_val) && is_container(b_val) {
                    if let Some(diff) = get_intersection_with_different_values(a_val, b_val) {
                        out.insert(key.clone(), diff);
                    }
                } else if a_val != b_val {
                    out.insert(key.clone(), a_val.clone());
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        (Value::Array(aa), Value::Array(ba)) => {
            let mut out: Vec<Value> = Vec::new();
            for (i, a_val) in aa.iter().enumerate() {
                let Some(b_val) = ba.get(i) else { continue };
                let entry = if is_container(a_val) && is_container(b_val) {
                    get_intersection_with_different_values(a_val, b_val)
                } else if a_val != b_val {
                    if b_val.is_null() {
                        // Null placeholder: not a real difference.
                        None
                    } else {
                        Some(a_val.clone())
                    }
                } else {
                    None
                };
                if let Some(entry) = entry {
                    while out.len() < i {
                        out.push(Value::Null);
                    }
                    out.push(entry);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Array(out))
            }
        }
        _ => Some(a.clone()),
    }
}

/// Drop object tombstones from a merged document before exposing it.
///
/// Top-level namespace keys are kept even when null (e.g. `task.request`),
/// nested null keys are removed, and an object whose values were all null
/// collapses away entirely. Array placeholders are preserved.
pub fn strip_nulls(value: Value) -> Value {
    strip_nulls_at(value, 0)
}

fn strip_nulls_at(value: Value, depth: usize) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| strip_nulls_at(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let saw_key = !map.is_empty();
            let mut all_null = true;
            let mut out = Map::new();
            for (key, val) in map {
                if val.is_null() {
                    if depth == 0 {
                        out.insert(key, Value::Null);
                    }
                    continue;
                }
                let val = if is_container(&val) {
                    strip_nulls_at(val, depth + 1)
                } else {
                    val
                };
                if val.is_null() {
                    if depth == 0 {
                        out.insert(key, Value::Null);
                    }
                    continue;
                }
                all_null = false;
                out.insert(key, val);
            }
            if saw_key && all_null && depth > 0 {
                Value::Null
            } else {
                Value::Object(out)
            }
        }
        other => other,
    }
}

/// Remove empty objects and arrays, recursively, bottom-up.
///
/// Used to normalize documents before hashing: one replica storing `{}` where
/// another stores nothing at all must not count as divergence.
pub fn remove_empty_containers(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                let val = remove_empty_containers(val);
                if is_container(&val) && container_is_empty(&val) {
                    continue;
                }
                out.insert(key, val);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(remove_empty_containers).collect()),
        other => other,
    }
}

/// Read the value at a dot-separated path (`"output.msgs.0"`).
pub fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dot-separated path, creating intermediate objects.
pub fn set_value_at_path(root: &mut Value, path: &str, new_value: Value) {
    let mut pending = Some(new_value);
    let mut segments = path.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else { return };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), pending.take().unwrap_or(Value::Null));
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
