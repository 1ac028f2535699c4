// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hash-based divergence detection between task replicas.
//!
//! Every update carries two fingerprints computed by the sender:
//!
//! | Field            | Over                                                  |
//! |------------------|-------------------------------------------------------|
//! | `meta.hash`      | the sender's whole (cleaned) task document            |
//! | `meta.hashDiff`  | only the slice of previous state the diff touches     |
//!
//! The receiver recomputes both from its own stored replica. A scoped
//! (`hashDiff`) mismatch alone is logged and tolerated, because replicas
//! legitimately hold different unsynchronized namespaces. Only when the full
//! hash also disagrees have the replicas truly diverged, and the update is
//! rejected with [`HubError::HashMismatch`].
//!
//! The hash is djb2 over the UTF-16 code units of a canonical JSON rendering
//! with recursively sorted keys, folded to unsigned 32 bits. Volatile
//! namespaces (infrastructure bookkeeping, permissions, meta itself) are
//! stripped first, as are empty containers and null tombstones, so that a
//! replica storing `{}` where another stores nothing does not diverge.

use serde_json::{Map, Value};
use taskmesh_protocol::Task;
use tracing::warn;

use crate::document::{
    get_intersection_with_different_values, is_container, remove_empty_containers,
};
use crate::error::{HubError, Result};

/// Top-level keys excluded from hashing. These either never synchronize
/// (infrastructure routing, auth) or change on every hop (`meta`).
const HASH_EXCLUDED_KEYS: &[&str] = &[
    "processor",
    "processors",
    "hub",
    "user",
    "users",
    "permissions",
    "meta",
    "connections",
    "command",
    "commandArgs",
    "tokens",
];

/// djb2 over UTF-16 code units, folded to u32.
///
/// Matches the historical hash on the wire: seed 5381, `hash * 33 XOR unit`
/// per unit, unsigned 32-bit wraparound.
pub fn djb2_hash(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for unit in s.encode_utf16() {
        hash = hash.wrapping_shl(5).wrapping_add(hash) ^ u32::from(unit);
    }
    hash
}

/// Strip volatile namespaces and normalize a task document for hashing.
pub fn clean_for_hash(task_value: &Value) -> Value {
    let mut cleaned = match task_value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                if HASH_EXCLUDED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), val.clone());
            }
            Value::Object(out)
        }
        other => other.clone(),
    };
    // state.last is a local cursor, not shared state.
    if let Some(state) = cleaned.get_mut("state")
        && let Some(map) = state.as_object_mut()
    {
        map.remove("last");
    }
    remove_nulls(remove_empty_containers(cleaned))
}

fn remove_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, remove_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(remove_nulls).collect()),
        other => other,
    }
}

/// Render a value as JSON with object keys recursively sorted.
pub fn canonical_string(value: &Value) -> String {
    sort_keys(value.clone()).to_string()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Full fingerprint of a task replica.
pub fn task_hash(task: &Task) -> Result<u32> {
    let value = task.to_value()?;
    Ok(djb2_hash(&canonical_string(&clean_for_hash(&value))))
}

/// Both sides of the slice a diff touches: the stored replica's values and
/// the incoming diff's values over the same differing keys.
pub fn hash_slices(stored: &Value, diff: &Value) -> (Option<Value>, Option<Value>) {
    let stored = clean_for_hash(stored);
    let diff = clean_for_hash(diff);
    if !is_container(&stored) || !is_container(&diff) {
        return (None, None);
    }
    let local = get_intersection_with_different_values(&stored, &diff);
    let remote = get_intersection_with_different_values(&diff, &stored);
    (local, remote)
}

/// Fingerprint of the slice of `stored` that `diff` touches.
///
/// `None` means the diff touches nothing the replica also holds, so there is
/// nothing to verify.
pub fn scoped_hash(stored: &Value, diff: &Value) -> Option<u32> {
    let (local, _) = hash_slices(stored, diff);
    local.map(|slice| djb2_hash(&canonical_string(&slice)))
}

/// Verify an incoming diff against the stored replica.
///
/// Scoped mismatch alone is tolerated (logged at warn). A hard error is
/// returned only when the sender's full hash also disagrees with ours.
pub fn check_hash_diff(stored: &Task, diff: &Value, instance_id: &str) -> Result<()> {
    let meta = match diff.get("meta") {
        Some(Value::Object(map)) => map,
        _ => return Ok(()),
    };
    let remote_hash_diff = meta.get("hashDiff").and_then(Value::as_u64);
    let remote_hash = meta.get("hash").and_then(Value::as_u64);

    let stored_value = stored.to_value()?;
    let (local_slice, remote_slice) = hash_slices(&stored_value, diff);
    let local_scoped = local_slice
        .as_ref()
        .map(|slice| djb2_hash(&canonical_string(slice)));

    let scoped_matches = match (remote_hash_diff, local_scoped) {
        (Some(remote), Some(local)) => remote == u64::from(local),
        _ => true,
    };
    if scoped_matches {
        return Ok(());
    }

    let local_full = task_hash(stored)?;
    match remote_hash {
        Some(remote) if remote != u64::from(local_full) => Err(HubError::HashMismatch {
            instance_id: instance_id.to_string(),
            remote: remote as u32,
            local: local_full,
        }),
        _ => {
            warn!(
                instance_id,
                remote_hash_diff,
                local_scoped,
                local_slice = %local_slice.unwrap_or(serde_json::Value::Null),
                remote_slice = %remote_slice.unwrap_or(serde_json::Value::Null),
                "scoped hash mismatch on unsynchronized state, accepting update"
            );
            Ok(())
        }
    }
}
