// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Point-to-point connections between family members.
//!
//! A connection is a pair `["<fromId>:<fromPath>", "<toId>:<toPath>"]`
//! declared in `task.connections`. Ids resolve against the family's
//! membership map by case-insensitive suffix match (shortest member id
//! first); an empty id means "this task". Once both endpoints are running,
//! the binding is canonicalized and the resolved target instance is cached
//! in `task.meta.connectionsMap`.
//!
//! A binding whose peer is not running yet is stashed in the family's
//! `connections` namespace ("connect later") and retried whenever the family
//! changes again.
//!
//! After binding, any update that modifies `output` copies the value at
//! `fromPath` into the target's `toPath`, suppressed when the values are
//! already equal.

use serde_json::{Map, Value, json};
use taskmesh_protocol::Task;
use tracing::{debug, warn};

use crate::document::{set_value_at_path, value_at_path};
use crate::error::Result;
use crate::store::HubStores;

use super::{SOURCE_CONNECT, sync_update};

const SEP: char = ':';

fn split_endpoint(endpoint: &str) -> (String, String) {
    match endpoint.split_once(SEP) {
        Some((id, path)) => (id.to_string(), path.to_string()),
        None => (endpoint.to_string(), String::new()),
    }
}

/// Resolve a connection id against the family membership map.
///
/// Empty id refers to the current task. Otherwise the shortest member id
/// whose suffix matches wins, so `chat` resolves to `root.chat` before
/// `root.archive.chat`.
fn resolve_in_family(family: &Map<String, Value>, id: &str, own_instance: &str) -> Option<String> {
    if id.is_empty() {
        return Some(own_instance.to_string());
    }
    let needle = id.to_lowercase();
    let mut member_ids: Vec<&String> = family.keys().collect();
    member_ids.sort_by_key(|k| k.len());
    for member_id in member_ids {
        let lower = member_id.to_lowercase();
        if lower == needle || lower.ends_with(&format!(".{}", needle)) {
            return family
                .get(member_id)
                .and_then(Value::as_str)
                .map(str::to_string);
        }
    }
    None
}

fn connections_map(task: &Task) -> Map<String, Value> {
    task.meta
        .as_ref()
        .and_then(|m| m.extra.get("connectionsMap"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn set_connections_map(task: &mut Task, map: Map<String, Value>) {
    task.meta_mut()
        .extra
        .insert("connectionsMap".to_string(), Value::Object(map));
}

fn pair(from: &str, to: &str) -> Value {
    json!([from, to])
}

/// Establish declared bindings, stashing unresolvable ones for later.
pub async fn propagate_bindings(
    stores: &HubStores,
    task: &mut Task,
    cep_source: Option<&str>,
    is_init: bool,
) -> Result<Vec<Task>> {
    let modified_connections = task
        .meta
        .as_ref()
        .and_then(|m| m.modified.as_ref())
        .map(|m| m.contains_key("connections"))
        .unwrap_or(false);
    if !is_init && (!modified_connections || cep_source == Some(SOURCE_CONNECT)) {
        return Ok(Vec::new());
    }

    let Some(instance_id) = task.instance_id.clone() else {
        return Ok(Vec::new());
    };
    let Some(family_id) = task.family_id.clone() else {
        return Ok(Vec::new());
    };

    let family = stores.family(&family_id).await?;
    let mut connect_later = stores.connections(&family_id).await?;
    let mut connect_later_changed = false;
    let mut own_map = connections_map(task);
    let mut own_connections: Vec<Value> = task
        .connections
        .as_ref()
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut followups = Vec::new();

    // Stashed bindings are retried on every family change
    let pending: Vec<Value> = connect_later.clone();
    let declared: Vec<(Value, bool)> = own_connections
        .drain(..)
        .map(|c| (c, false))
        .chain(pending.into_iter().map(|c| (c, true)))
        .collect();
    let mut kept: Vec<Value> = Vec::new();

    for (connection, from_stash) in declared {
        let Some([from, to]) = connection
            .as_array()
            .and_then(|a| <&[Value; 2]>::try_from(a.as_slice()).ok())
        else {
            warn!(task_id = %task.id, "malformed connection dropped");
            continue;
        };
        let (from_raw, to_raw) = match (from.as_str(), to.as_str()) {
            (Some(f), Some(t)) => (f, t),
            _ => continue,
        };
        let (from_id, from_path) = split_endpoint(from_raw);
        let (to_id, to_path) = split_endpoint(to_raw);
        let from_instance = resolve_in_family(&family, &from_id, &instance_id);
        let to_instance = resolve_in_family(&family, &to_id, &instance_id);

        let from_is_self = from_instance.as_deref() == Some(instance_id.as_str());
        let to_is_self = !from_is_self && to_instance.as_deref() == Some(instance_id.as_str());
        let canonical_to_id = if to_is_self { task.id.clone() } else { to_id.clone() };

        if from_is_self {
            if own_map.contains_key(&canonical_to_id) {
                if !from_stash {
                    kept.push(connection.clone());
                }
                continue;
            }
            match to_instance {
                Some(to_instance) => {
                    debug!(task_id = %task.id, to_id = %canonical_to_id, "connection established");
                    kept.push(pair(
                        &format!("{}{}{}", task.id, SEP, from_path),
                        &format!("{}{}{}", canonical_to_id, SEP, to_path),
                    ));
                    own_map.insert(canonical_to_id, Value::String(to_instance));
                    if from_stash {
                        connect_later.retain(|c| c != &connection);
                        connect_later_changed = true;
                    }
                }
                None => {
                    // Peer not running yet: stash and retry later
                    let stashed = pair(
                        &format!("{}{}{}", task.id, SEP, from_path),
                        &format!("{}{}{}", to_id, SEP, to_path),
                    );
                    if !from_stash && !connect_later.contains(&stashed) {
                        debug!(task_id = %task.id, to_id = %to_id, "connection deferred");
                        connect_later.push(stashed);
                        connect_later_changed = true;
                    }
                }
            }
        } else if to_is_self {
            // The source side owns the binding; install it there
            let mut connected = false;
            if let Some(from_instance) = from_instance
                && let Some(mut from_task) = stores.instance(&from_instance).await?
            {
                let mut from_map = connections_map(&from_task);
                if !from_map.contains_key(&task.id) {
                    let mut from_connections: Vec<Value> = from_task
                        .connections
                        .as_ref()
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    from_connections.push(pair(
                        &format!("{}{}{}", from_task.id, SEP, from_path),
                        &format!("{}{}{}", task.id, SEP, to_path),
                    ));
                    from_map.insert(task.id.clone(), Value::String(instance_id.clone()));
                    from_task.connections = Some(Value::Array(from_connections.clone()));
                    set_connections_map(&mut from_task, from_map.clone());
                    followups.push(sync_update(
                        &from_instance,
                        json!({
                            "connections": from_connections,
                            "meta": { "connectionsMap": from_map },
                        }),
                        SOURCE_CONNECT,
                    ));
                }
                connected = true;
                if from_stash {
                    connect_later.retain(|c| c != &connection);
                    connect_later_changed = true;
                }
            }
            if !connected {
                let stashed = pair(
                    &format!("{}{}{}", from_id, SEP, from_path),
                    &format!("{}{}{}", task.id, SEP, to_path),
                );
                if !from_stash && !connect_later.contains(&stashed) {
                    debug!(task_id = %task.id, from_id = %from_id, "connection deferred");
                    connect_later.push(stashed);
                    connect_later_changed = true;
                }
            }
        } else if !from_stash {
            // Neither endpoint is this task; keep the declaration untouched
            kept.push(connection.clone());
        }
    }

    task.connections = Some(Value::Array(kept));
    if !own_map.is_empty() {
        set_connections_map(task, own_map);
    }
    if connect_later_changed {
        stores.set_connections(&family_id, &connect_later).await?;
    }
    Ok(followups)
}

/// Copy changed output values across established bindings.
pub async fn propagate_output(stores: &HubStores, task: &Task) -> Result<Vec<Task>> {
    let modified_output = task
        .meta
        .as_ref()
        .and_then(|m| m.modified.as_ref())
        .map(|m| m.contains_key("output"))
        .unwrap_or(false);
    if !modified_output {
        return Ok(Vec::new());
    }
    let Some(connections) = task.connections.as_ref().and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let own_map = connections_map(task);
    let task_value = task.to_value()?;
    let mut followups = Vec::new();

    for connection in connections {
        let Some([from, to]) = connection
            .as_array()
            .and_then(|a| <&[Value; 2]>::try_from(a.as_slice()).ok())
        else {
            continue;
        };
        let (from_raw, to_raw) = match (from.as_str(), to.as_str()) {
            (Some(f), Some(t)) => (f, t),
            _ => continue,
        };
        let (from_id, from_path) = split_endpoint(from_raw);
        let (to_id, to_path) = split_endpoint(to_raw);
        if !from_id.is_empty() && from_id != task.id {
            continue;
        }
        let Some(to_instance) = own_map.get(&to_id).and_then(Value::as_str) else {
            continue;
        };
        let Some(from_value) = value_at_path(&task_value, &from_path) else {
            continue;
        };
        let Some(to_task) = stores.instance(to_instance).await? else {
            continue;
        };
        let to_value = to_task.to_value()?;
        if value_at_path(&to_value, &to_path) == Some(from_value) {
            // Already equal; suppress to terminate propagation chains
            continue;
        }
        let mut sync_doc = Value::Object(Map::new());
        set_value_at_path(&mut sync_doc, &to_path, from_value.clone());
        debug!(task_id = %task.id, to_id = %to_id, to_path = %to_path, "output propagated over connection");
        followups.push(sync_update(to_instance, sync_doc, SOURCE_CONNECT));
    }
    Ok(followups)
}
