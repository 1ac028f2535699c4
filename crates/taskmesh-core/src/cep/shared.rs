// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared variables mirrored across a task family.
//!
//! Store layout (per scope, in the `shared` namespace):
//!
//! ```text
//! { "<varName>": { "instanceIds": ["..."], "value": <current value> } }
//! ```
//!
//! Scope is the task's family, except for variable names under `system.`
//! which live in the hub-wide `system` scope. Any instance may read a
//! `system.` variable, but only tasks whose id sits under the `system`
//! subtree may write one.

use serde_json::{Value, json};
use taskmesh_protocol::Task;
use tracing::{debug, warn};

use crate::document::deep_merge;
use crate::error::Result;
use crate::store::HubStores;

use super::{SOURCE_SHARED, sync_update};

/// Hub-wide scope id for `system.` variables.
const SYSTEM_SCOPE: &str = "system";

fn scope_for(var_name: &str, family_id: &str) -> String {
    if var_name.starts_with("system.") {
        SYSTEM_SCOPE.to_string()
    } else {
        family_id.to_string()
    }
}

fn may_write(var_name: &str, task_id: &str) -> bool {
    !var_name.starts_with("system.")
        || task_id == SYSTEM_SCOPE
        || task_id.starts_with("system.")
}

/// Propagate shared-variable changes, or seed them on init.
pub async fn propagate(
    stores: &HubStores,
    task: &mut Task,
    cep_source: Option<&str>,
    is_init: bool,
) -> Result<Vec<Task>> {
    let modified_shared = task
        .meta
        .as_ref()
        .and_then(|m| m.modified.as_ref())
        .and_then(|m| m.get("shared"))
        .and_then(Value::as_object)
        .cloned();

    if !is_init && (modified_shared.is_none() || cep_source == Some(SOURCE_SHARED)) {
        return Ok(Vec::new());
    }

    let Some(instance_id) = task.instance_id.clone() else {
        return Ok(Vec::new());
    };
    let Some(family_id) = task.family_id.clone() else {
        return Ok(Vec::new());
    };

    let var_names: Vec<String> = if is_init {
        task.shared
            .as_ref()
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        modified_shared
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    };

    let mut followups = Vec::new();
    for var_name in var_names {
        let scope = scope_for(&var_name, &family_id);
        let mut entries = stores.shared(&scope).await?;
        let mut entry = entries
            .get(&var_name)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({ "instanceIds": [], "value": null }));

        // Register this instance for future propagation
        if entry.get("instanceIds").and_then(Value::as_array).is_none() {
            entry["instanceIds"] = json!([]);
        }
        let ids = match entry.get_mut("instanceIds").and_then(Value::as_array_mut) {
            Some(ids) => ids,
            None => continue,
        };
        if !ids.iter().any(|v| v.as_str() == Some(instance_id.as_str())) {
            debug!(var_name = %var_name, instance_id = %instance_id, scope = %scope, "registered shared subscriber");
            ids.push(Value::String(instance_id.clone()));
        }

        if is_init {
            let stored_value = entry.get("value").cloned().unwrap_or(Value::Null);
            if !stored_value.is_null() {
                // Pull: the scope already holds a value, it wins over the
                // template default
                if let Some(Value::Object(shared)) = task.shared.as_mut() {
                    shared.insert(var_name.clone(), stored_value);
                }
            } else if let Some(seed) = task
                .shared
                .as_ref()
                .and_then(Value::as_object)
                .and_then(|m| m.get(&var_name))
                && may_write(&var_name, &task.id)
            {
                entry["value"] = seed.clone();
            }
        } else if let Some(diff) = modified_shared.as_ref().and_then(|m| m.get(&var_name)) {
            if !may_write(&var_name, &task.id) {
                warn!(var_name = %var_name, task_id = %task.id, "system variable write denied");
                entries.insert(var_name, entry);
                stores.set_shared(&scope, &entries).await?;
                continue;
            }
            let old_value = entry.get("value").cloned().unwrap_or(Value::Null);
            let new_value = if old_value.is_null() {
                diff.clone()
            } else {
                deep_merge(&old_value, diff)
            };
            if new_value != old_value {
                let subscribers: Vec<String> = entry
                    .get("instanceIds")
                    .and_then(Value::as_array)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                for subscriber in subscribers {
                    if subscriber == instance_id {
                        continue;
                    }
                    followups.push(sync_update(
                        &subscriber,
                        json!({ "shared": { var_name.clone(): diff.clone() } }),
                        SOURCE_SHARED,
                    ));
                }
                entry["value"] = new_value;
            }
        }

        entries.insert(var_name, entry);
        stores.set_shared(&scope, &entries).await?;
    }
    Ok(followups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use taskmesh_protocol::TaskMeta;

    fn family_task(instance_id: &str, shared: Value, modified_shared: Option<Value>) -> Task {
        Task {
            id: "root.chat".to_string(),
            instance_id: Some(instance_id.to_string()),
            family_id: Some("f-1".to_string()),
            shared: Some(shared),
            meta: modified_shared.map(|m| TaskMeta {
                modified: Some(
                    json!({ "shared": m })
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_seeds_then_pulls() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));

        // First instance seeds the value
        let mut first = family_task("i-1", json!({"topic": "rust"}), None);
        let followups = propagate(&stores, &mut first, None, true).await.unwrap();
        assert!(followups.is_empty());

        // Second instance pulls the seeded value over its template default
        let mut second = family_task("i-2", json!({"topic": "default"}), None);
        propagate(&stores, &mut second, None, true).await.unwrap();
        assert_eq!(second.shared, Some(json!({"topic": "rust"})));

        let entries = stores.shared("f-1").await.unwrap();
        let ids = entries["topic"]["instanceIds"].as_array().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_change_fans_out_to_other_subscribers() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));
        let mut first = family_task("i-1", json!({"topic": "rust"}), None);
        propagate(&stores, &mut first, None, true).await.unwrap();
        let mut second = family_task("i-2", json!({"topic": "rust"}), None);
        propagate(&stores, &mut second, None, true).await.unwrap();

        let mut update = family_task("i-1", json!({"topic": "tokio"}), Some(json!({"topic": "tokio"})));
        let followups = propagate(&stores, &mut update, None, false).await.unwrap();

        // Only the other subscriber is targeted
        assert_eq!(followups.len(), 1);
        let args = followups[0].hub.as_ref().unwrap().args();
        assert!(args.sync);
        assert_eq!(args.instance_id.as_deref(), Some("i-2"));
        assert_eq!(args.cep_source.as_deref(), Some(SOURCE_SHARED));
        assert_eq!(args.sync_task, Some(json!({"shared": {"topic": "tokio"}})));
    }

    #[tokio::test]
    async fn test_no_op_change_is_suppressed() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));
        let mut first = family_task("i-1", json!({"topic": "rust"}), None);
        propagate(&stores, &mut first, None, true).await.unwrap();
        let mut second = family_task("i-2", json!({"topic": "rust"}), None);
        propagate(&stores, &mut second, None, true).await.unwrap();

        let mut update = family_task("i-1", json!({"topic": "rust"}), Some(json!({"topic": "rust"})));
        let followups = propagate(&stores, &mut update, None, false).await.unwrap();
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn test_own_source_is_skipped() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));
        let mut update = family_task("i-1", json!({"topic": "x"}), Some(json!({"topic": "x"})));
        let followups = propagate(&stores, &mut update, Some(SOURCE_SHARED), false)
            .await
            .unwrap();
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn test_system_scope_write_denied_for_family_tasks() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));
        let mut init = Task {
            id: "system.config".to_string(),
            instance_id: Some("i-sys".to_string()),
            family_id: Some("f-sys".to_string()),
            shared: Some(json!({"system.flags": {"beta": true}})),
            ..Default::default()
        };
        propagate(&stores, &mut init, None, true).await.unwrap();

        // A non-system task may not overwrite it
        let mut rogue = family_task(
            "i-1",
            json!({"system.flags": {"beta": false}}),
            Some(json!({"system.flags": {"beta": false}})),
        );
        let followups = propagate(&stores, &mut rogue, None, false).await.unwrap();
        assert!(followups.is_empty());

        let entries = stores.shared("system").await.unwrap();
        assert_eq!(entries["system.flags"]["value"], json!({"beta": true}));
    }

    #[tokio::test]
    async fn test_tombstone_diff_merges_into_stored_value() {
        let stores = HubStores::new(Arc::new(MemoryStore::new()));
        let mut first = family_task("i-1", json!({"doc": {"a": 1, "b": 2}}), None);
        propagate(&stores, &mut first, None, true).await.unwrap();

        let diff = json!({"doc": {"b": null}});
        let mut update = family_task("i-1", json!({"doc": {"a": 1}}), Some(diff));
        propagate(&stores, &mut update, None, false).await.unwrap();

        let entries = stores.shared("f-1").await.unwrap();
        // The stored value carries the tombstone for subscribers to apply
        assert_eq!(entries["doc"]["value"], json!({"a": 1, "b": null}));
    }
}
