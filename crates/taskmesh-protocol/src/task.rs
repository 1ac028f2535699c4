// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Task document: fixed namespaces plus free-form synchronized payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{Command, HubEnvelope, ProcessorEnvelope};

/// The unit of work coordinated by the hub.
///
/// All namespaces are optional on the wire: a processor usually sends a
/// partial view (a diff) rather than the full document. `null` values inside
/// a namespace are tombstones - "delete this key" in objects and "keep the
/// existing element" in arrays. The two meanings are intentional and must not
/// be confused (see the merge documentation in taskmesh-core).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    /// Dot-separated path identifying the task's position in the static
    /// configuration tree (e.g. `root.user.chat.start`). Immutable.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Globally unique identifier of one running occurrence. Immutable,
    /// never reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Identifier shared by a group of instances spawned together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,

    /// Identifier grouping the historical sequence of instances that
    /// represent the same conversation over time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// State-machine position plus transition bookkeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,

    /// Task configuration. Mostly free-form; the hub reads the rate-limit,
    /// error-routing and shared-access fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,

    /// Free-form request namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,

    /// Free-form response namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Free-form input namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Free-form output namespace; accumulated per-family by the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Free-form privacy namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<Value>,

    /// Reactive shared variables, propagated across the family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<Value>,

    /// Point-to-point connection declarations,
    /// `["<fromId>:<fromPath>", "<toId>:<toPath>"]` pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<Value>,

    /// Synchronization bookkeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<TaskMeta>,

    /// Set when task-function execution failed; routed to the nearest
    /// configured error task by the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Processor-side transport envelope. Stripped at the hub boundary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<ProcessorEnvelope>,

    /// The last command each connected processor asked for, keyed by
    /// processor id. Maintained by the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processors: Option<Map<String, Value>>,

    /// Hub-side transport envelope, written by the hub pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub: Option<HubEnvelope>,

    /// Forward-compatible catch-all for namespaces this version does not
    /// model (`user`, `permissions`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// The command currently carried in the processor envelope, if any.
    pub fn processor_command(&self) -> Option<Command> {
        self.processor.as_ref().and_then(|p| p.command)
    }

    /// The command currently carried in the hub envelope, if any.
    pub fn hub_command(&self) -> Option<Command> {
        self.hub.as_ref().and_then(|h| h.command)
    }

    /// Serialize into a JSON value for merging/diffing.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from a JSON value produced by a merge.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Mutable access to `meta`, creating it when absent.
    pub fn meta_mut(&mut self) -> &mut TaskMeta {
        self.meta.get_or_insert_with(TaskMeta::default)
    }
}

/// The task's state-machine position plus transition bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskState {
    /// Current state name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,

    /// Previous state name. Node-local, excluded from hashing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,

    /// Pending transition, set while a transition is in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_state: Option<String>,

    /// Whether the task has reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,

    /// State data this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The slice of `task.config` the hub itself interprets.
///
/// Everything else in `config` is owned by task-function logic and travels
/// through the flattened `extra` map untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Maximum accepted updates per UTC minute; absent disables the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_request_rate: Option<u32>,

    /// Absolute request ceiling; exceeding it attaches a soft error rather
    /// than rejecting the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_request_count: Option<u64>,

    /// Explicit error-handler task id, overriding the nearest-ancestor walk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_task: Option<String>,

    /// Access policy per shared variable name; `"read"` blocks writes from
    /// this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<Map<String, Value>>,

    /// Configuration this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskConfig {
    /// Whether this task only has read access to the given shared variable.
    pub fn shared_is_read_only(&self, var_name: &str) -> bool {
        self.shared
            .as_ref()
            .and_then(|s| s.get(var_name))
            .and_then(Value::as_str)
            .map(|access| access == "read")
            .unwrap_or(false)
    }
}

/// Synchronization bookkeeping carried in `task.meta`.
///
/// Never part of the hashed payload: the hash covers only the logically
/// synchronized document, while `meta` describes the synchronization itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskMeta {
    /// Hash of the synchronizable subset as last durably stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<u32>,

    /// Scoped hash over the slice of the previous state a diff touches,
    /// shipped alongside the diff for verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_diff: Option<u32>,

    /// Id of the parent task in the configuration tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Instance this one was spawned from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,

    /// Instances spawned from this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children_instances: Option<Vec<String>>,

    /// When the instance was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// When the instance last accepted an update. Drives lock expiry and
    /// the per-minute rate bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Total accepted requests for this instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_count: Option<u64>,

    /// Requests accepted within the current UTC minute bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_this_minute: Option<u32>,

    /// Advisory cross-processor lock: the processor id holding the lock.
    /// Expiry is computed from `updated_at`, so the lock travels with
    /// normal persistence instead of needing its own store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<String>,

    /// Whether this instance founded its family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub founder: Option<bool>,

    /// Namespaces changed by the last accepted update, as partial diffs.
    /// Consumed by the CEP layer to decide what to propagate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<Map<String, Value>>,

    /// Diagnostic copy of the sub-document the sender hashed, included for
    /// hash-mismatch debugging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_debug_diff: Option<Value>,

    /// Bookkeeping this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A captured task-function error, routed (not thrown) by the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskError {
    /// Human-readable description.
    pub message: String,

    /// Extra diagnostic fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_casing() {
        let task = Task {
            id: "root.user.chat".to_string(),
            instance_id: Some("i-1".to_string()),
            meta: Some(TaskMeta {
                requests_this_minute: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let value = task.to_value().unwrap();
        assert_eq!(value["instanceId"], json!("i-1"));
        assert_eq!(value["meta"]["requestsThisMinute"], json!(2));
        // Absent namespaces are absent on the wire, not null.
        assert!(value.get("shared").is_none());
    }

    #[test]
    fn test_task_round_trip_preserves_unknown_namespaces() {
        let value = json!({
            "id": "root.a",
            "user": {"id": "u-1"},
            "output": {"msg": "hi"}
        });
        let task = Task::from_value(value.clone()).unwrap();
        assert_eq!(task.extra.get("user"), Some(&json!({"id": "u-1"})));
        assert_eq!(task.to_value().unwrap(), value);
    }

    #[test]
    fn test_shared_read_only() {
        let config: TaskConfig = serde_json::from_value(json!({
            "shared": {"topic": "read", "notes": "write"}
        }))
        .unwrap();
        assert!(config.shared_is_read_only("topic"));
        assert!(!config.shared_is_read_only("notes"));
        assert!(!config.shared_is_read_only("absent"));
    }
}
