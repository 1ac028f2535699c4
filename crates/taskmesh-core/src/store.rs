// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for taskmesh-core.
//!
//! All hub state lives in namespaced JSON documents behind the [`Store`]
//! trait. Namespaces:
//!
//! | Namespace     | Key           | Value                                     |
//! |---------------|---------------|-------------------------------------------|
//! | `instances`   | instance id   | full [`Task`] document                    |
//! | `tasks`       | task id       | task template from the type registry      |
//! | `threads`     | thread id     | instance ids started under the thread     |
//! | `families`    | family id     | map of task id to instance id             |
//! | `outputs`     | family id     | map of `<task.id>.output` to output value |
//! | `shared`      | family id     | shared variable entries for the family    |
//! | `connections` | family id     | path bindings registered by the family    |
//! | `sessions`    | session id    | ephemeral transport session record        |
//!
//! [`MemoryStore`] backs tests and single-node deployments; [`SqliteStore`]
//! persists across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use taskmesh_protocol::Task;

use crate::error::{HubError, Result};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Namespace for durable task instances.
pub const NS_INSTANCES: &str = "instances";
/// Namespace for task templates keyed by task id.
pub const NS_TASKS: &str = "tasks";
/// Namespace for thread membership.
pub const NS_THREADS: &str = "threads";
/// Namespace for family membership.
pub const NS_FAMILIES: &str = "families";
/// Namespace for accumulated task outputs per family.
pub const NS_OUTPUTS: &str = "outputs";
/// Namespace for shared variable entries per family.
pub const NS_SHARED: &str = "shared";
/// Namespace for connection bindings per family.
pub const NS_CONNECTIONS: &str = "connections";
/// Namespace for transport session records.
pub const NS_SESSIONS: &str = "sessions";

/// Namespaced JSON document storage.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Fetch the document stored under `namespace`/`key`.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Store a document under `namespace`/`key`, replacing any previous one.
    async fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<()>;

    /// Remove the document under `namespace`/`key` if present.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// List all keys in a namespace.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory store. State is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    namespaces: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a SQLite store from a file path.
    ///
    /// Creates parent directories and the database file if missing, then
    /// runs migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| HubError::Store {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| HubError::Store {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| HubError::Store {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM documents
            WHERE namespace = ? AND key = ?
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO documents (namespace, key, value, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (namespace, key)
            DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM documents
            WHERE namespace = ? AND key = ?
            "#,
        )
        .bind(namespace)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT key FROM documents
            WHERE namespace = ?
            ORDER BY key
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

// ============================================================================
// Typed accessors
// ============================================================================

/// Typed view over the hub's namespaces.
#[derive(Clone)]
pub struct HubStores {
    store: Arc<dyn Store>,
}

impl HubStores {
    /// Wraps a backend in the typed namespace accessors.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying backend.
    pub fn raw(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Durable instance by id.
    pub async fn instance(&self, instance_id: &str) -> Result<Option<Task>> {
        match self.store.get(NS_INSTANCES, instance_id).await? {
            Some(value) => Ok(Some(Task::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Durable instance, erroring when absent.
    pub async fn require_instance(&self, instance_id: &str) -> Result<Task> {
        self.instance(instance_id)
            .await?
            .ok_or_else(|| HubError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Persist a task instance keyed by its instance id.
    pub async fn set_instance(&self, task: &Task) -> Result<()> {
        let instance_id = task.instance_id.as_deref().ok_or_else(|| HubError::Validation {
            field: "instanceId".to_string(),
            message: "task has no instance id".to_string(),
        })?;
        let value = task.to_value()?;
        self.store.set(NS_INSTANCES, instance_id, &value).await
    }

    /// Task template by dot-separated task id.
    pub async fn task_template(&self, task_id: &str) -> Result<Option<Task>> {
        match self.store.get(NS_TASKS, task_id).await? {
            Some(value) => Ok(Some(Task::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a task template.
    pub async fn set_task_template(&self, task: &Task) -> Result<()> {
        let value = task.to_value()?;
        self.store.set(NS_TASKS, &task.id, &value).await
    }

    /// Family membership: task id to instance id.
    pub async fn family(&self, family_id: &str) -> Result<Map<String, Value>> {
        Ok(self
            .store
            .get(NS_FAMILIES, family_id)
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }

    /// Record an instance under its family.
    pub async fn add_to_family(&self, family_id: &str, task_id: &str, instance_id: &str) -> Result<()> {
        let mut members = self.family(family_id).await?;
        members.insert(task_id.to_string(), Value::String(instance_id.to_string()));
        self.store
            .set(NS_FAMILIES, family_id, &Value::Object(members))
            .await
    }

    /// Accumulated outputs for a family, keyed by `<task.id>.output`.
    pub async fn outputs(&self, family_id: &str) -> Result<Map<String, Value>> {
        Ok(self
            .store
            .get(NS_OUTPUTS, family_id)
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }

    /// Replace a family's accumulated outputs.
    pub async fn set_outputs(&self, family_id: &str, outputs: &Map<String, Value>) -> Result<()> {
        self.store
            .set(NS_OUTPUTS, family_id, &Value::Object(outputs.clone()))
            .await
    }

    /// Shared variable entries for a family: variable name to entry object.
    pub async fn shared(&self, family_id: &str) -> Result<Map<String, Value>> {
        Ok(self
            .store
            .get(NS_SHARED, family_id)
            .await?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }

    /// Replace a family's shared variable entries.
    pub async fn set_shared(&self, family_id: &str, entries: &Map<String, Value>) -> Result<()> {
        self.store
            .set(NS_SHARED, family_id, &Value::Object(entries.clone()))
            .await
    }

    /// Connection bindings registered by a family.
    pub async fn connections(&self, family_id: &str) -> Result<Vec<Value>> {
        Ok(self
            .store
            .get(NS_CONNECTIONS, family_id)
            .await?
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default())
    }

    /// Replace a family's connection bindings.
    pub async fn set_connections(&self, family_id: &str, bindings: &[Value]) -> Result<()> {
        self.store
            .set(NS_CONNECTIONS, family_id, &Value::Array(bindings.to_vec()))
            .await
    }

    /// Transport session record by session id.
    pub async fn session(&self, session_id: &str) -> Result<Option<Value>> {
        self.store.get(NS_SESSIONS, session_id).await
    }

    /// Record a transport session.
    pub async fn set_session(&self, session_id: &str, record: &Value) -> Result<()> {
        self.store.set(NS_SESSIONS, session_id, record).await
    }

    /// Forget a transport session.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.store.delete(NS_SESSIONS, session_id).await
    }

    /// Instance ids started under a thread.
    pub async fn thread_members(&self, thread_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .get(NS_THREADS, thread_id)
            .await?
            .and_then(|v| v.as_array().cloned())
            .map(|items| {
                items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Record an instance under its thread.
    pub async fn add_to_thread(&self, thread_id: &str, instance_id: &str) -> Result<()> {
        let mut members = self.thread_members(thread_id).await?;
        if !members.iter().any(|m| m == instance_id) {
            members.push(instance_id.to_string());
        }
        let value = Value::Array(members.into_iter().map(Value::String).collect());
        self.store.set(NS_THREADS, thread_id, &value).await
    }
}
