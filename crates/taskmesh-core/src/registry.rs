// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task templates, hub-side task functions, and error-task routing.
//!
//! Task ids form a dot-separated hierarchy (`root.conversation.chat`). The
//! hierarchy is what makes error routing possible: when a task fails, the
//! failure is handed to the nearest `error` sibling found by walking up the
//! id tree.

use std::collections::HashMap;
use std::sync::Arc;

use taskmesh_protocol::Task;
use tracing::debug;

use crate::error::{HubError, Result};
use crate::store::HubStores;

/// A task executed by the hub itself rather than an external processor.
#[async_trait::async_trait]
pub trait TaskFunction: Send + Sync {
    /// Runs the function over the task and returns the updated task.
    async fn run(&self, task: Task) -> Result<Task>;
}

impl std::fmt::Debug for dyn TaskFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskFunction")
    }
}

/// Registry of hub-side task functions keyed by task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskFunction>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function for a task type, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, function: Arc<dyn TaskFunction>) {
        self.handlers.insert(task_type.into(), function);
    }

    /// Looks up the function for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskFunction>> {
        self.handlers.get(task_type).cloned()
    }

    /// The function for a task type, erroring when none is registered.
    pub fn require(&self, task_type: &str) -> Result<Arc<dyn TaskFunction>> {
        self.get(task_type).ok_or_else(|| HubError::UnknownTaskType {
            task_type: task_type.to_string(),
        })
    }
}

/// Seed task templates into the store at startup.
///
/// Templates define each task id's type, config, and initial namespaces.
/// Start commands instantiate from these.
pub async fn seed_templates(stores: &HubStores, templates: &[Task]) -> Result<()> {
    for template in templates {
        stores.set_task_template(template).await?;
        debug!(task_id = %template.id, "seeded task template");
    }
    Ok(())
}

/// Find the nearest error task in the id hierarchy of `task_id`.
///
/// Walks upward: first the failing task's `error` sibling, then its parent's,
/// and so on (`root.a.b.error`, `root.a.error`, `root.error`). `cap` bounds
/// the walk so malformed ids cannot loop. Returns `None` when no ancestor
/// level has an `error` task registered.
pub async fn find_closest_error_task(
    stores: &HubStores,
    task_id: &str,
    cap: usize,
) -> Result<Option<String>> {
    let mut segments: Vec<&str> = task_id.split('.').collect();
    let mut steps = 0;
    while segments.len() > 1 && steps < cap {
        let mut candidate_segments = segments.clone();
        *candidate_segments.last_mut().unwrap() = "error";
        let candidate = candidate_segments.join(".");
        if candidate != task_id && stores.task_template(&candidate).await?.is_some() {
            debug!(task_id, error_task = %candidate, "resolved error task");
            return Ok(Some(candidate));
        }
        segments.pop();
        steps += 1;
    }
    Ok(None)
}
