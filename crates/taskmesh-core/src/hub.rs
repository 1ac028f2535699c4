// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Hub: entry point tying stores, pipeline, and propagation together.
//!
//! [`Hub::process`] is the single externally visible operation: hand it a
//! task carrying a processor envelope and it runs the admission pipeline,
//! dispatches the command, then drains the propagation cascade the command
//! produced. Per-instance serialization happens here: the submission holds
//! its target's key through the pipeline, and every drained follow-up
//! holds its own target's key, so no two read-merge-write cycles for the
//! same instance ever interleave.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use taskmesh_protocol::{Task, TaskMessage};

use crate::command_handlers::{self, CommandContext};
use crate::config::HubConfig;
use crate::error::Result;
use crate::lock::SyncRegistry;
use crate::registry::{HandlerRegistry, TaskFunction, seed_templates};
use crate::store::{HubStores, MemoryStore, SqliteStore, Store};

/// Ceiling on follow-up commands drained per submission. The `CEPSource`
/// loop guard terminates well-formed cascades; this bounds malformed ones.
const MAX_CASCADE: usize = 64;

/// The task-synchronization hub.
pub struct Hub {
    ctx: CommandContext,
    sync: SyncRegistry,
}

impl Hub {
    /// Start building a hub.
    pub fn builder() -> HubBuilder {
        HubBuilder::default()
    }

    /// Typed access to the hub's stores.
    pub fn stores(&self) -> &HubStores {
        &self.ctx.stores
    }

    /// Process an externally submitted task.
    pub async fn process(&self, task: Task, request_id: Option<String>) -> Result<Task> {
        self.process_at(task, request_id, Utc::now()).await
    }

    /// Process with an explicit clock, for deterministic tests.
    pub async fn process_at(
        &self,
        task: Task,
        request_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let key = task
            .instance_id
            .clone()
            .unwrap_or_else(|| task.id.clone());
        let dispatch = {
            let _guard = self.sync.acquire(&key).await;
            command_handlers::process(&self.ctx, task, request_id, now).await?
        };

        // Drain the propagation cascade iteratively. Each follow-up targets
        // some other instance, so it takes that instance's key; the
        // submitter's guard is already released, which keeps the lock order
        // flat. A failed follow-up is logged and skipped; the accepted
        // command has already been applied.
        let mut queue: VecDeque<Task> = dispatch.followups.into();
        let mut steps = 0;
        while let Some(next) = queue.pop_front() {
            steps += 1;
            if steps > MAX_CASCADE {
                warn!(dropped = queue.len() + 1, "propagation cascade truncated");
                break;
            }
            let target = followup_key(&next);
            let _guard = self.sync.acquire(&target).await;
            match command_handlers::dispatch_command(&self.ctx, next, now).await {
                Ok(followup) => queue.extend(followup.followups),
                Err(err) => warn!(error = %err, "follow-up command failed"),
            }
        }
        if steps > 0 {
            debug!(steps, "propagation cascade drained");
        }
        Ok(dispatch.task)
    }

    /// Process a transport message, recording its session first.
    pub async fn process_message(&self, message: TaskMessage, request_id: Option<String>) -> Result<Task> {
        self.process_message_at(message, request_id, Utc::now()).await
    }

    /// [`Hub::process_message`] with an explicit clock, for deterministic
    /// tests.
    pub async fn process_message_at(
        &self,
        message: TaskMessage,
        request_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if let Some(session_id) = message.session_id.as_deref() {
            let record = json!({
                "taskId": message.task.id,
                "instanceId": message.task.instance_id,
                "address": message.address,
                "updatedAt": now,
            });
            self.ctx.stores.set_session(session_id, &record).await?;
        }
        self.process_at(message.task, request_id, now).await
    }
}

/// Serialization key of a hub-internal follow-up: the instance it writes.
fn followup_key(task: &Task) -> String {
    task.hub
        .as_ref()
        .and_then(|h| h.command_args.as_ref())
        .and_then(|a| a.instance_id.clone())
        .or_else(|| task.instance_id.clone())
        .unwrap_or_else(|| task.id.clone())
}

/// Builder assembling a [`Hub`] from its parts.
#[derive(Default)]
pub struct HubBuilder {
    store: Option<Arc<dyn Store>>,
    config: Option<HubConfig>,
    handlers: HandlerRegistry,
    templates: Vec<Task>,
}

impl HubBuilder {
    /// Use an explicit store backend instead of the configured default.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use an explicit configuration instead of reading the environment.
    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Register a hub-side task function for a task type.
    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        function: Arc<dyn TaskFunction>,
    ) -> Self {
        self.handlers.register(task_type, function);
        self
    }

    /// Seed task templates at startup.
    pub fn with_templates(mut self, templates: Vec<Task>) -> Self {
        self.templates.extend(templates);
        self
    }

    /// Assemble the hub, opening the store and seeding templates.
    pub async fn build(self) -> anyhow::Result<Hub> {
        let config = self.config.unwrap_or_default();
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => match config.database_url.as_deref() {
                Some(url) => {
                    let path = url.strip_prefix("sqlite:").unwrap_or(url);
                    Arc::new(SqliteStore::from_path(path).await?)
                }
                None => Arc::new(MemoryStore::new()),
            },
        };
        let stores = HubStores::new(store);
        seed_templates(&stores, &self.templates).await?;
        Ok(Hub {
            ctx: CommandContext::new(stores, config, Arc::new(self.handlers)),
            sync: SyncRegistry::new(),
        })
    }
}
