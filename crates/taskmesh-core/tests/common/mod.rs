// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for taskmesh-core integration tests.
//!
//! Provides TestContext wrapping an in-memory hub seeded with a small task
//! tree, plus helpers for building processor submissions.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use taskmesh_core::hub::Hub;
use taskmesh_core::{HubConfig, Result};
use taskmesh_protocol::{Command, CommandArgs, ProcessorEnvelope, Task};

/// Test context holding a hub seeded with the test task tree.
pub struct TestContext {
    pub hub: Hub,
}

/// The task templates every test starts from:
///
/// ```text
/// root
/// ├── chat        (shared topic, connection into summary)
/// ├── summary     (receives chat output over a connection)
/// ├── limited     (2 requests per minute)
/// ├── capped      (2 requests total)
/// ├── error       (family-wide error handler)
/// └── chat.error  (chat-specific error handler)
/// ```
pub fn templates() -> Vec<Task> {
    let raw = vec![
        json!({
            "id": "root.chat",
            "config": {"maxRequestRate": 100},
            "shared": {"topic": "default"},
            "connections": [["chat:output.text", "summary:input.text"]],
            "state": {"current": "start"}
        }),
        json!({
            "id": "root.summary",
            "state": {"current": "start"}
        }),
        json!({
            "id": "root.limited",
            "config": {"maxRequestRate": 2},
            "state": {"current": "start"}
        }),
        json!({
            "id": "root.capped",
            "config": {"maxRequestCount": 2},
            "state": {"current": "start"}
        }),
        json!({
            "id": "root.error",
            "state": {"current": "start"}
        }),
        json!({
            "id": "root.chat.error",
            "state": {"current": "start"}
        }),
    ];
    raw.into_iter()
        .map(|v| serde_json::from_value(v).expect("valid template"))
        .collect()
}

impl TestContext {
    /// Build a hub over an in-memory store with the test templates.
    pub async fn new() -> Self {
        Self::with_config(HubConfig::default()).await
    }

    /// Build with explicit configuration (lock expiry, routing cap).
    pub async fn with_config(config: HubConfig) -> Self {
        let hub = Hub::builder()
            .with_config(config)
            .with_templates(templates())
            .build()
            .await
            .expect("hub builds");
        Self { hub }
    }

    /// Submit a task at a fixed instant.
    pub async fn submit_at(&self, task: Task, now: DateTime<Utc>) -> Result<Task> {
        self.hub.process_at(task, None, now).await
    }

    /// Start a task id from a given processor and return the new instance.
    pub async fn start(&self, task_id: &str, processor_id: &str, now: DateTime<Utc>) -> Result<Task> {
        self.start_with_init(json!({ "id": task_id }), processor_id, now)
            .await
    }

    /// Start from an explicit init document (to join a family, seed shared
    /// variables, ...).
    pub async fn start_with_init(
        &self,
        init: Value,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let task = Task {
            processor: Some(ProcessorEnvelope {
                id: processor_id.to_string(),
                command: Some(Command::Start),
                command_args: Some(CommandArgs {
                    init: Some(init),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.submit_at(task, now).await
    }

    /// Fetch the stored replica for an instance.
    pub async fn stored(&self, instance_id: &str) -> Task {
        self.hub
            .stores()
            .instance(instance_id)
            .await
            .expect("store read")
            .expect("instance exists")
    }
}

/// Build an update submission carrying a partial document.
pub fn update_from(
    stored: &Task,
    processor_id: &str,
    partial: Value,
    args: CommandArgs,
) -> Task {
    let mut task: Task = serde_json::from_value(partial).expect("valid partial");
    task.id = stored.id.clone();
    task.instance_id = stored.instance_id.clone();
    task.family_id = stored.family_id.clone();
    task.thread_id = stored.thread_id.clone();
    task.processor = Some(ProcessorEnvelope {
        id: processor_id.to_string(),
        command: Some(Command::Update),
        command_args: Some(args),
        ..Default::default()
    });
    task
}

/// A fixed instant so rate buckets and lock expiry are deterministic.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
        .expect("valid instant")
        .with_timezone(&Utc)
}
