// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reactive propagation (CEP) over task families.
//!
//! Two mechanisms keep a family's instances consistent after every accepted
//! update:
//!
//! - [`shared`]: named variables mirrored across all instances that declare
//!   them, with family scope by default and hub-wide `system.` scope;
//! - [`connect`]: point-to-point `from:path -> to:path` bindings that copy a
//!   value from one instance into another whenever the source side changes.
//!
//! Both react to `meta.modified` and emit follow-up sync updates instead of
//! applying changes recursively. Every emitted update carries a `CEPSource`
//! tag, and the mechanism that emitted it skips its own updates on re-entry,
//! which is what bounds propagation cascades.

pub mod connect;
pub mod shared;

use serde_json::Value;
use taskmesh_protocol::{Command, CommandArgs, HubEnvelope, Task};

use crate::error::Result;
use crate::store::HubStores;

/// `CEPSource` tag for shared-variable updates.
pub const SOURCE_SHARED: &str = "CEPShared";
/// `CEPSource` tag for connection updates.
pub const SOURCE_CONNECT: &str = "CEPConnect";

/// Run both mechanisms over a merged task.
///
/// `is_init` marks the first population of a starting instance: shared
/// variables are pulled/seeded rather than diffed, and connections are
/// registered. Mutates `task` (init pulls, connection canonicalization) and
/// returns the sync updates targeting other instances.
pub async fn propagate(
    stores: &HubStores,
    task: &mut Task,
    cep_source: Option<&str>,
    is_init: bool,
) -> Result<Vec<Task>> {
    let mut followups = shared::propagate(stores, task, cep_source, is_init).await?;
    followups.extend(connect::propagate_bindings(stores, task, cep_source, is_init).await?);
    followups.extend(connect::propagate_output(stores, task).await?);
    Ok(followups)
}

/// Build the hub-internal sync update a CEP mechanism emits.
pub(crate) fn sync_update(instance_id: &str, sync_task: Value, cep_source: &str) -> Task {
    Task {
        hub: Some(HubEnvelope {
            command: Some(Command::Update),
            command_args: Some(CommandArgs {
                sync: true,
                instance_id: Some(instance_id.to_string()),
                sync_task: Some(sync_task),
                cep_source: Some(cep_source.to_string()),
                ..Default::default()
            }),
            source_processor_id: Some("hub".to_string()),
            request_id: None,
        }),
        ..Default::default()
    }
}
