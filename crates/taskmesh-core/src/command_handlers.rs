// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command pipeline handlers for taskmesh-core.
//!
//! Every task a processor submits runs the same fixed sequence before its
//! command is dispatched:
//!
//! ```text
//! transfer_command -> check_lock_conflict -> check_api_rate
//!     -> process_error -> process_output -> dispatch
//! ```
//!
//! Handlers never execute CEP fan-out themselves. They return the follow-up
//! sync updates in [`Dispatch::followups`] and the hub drains them as a work
//! queue, so propagation cascades are iterative rather than recursive.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskmesh_protocol::{Command, CommandArgs, HubEnvelope, Task, TaskError};

use crate::cep;
use crate::config::HubConfig;
use crate::document::{deep_merge, get_object_difference, strip_nulls};
use crate::error::{HubError, Result};
use crate::hash::{check_hash_diff, task_hash};
use crate::registry::{HandlerRegistry, find_closest_error_task};
use crate::store::HubStores;

/// Top-level keys that never participate in merge bookkeeping: identity and
/// transport, not synchronized state.
const NON_SYNC_KEYS: &[&str] = &[
    "id",
    "instanceId",
    "familyId",
    "threadId",
    "meta",
    "processor",
    "processors",
    "hub",
];

/// Shared state for command handlers.
pub struct CommandContext {
    /// Typed access to the hub's stores.
    pub stores: HubStores,
    /// Pipeline configuration.
    pub config: HubConfig,
    /// Hub-side task functions keyed by task type.
    pub handlers: Arc<HandlerRegistry>,
}

impl CommandContext {
    /// Create a new command context.
    pub fn new(stores: HubStores, config: HubConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            stores,
            config,
            handlers,
        }
    }
}

/// Result of dispatching one command.
pub struct Dispatch {
    /// The task after the command was applied.
    pub task: Task,
    /// Hub-internal follow-up commands (CEP sync updates, successor starts).
    pub followups: Vec<Task>,
}

impl Dispatch {
    fn done(task: Task) -> Self {
        Self {
            task,
            followups: Vec::new(),
        }
    }
}

// ============================================================================
// Pipeline steps
// ============================================================================

/// Move the processor envelope's command into the hub envelope.
///
/// The processor's `command`/`commandArgs` are cleared so a later broadcast
/// of the task cannot re-trigger the command, and the sender's envelope is
/// recorded in `task.processors` under its processor id.
pub fn transfer_command(
    task: &mut Task,
    stored: Option<&Task>,
    request_id: Option<String>,
) -> Result<()> {
    let processor = task.processor.as_mut().ok_or_else(|| HubError::Validation {
        field: "processor".to_string(),
        message: "missing task.processor envelope".to_string(),
    })?;
    let command = processor.command.take().ok_or_else(|| HubError::UnknownCommand {
        received: "none".to_string(),
    })?;
    let command_args = processor.command_args.take().unwrap_or_default();
    let source_processor_id = processor.id.clone();

    let mut processors = stored
        .and_then(|t| t.processors.clone())
        .unwrap_or_default();
    processors.insert(
        source_processor_id.clone(),
        serde_json::to_value(&*processor)?,
    );
    task.processors = Some(processors);

    task.hub = Some(HubEnvelope {
        command: Some(command),
        command_args: Some(command_args),
        source_processor_id: Some(source_processor_id),
        request_id,
    });
    Ok(())
}

/// Enforce the advisory cross-processor lock.
///
/// Expiry is measured against the stored instance's `meta.updatedAt`; an
/// instance that never recorded an update counts as expired. A stale lock is
/// overridden with a warning but NOT transferred to the new sender - the
/// holder may still come back.
pub fn check_lock_conflict(
    task: &mut Task,
    stored: Option<&Task>,
    expiry_minutes: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let args = match task.hub.as_ref() {
        Some(hub) => hub.args(),
        None => return Ok(()),
    };
    let sender = task
        .hub
        .as_ref()
        .and_then(|h| h.source_processor_id.clone())
        .unwrap_or_default();
    let held_by = stored.and_then(|t| t.meta.as_ref()).and_then(|m| m.locked.clone());

    if args.unlock {
        task.meta_mut().locked = None;
    }

    match held_by {
        None => {
            if args.lock {
                task.meta_mut().locked = Some(sender.clone());
                info!(task_id = %task.id, processor_id = %sender, "lock taken");
            }
        }
        Some(holder) if holder == sender => {
            // The holder is updating its own locked task; release on write.
            task.meta_mut().locked = None;
        }
        Some(holder) => {
            if args.lock_bypass || args.unlock {
                return Ok(());
            }
            let updated_at = stored
                .and_then(|t| t.meta.as_ref())
                .and_then(|m| m.updated_at);
            let expired = match updated_at {
                Some(at) => now - at > Duration::minutes(expiry_minutes),
                None => true,
            };
            if expired {
                warn!(
                    task_id = %task.id,
                    processor_id = %sender,
                    locked_by = %holder,
                    "stale lock overridden"
                );
            } else {
                debug!(
                    task_id = %task.id,
                    processor_id = %sender,
                    locked_by = %holder,
                    "lock conflict"
                );
                return Err(HubError::LockConflict {
                    instance_id: task.instance_id.clone().unwrap_or_default(),
                    locked_by: holder,
                });
            }
        }
    }
    Ok(())
}

fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), now.minute(), 0)
        .single()
        .unwrap_or(now)
}

/// Enforce per-minute rate and absolute request-count limits.
///
/// The rate limit rejects the request outright; the count limit attaches a
/// soft error so the failure is routed through the error-task mechanism
/// instead of being dropped at the transport.
pub fn check_api_rate(task: &mut Task, stored: Option<&Task>, now: DateTime<Utc>) -> Result<()> {
    let config = stored.and_then(|t| t.config.clone()).or_else(|| task.config.clone());
    let stored_meta = stored.and_then(|t| t.meta.clone()).unwrap_or_default();

    if let Some(max_rate) = config.as_ref().and_then(|c| c.max_request_rate) {
        let bucket_start = minute_floor(now);
        let in_bucket = stored_meta
            .updated_at
            .map(|at| at >= bucket_start)
            .unwrap_or(false);
        let mut this_minute = if in_bucket {
            stored_meta.requests_this_minute.unwrap_or(0)
        } else {
            0
        };
        if in_bucket && this_minute >= max_rate {
            return Err(HubError::RateLimitExceeded {
                max_request_rate: max_rate,
            });
        }
        this_minute += 1;
        task.meta_mut().requests_this_minute = Some(this_minute);
    }

    // The ceiling is checked against the stored count; the counter still
    // advances so the overflow is visible in the persisted instance.
    let request_count = stored_meta.request_count.unwrap_or(0);
    if let Some(max_count) = config.as_ref().and_then(|c| c.max_request_count)
        && request_count > max_count
    {
        warn!(task_id = %task.id, request_count, max_count, "request count exceeded");
        task.error = Some(TaskError::new(format!(
            "Task request count of {} exceeded.",
            max_count
        )));
    }
    task.meta_mut().request_count = Some(request_count + 1);
    Ok(())
}

/// Reroute a task carrying an error to its error-handler task.
///
/// The explicit `config.errorTask` wins; otherwise the nearest `error`
/// sibling in the id hierarchy is used. A task with an error but no
/// reachable error task is unroutable.
pub async fn process_error(ctx: &CommandContext, task: &mut Task) -> Result<()> {
    if task.error.is_none() {
        return Ok(());
    }
    let error_task = match task.config.as_ref().and_then(|c| c.error_task.clone()) {
        Some(explicit) => Some(explicit),
        None => {
            find_closest_error_task(&ctx.stores, &task.id, ctx.config.error_routing_cap).await?
        }
    };
    let Some(error_task) = error_task else {
        return Err(HubError::UnroutableTask {
            task_id: task.id.clone(),
        });
    };
    info!(task_id = %task.id, error_task = %error_task, "rerouting errored task");
    let hub = task.hub.get_or_insert_with(HubEnvelope::default);
    hub.command = Some(Command::Error);
    hub.command_args = Some(CommandArgs {
        error_task: Some(error_task),
        ..Default::default()
    });
    Ok(())
}

/// Accumulate the task's output under its family.
///
/// Outputs are keyed `<task.id>.output` so successor tasks in the family can
/// reference any predecessor's results by id.
pub async fn process_output(ctx: &CommandContext, task: &Task) -> Result<()> {
    let Some(output) = task.output.as_ref() else {
        return Ok(());
    };
    let Some(family_id) = task.family_id.as_deref() else {
        return Ok(());
    };
    let mut outputs = ctx.stores.outputs(family_id).await?;
    outputs.insert(format!("{}.output", task.id), output.clone());
    ctx.stores.set_outputs(family_id, &outputs).await
}

// ============================================================================
// Entry point
// ============================================================================

/// Run the full pipeline over an externally submitted task.
///
/// Hub-internal follow-ups (CEP sync updates) do not re-enter here; they go
/// straight to [`dispatch_command`] because they already carry a hub
/// envelope and must not be rate-limited or lock-checked.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn process(
    ctx: &CommandContext,
    mut task: Task,
    request_id: Option<String>,
    now: DateTime<Utc>,
) -> Result<Dispatch> {
    // 1. Load the stored replica, if the task refers to one
    let stored = match task.instance_id.as_deref() {
        Some(instance_id) => ctx.stores.instance(instance_id).await?,
        None => None,
    };

    // 2. Move the command from the processor envelope to the hub envelope
    transfer_command(&mut task, stored.as_ref(), request_id)?;
    let args = task.hub.as_ref().map(HubEnvelope::args).unwrap_or_default();

    // 3. Admission checks; internally generated syncs bypass both
    if !args.sync {
        check_lock_conflict(&mut task, stored.as_ref(), ctx.config.lock_expiry_minutes, now)?;
        check_api_rate(&mut task, stored.as_ref(), now)?;
    }

    // 4. Reroute on error (including the soft rate-count error)
    process_error(ctx, &mut task).await?;

    // 5. Record output before the command may replace the task
    process_output(ctx, &task).await?;

    // 6. Dispatch
    dispatch_command(ctx, task, now).await
}

/// Dispatch a task on its hub command.
pub async fn dispatch_command(
    ctx: &CommandContext,
    mut task: Task,
    now: DateTime<Utc>,
) -> Result<Dispatch> {
    match task.hub_command() {
        Some(Command::Start) => command_start(ctx, task, now).await,
        Some(Command::Update) | Some(Command::Sync) => command_update(ctx, task, now).await,
        Some(Command::Error) => command_error(ctx, task, now).await,
        Some(Command::Partial) => command_partial(ctx, task, now).await,
        Some(Command::Init) => command_init(ctx, task).await,
        Some(Command::Ping) => {
            if let Some(hub) = task.hub.as_mut() {
                hub.command = Some(Command::Pong);
            }
            Ok(Dispatch::done(task))
        }
        Some(Command::Pong) => Ok(Dispatch::done(task)),
        None => Err(HubError::UnknownCommand {
            received: "none".to_string(),
        }),
    }
}

// ============================================================================
// start
// ============================================================================

/// Instantiate a task template as a new running instance.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn command_start(ctx: &CommandContext, task: Task, now: DateTime<Utc>) -> Result<Dispatch> {
    let args = task.hub.as_ref().map(HubEnvelope::args).unwrap_or_default();

    // The seed document: explicit init, or just the id carried in the args
    let init = match args.init.clone() {
        Some(init) => init,
        None => match args.extra.get("id").and_then(Value::as_str) {
            Some(id) => json!({ "id": id }),
            None => {
                return Err(HubError::Validation {
                    field: "commandArgs.init".to_string(),
                    message: "start needs an init document or a task id".to_string(),
                });
            }
        },
    };
    let new_task_id = init
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::Validation {
            field: "init.id".to_string(),
            message: "init document has no task id".to_string(),
        })?
        .to_string();

    let template = ctx
        .stores
        .task_template(&new_task_id)
        .await?
        .ok_or_else(|| HubError::UnknownTaskId {
            task_id: new_task_id.clone(),
        })?;

    // Instantiate: template under the seed document
    let merged = deep_merge(&template.to_value()?, &init);
    let mut new_task = Task::from_value(strip_nulls(merged))?;
    let instance_id = Uuid::new_v4().to_string();
    new_task.instance_id = Some(instance_id.clone());

    // Lineage: the instance this one descends from
    let prev_instance_id = args.prev_instance_id.clone().or_else(|| task.instance_id.clone());
    let prev = match prev_instance_id.as_deref() {
        Some(prev_id) => ctx.stores.instance(prev_id).await?,
        None => None,
    };

    // Family resolution: predecessor's family, then the seed's, then founder
    let family_id = prev
        .as_ref()
        .and_then(|p| p.family_id.clone())
        .or_else(|| new_task.family_id.clone())
        .unwrap_or_else(|| instance_id.clone());
    let founder = prev.as_ref().and_then(|p| p.family_id.as_ref()).is_none()
        && new_task.family_id.is_none();
    new_task.family_id = Some(family_id.clone());

    let thread_id = prev
        .as_ref()
        .and_then(|p| p.thread_id.clone())
        .or_else(|| new_task.thread_id.clone())
        .unwrap_or_else(|| instance_id.clone());
    new_task.thread_id = Some(thread_id.clone());

    {
        let meta = new_task.meta_mut();
        meta.created_at = Some(now);
        meta.updated_at = Some(now);
        meta.request_count = meta.request_count.or(Some(0));
        meta.requests_this_minute = meta.requests_this_minute.or(Some(0));
        meta.locked = None;
        meta.founder = Some(founder);
        meta.parent_instance_id = prev_instance_id.clone();
        if let Some(prev) = prev.as_ref() {
            meta.parent_id = Some(prev.id.clone());
        }
    }

    // Link the predecessor to its new child
    if let Some(mut prev_task) = prev {
        let children = prev_task
            .meta_mut()
            .children_instances
            .get_or_insert_with(Vec::new);
        children.push(instance_id.clone());
        ctx.stores.set_instance(&prev_task).await?;
    }

    futures::try_join!(
        ctx.stores.add_to_family(&family_id, &new_task.id, &instance_id),
        ctx.stores.add_to_thread(&thread_id, &instance_id),
    )?;

    // Hub-side task functions run at instantiation
    if let Some(task_type) = new_task
        .config
        .as_ref()
        .and_then(|c| c.extra.get("type"))
        .and_then(Value::as_str)
        && let Some(function) = ctx.handlers.get(task_type)
    {
        debug!(task_id = %new_task.id, task_type, "running hub task function");
        new_task = function.run(new_task).await?;
    }

    // CEP seeding: pull shared values the family already holds and register
    // this instance for future propagation
    let followups = cep::propagate(&ctx.stores, &mut new_task, None, true).await?;

    new_task.hub = Some(HubEnvelope {
        command: Some(Command::Start),
        command_args: None,
        source_processor_id: task.hub.as_ref().and_then(|h| h.source_processor_id.clone()),
        request_id: task.hub.as_ref().and_then(|h| h.request_id.clone()),
    });
    new_task.meta_mut().hash = Some(task_hash(&new_task)?);
    ctx.stores.set_instance(&new_task).await?;

    info!(task_id = %new_task.id, instance_id = %instance_id, family_id = %family_id, "started task");
    Ok(Dispatch {
        task: new_task,
        followups,
    })
}

// ============================================================================
// update / sync
// ============================================================================

fn sync_namespaces(diff: &Value) -> Vec<String> {
    match diff {
        Value::Object(map) => map
            .keys()
            .filter(|k| !NON_SYNC_KEYS.contains(&k.as_str()))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// Final lock holder after an accepted update.
///
/// Computed explicitly rather than through the merge: `None` cannot travel
/// as a typed field, so clearing a lock via tombstone would be lost.
fn resolve_lock(stored: &Task, args: &CommandArgs, sender: &str) -> Option<String> {
    let held_by = stored.meta.as_ref().and_then(|m| m.locked.as_deref());
    if args.unlock {
        return None;
    }
    match held_by {
        Some(holder) if holder == sender => None,
        Some(holder) => Some(holder.to_string()),
        None if args.lock => Some(sender.to_string()),
        None => None,
    }
}

/// Drop writes to shared variables the task only has read access to.
fn enforce_shared_access(task_id: &str, stored: &Task, diff: &mut Value) {
    let Some(config) = stored.config.as_ref() else { return };
    let Some(Value::Object(shared)) = diff.get_mut("shared") else {
        return;
    };
    let denied: Vec<String> = shared
        .keys()
        .filter(|var| config.shared_is_read_only(var))
        .cloned()
        .collect();
    for var in denied {
        warn!(task_id, var_name = %var, "write to read-only shared variable dropped");
        shared.remove(&var);
    }
}

/// Merge a partial update (or an internal sync) over the stored instance.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn command_update(ctx: &CommandContext, task: Task, now: DateTime<Utc>) -> Result<Dispatch> {
    let args = task.hub.as_ref().map(HubEnvelope::args).unwrap_or_default();
    let instance_id = args
        .instance_id
        .clone()
        .or_else(|| task.instance_id.clone())
        .ok_or_else(|| HubError::Validation {
            field: "instanceId".to_string(),
            message: "update needs a target instance".to_string(),
        })?;
    let stored = ctx.stores.require_instance(&instance_id).await?;
    let stored_value = stored.to_value()?;

    // The partial document to merge: either the sync payload or the task
    // itself as sent by the processor
    let mut diff = if args.sync {
        args.sync_task.clone().ok_or_else(|| HubError::Validation {
            field: "commandArgs.syncTask".to_string(),
            message: "sync update has no payload".to_string(),
        })?
    } else {
        task.to_value()?
    };

    if !args.sync {
        check_hash_diff(&stored, &diff, &instance_id)?;
        enforce_shared_access(&task.id, &stored, &mut diff);
    }

    // What actually changes, namespace by namespace; drives CEP and no-op
    // suppression
    let real_diff = get_object_difference(&stored_value, &diff);
    let mut modified = Map::new();
    if let Some(Value::Object(real)) = real_diff.as_ref() {
        for ns in sync_namespaces(&diff) {
            if let Some(changed) = real.get(&ns) {
                modified.insert(ns, changed.clone());
            }
        }
    }

    let merged_value = deep_merge(&stored_value, &diff);
    let mut merged = Task::from_value(strip_nulls(merged_value.clone()))?;
    merged.instance_id = Some(instance_id.clone());
    merged.processor = None;
    merged.hub = task.hub.clone();
    {
        let sender = task
            .hub
            .as_ref()
            .and_then(|h| h.source_processor_id.clone())
            .unwrap_or_default();
        let lock = if args.sync {
            stored.meta.as_ref().and_then(|m| m.locked.clone())
        } else {
            resolve_lock(&stored, &args, &sender)
        };
        let meta = merged.meta_mut();
        meta.updated_at = Some(now);
        meta.locked = lock;
        meta.modified = if modified.is_empty() {
            None
        } else {
            Some(modified)
        };
    }

    if args.done {
        return done_task(ctx, merged).await;
    }

    // CEP runs over the merged document (pre-strip semantics are preserved
    // in meta.modified, which carries the tombstones)
    let followups = cep::propagate(
        &ctx.stores,
        &mut merged,
        args.cep_source.as_deref(),
        false,
    )
    .await?;

    merged.meta_mut().hash = Some(task_hash(&merged)?);
    ctx.stores.set_instance(&merged).await?;
    debug!(instance_id = %instance_id, sync = args.sync, "updated task");

    Ok(Dispatch {
        task: merged,
        followups,
    })
}

/// Terminal update: persist the final state and start the successor.
async fn done_task(ctx: &CommandContext, mut task: Task) -> Result<Dispatch> {
    let args = task.hub.as_ref().map(HubEnvelope::args).unwrap_or_default();
    let state = task.state.get_or_insert_with(Default::default);
    state.done = Some(true);
    task.meta_mut().locked = None;
    task.meta_mut().hash = Some(task_hash(&task)?);
    ctx.stores.set_instance(&task).await?;
    info!(task_id = %task.id, next = ?args.next_task_id, "task done");

    let mut followups = Vec::new();
    if let Some(next_task_id) = args.next_task_id {
        let mut successor = Task {
            id: task.id.clone(),
            instance_id: task.instance_id.clone(),
            family_id: task.family_id.clone(),
            thread_id: task.thread_id.clone(),
            ..Default::default()
        };
        successor.hub = Some(HubEnvelope {
            command: Some(Command::Start),
            command_args: Some(CommandArgs {
                init: Some(json!({
                    "id": next_task_id,
                    "familyId": task.family_id,
                    "threadId": task.thread_id,
                })),
                prev_instance_id: task.instance_id.clone(),
                ..Default::default()
            }),
            source_processor_id: task.hub.as_ref().and_then(|h| h.source_processor_id.clone()),
            request_id: None,
        });
        followups.push(successor);
    }
    Ok(Dispatch { task, followups })
}

// ============================================================================
// error
// ============================================================================

/// Persist an errored instance and start its error-handler task.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn command_error(ctx: &CommandContext, mut task: Task, _now: DateTime<Utc>) -> Result<Dispatch> {
    let args = task.hub.as_ref().map(HubEnvelope::args).unwrap_or_default();
    let error_task_id = args.error_task.clone().ok_or_else(|| HubError::UnroutableTask {
        task_id: task.id.clone(),
    })?;
    let error = task
        .error
        .clone()
        .unwrap_or_else(|| TaskError::new("unknown error"));

    // The failing instance is finished; its error task carries on
    task.state.get_or_insert_with(Default::default).done = Some(true);
    task.meta_mut().locked = None;
    if task.instance_id.is_some() {
        ctx.stores.set_instance(&task).await?;
    }

    let text = format!("{} from task.id {}", error.message, task.id);
    let mut successor = Task {
        id: task.id.clone(),
        instance_id: task.instance_id.clone(),
        family_id: task.family_id.clone(),
        thread_id: task.thread_id.clone(),
        ..Default::default()
    };
    successor.hub = Some(HubEnvelope {
        command: Some(Command::Start),
        command_args: Some(CommandArgs {
            init: Some(json!({
                "id": error_task_id,
                "familyId": task.family_id,
                "threadId": task.thread_id,
                "response": { "text": text, "error": serde_json::to_value(&error)? },
            })),
            prev_instance_id: task.instance_id.clone(),
            ..Default::default()
        }),
        source_processor_id: task.hub.as_ref().and_then(|h| h.source_processor_id.clone()),
        request_id: None,
    });
    info!(task_id = %task.id, error_task = %error_task_id, "routing error");
    Ok(Dispatch {
        task,
        followups: vec![successor],
    })
}

// ============================================================================
// partial / init
// ============================================================================

/// Merge a partial view without hash verification or CEP fan-out.
///
/// Used for high-frequency incremental payloads (token streams) where the
/// verification cost would dominate.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn command_partial(ctx: &CommandContext, task: Task, now: DateTime<Utc>) -> Result<Dispatch> {
    let instance_id = task.instance_id.clone().ok_or_else(|| HubError::Validation {
        field: "instanceId".to_string(),
        message: "partial needs a target instance".to_string(),
    })?;
    let stored = ctx.stores.require_instance(&instance_id).await?;
    let merged_value = deep_merge(&stored.to_value()?, &task.to_value()?);
    let mut merged = Task::from_value(strip_nulls(merged_value))?;
    merged.instance_id = Some(instance_id);
    merged.processor = None;
    merged.hub = task.hub.clone();
    merged.meta_mut().updated_at = Some(now);
    ctx.stores.set_instance(&merged).await?;
    Ok(Dispatch::done(merged))
}

/// Re-seed a running instance's shared variables from the store.
#[instrument(skip(ctx, task), fields(task_id = %task.id))]
pub async fn command_init(ctx: &CommandContext, task: Task) -> Result<Dispatch> {
    let instance_id = task.instance_id.clone().ok_or_else(|| HubError::Validation {
        field: "instanceId".to_string(),
        message: "init needs a target instance".to_string(),
    })?;
    let mut stored = ctx.stores.require_instance(&instance_id).await?;
    let followups = cep::propagate(&ctx.stores, &mut stored, None, true).await?;
    ctx.stores.set_instance(&stored).await?;
    Ok(Dispatch {
        task: stored,
        followups,
    })
}
