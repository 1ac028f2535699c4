// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command values and the processor/hub transport envelopes.
//!
//! Envelopes are stripped or translated at each hop and never become part of
//! the synchronized payload: `task.processor` is what a processor sends,
//! `task.hub` is what the hub pipeline acts on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::task::Task;

/// The commands the hub dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Instantiate a task definition as a new instance.
    Start,
    /// Merge a processor's partial view over the stored instance.
    Update,
    /// Internally generated update; bypasses locks and breaks CEP loops.
    Sync,
    /// Route the instance to its error-handler task.
    Error,
    /// Partial view without hash verification (no CEP fan-out).
    Partial,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Internal first-population of a starting instance (CEP seeding).
    Init,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Update => "update",
            Self::Sync => "sync",
            Self::Error => "error",
            Self::Partial => "partial",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Init => "init",
        };
        write!(f, "{}", name)
    }
}

/// Arguments accompanying a [`Command`].
///
/// All fields are optional on the wire; `false`/absent are equivalent for
/// the boolean flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandArgs {
    /// Request the advisory document lock for the sending processor.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,

    /// Release the advisory document lock.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unlock: bool,

    /// Ignore a foreign advisory lock for this one request.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub lock_bypass: bool,

    /// Marks an internally generated update (lock-bypassing, loop-breaking).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,

    /// The partial document a sync update merges over the target instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_task: Option<Value>,

    /// Target instance of a sync update (may differ from the carrier task).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Which CEP mechanism generated this sync update; the same mechanism
    /// skips it on re-entry to prevent infinite reflection.
    #[serde(rename = "CEPSource", skip_serializing_if = "Option::is_none")]
    pub cep_source: Option<String>,

    /// Resolved error-handler task id, set by error routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_task: Option<String>,

    /// Seed document for a `start` command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<Value>,

    /// Marks an update that terminates the instance.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,

    /// Task id to start as the successor of a done instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_task_id: Option<String>,

    /// Instance the successor descends from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_instance_id: Option<String>,

    /// Arguments this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Transport envelope a processor attaches to a task it sends to the hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorEnvelope {
    /// Identifier of the sending processor.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// The requested command; cleared by the hub on transfer so it is not
    /// accidentally re-broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    /// Arguments for the requested command; cleared on transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_args: Option<CommandArgs>,

    /// Envelope fields this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hub-internal envelope produced by command transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubEnvelope {
    /// The command the pipeline dispatches on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    /// Deep-copied arguments from the processor envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_args: Option<CommandArgs>,

    /// The processor the command originated from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_processor_id: Option<String>,

    /// Transport-level request correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl HubEnvelope {
    /// The envelope's arguments, or a default when absent.
    pub fn args(&self) -> CommandArgs {
        self.command_args.clone().unwrap_or_default()
    }
}

/// Outer message exchanged at the transport boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskMessage {
    /// Session established by the transport layer, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Routing address, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// The task document being exchanged.
    pub task: Task,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_values() {
        assert_eq!(serde_json::to_value(Command::Start).unwrap(), json!("start"));
        assert_eq!(serde_json::to_value(Command::Sync).unwrap(), json!("sync"));
        let cmd: Command = serde_json::from_value(json!("update")).unwrap();
        assert_eq!(cmd, Command::Update);
    }

    #[test]
    fn test_command_args_cep_source_casing() {
        let args = CommandArgs {
            sync: true,
            cep_source: Some("CEPShared".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["CEPSource"], json!("CEPShared"));
        assert_eq!(value["sync"], json!(true));
        // False flags stay off the wire.
        assert!(value.get("lock").is_none());
    }

    #[test]
    fn test_processor_envelope_round_trip() {
        let value = json!({
            "id": "react-1",
            "command": "update",
            "commandArgs": {"lock": true},
            "statesSupported": ["input"]
        });
        let envelope: ProcessorEnvelope = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(envelope.command, Some(Command::Update));
        assert!(envelope.command_args.as_ref().unwrap().lock);
        assert_eq!(serde_json::to_value(&envelope).unwrap(), value);
    }
}
