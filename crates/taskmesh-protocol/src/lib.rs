// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskmesh Protocol - Task document model and command envelopes
//!
//! This crate defines the shared unit of work (the [`Task`] document) exchanged
//! between processors and the hub, together with the transport envelopes that
//! carry commands between them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     taskmesh-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Document: Task (fixed namespaces + free-form payloads)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Envelopes: processor → hub command transfer                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # The Task document
//!
//! A [`Task`] is a nested JSON document with fixed top-level namespaces. The
//! *meaning* of the free-form namespaces (`request`, `response`, `input`,
//! `output`, `shared`, `connections`, ...) is owned by task-function logic;
//! this crate (and taskmesh-core) only own their mutation and synchronization.
//!
//! | Field | Role |
//! |-------|------|
//! | `id` | dot-separated position in the static task tree, immutable |
//! | `instanceId` | globally unique id of one running occurrence |
//! | `familyId` | shared by instances spawned together |
//! | `threadId` | groups the historical sequence of instances |
//! | `meta` | synchronization bookkeeping (hash, lock, counters) |
//! | `processor` / `hub` | transport envelopes, never part of the synced payload |
//!
//! # Commands
//!
//! Processors attach a [`Command`] plus [`CommandArgs`] to `task.processor`;
//! the hub translates that into `task.hub` and dispatches. Recognized
//! commands: `start`, `update`, `sync`, `error`, `partial`, `ping`/`pong`
//! and the internal `init`.

#![deny(missing_docs)]

/// Command values and the processor/hub transport envelopes.
pub mod envelope;

/// The Task document model with its fixed namespaces.
pub mod task;

pub use envelope::{Command, CommandArgs, HubEnvelope, ProcessorEnvelope, TaskMessage};
pub use task::{Task, TaskConfig, TaskError, TaskMeta, TaskState};
