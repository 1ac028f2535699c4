// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskmesh Core - Task Synchronization Hub
//!
//! This crate provides the hub engine that keeps partial replicas of task
//! documents consistent across loosely connected processors. Processors send
//! diffs, the hub merges them over its durable replica, verifies divergence
//! with content hashes, and propagates the consequences (shared variables,
//! connections, successor tasks) back out.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         Processors                             │
//! │        (UI replicas, worker replicas, coprocessors)            │
//! └────────────────────────────────────────────────────────────────┘
//!                │  partial task + processor envelope
//!                ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        taskmesh-core                           │
//! │                                                                │
//! │  transfer ─ lock ─ rate ─ error-route ─ output ─ dispatch      │
//! │                                           │                    │
//! │              ┌────────────────────────────┤                    │
//! │              ▼                            ▼                    │
//! │        CEP propagation              command handlers           │
//! │     (shared / connections)      (start/update/error/...)       │
//! └────────────────────────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    Store (memory / SQLite)                     │
//! │   instances · tasks · threads · families · outputs ·           │
//! │   shared · connections · sessions                              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Commands
//!
//! | Command   | Description |
//! |-----------|-------------|
//! | `start`   | Instantiate a task template as a new running instance |
//! | `update`  | Merge a processor's partial view over the stored replica |
//! | `sync`    | Hub-generated update; bypasses admission and breaks CEP loops |
//! | `error`   | Persist the failure and start the routed error-handler task |
//! | `partial` | Merge without hash verification or propagation |
//! | `init`    | Re-seed a running instance's shared variables |
//! | `ping`    | Liveness probe, answered with `pong` |
//!
//! # Merge Semantics
//!
//! Documents merge with tombstone rules: in objects `null` deletes the key,
//! in arrays `null` keeps the existing element, and the update's array
//! length dictates the merged length. Divergence between replicas is
//! detected with a two-tier djb2 fingerprint (scoped slice first, full
//! document as the tiebreaker). See [`document`] and [`hash`].
//!
//! # Example
//!
//! ```ignore
//! let hub = Hub::builder()
//!     .with_config(HubConfig::from_env()?)
//!     .with_templates(templates)
//!     .build()
//!     .await?;
//! let accepted = hub.process(task, Some(request_id)).await?;
//! ```

#![deny(missing_docs)]

pub mod cep;
pub mod command_handlers;
pub mod config;
pub mod document;
pub mod error;
pub mod hash;
pub mod hub;
pub mod lock;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use config::{ConfigError, HubConfig};
pub use error::{HubError, Result};
pub use hub::{Hub, HubBuilder};
pub use registry::{HandlerRegistry, TaskFunction};
pub use store::{HubStores, MemoryStore, SqliteStore, Store};
