// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process serialization of concurrent work on the same instance.
//!
//! This is the short-lived, single-process layer of locking: every command
//! for a given instance runs under that instance's mutex so read-merge-write
//! cycles never interleave. The long-lived, cross-processor layer is the
//! `meta.locked` field checked in the command pipeline; the two are
//! independent.
//!
//! Locks are keyed by arbitrary string (instance id, family id) and created
//! on first use. Guards are owned, so they can cross `.await` points and
//! release on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{HubError, Result};

/// Held lock on a synchronization key. Releases on drop.
pub type SyncGuard = OwnedMutexGuard<()>;

/// Registry of per-key mutexes, created lazily.
#[derive(Default)]
pub struct SyncRegistry {
    mutexes: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.mutexes.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Waits for the key's mutex and returns its guard.
    pub async fn acquire(&self, key: &str) -> SyncGuard {
        trace!(key, "acquiring sync lock");
        let guard = self.mutex_for(key).lock_owned().await;
        trace!(key, "sync lock acquired");
        guard
    }

    /// Takes the key's mutex only if it is free.
    ///
    /// Used where waiting would mean processing the same event twice, e.g.
    /// re-entrant propagation of a shared variable.
    pub fn try_acquire(&self, key: &str) -> Result<SyncGuard> {
        self.mutex_for(key)
            .try_lock_owned()
            .map_err(|_| HubError::AlreadyLocked {
                key: key.to_string(),
            })
    }

    /// Number of keys ever locked. Test and diagnostics helper.
    pub fn len(&self) -> usize {
        self.mutexes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no key has been locked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
