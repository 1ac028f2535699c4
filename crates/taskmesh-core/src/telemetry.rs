// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber setup for embedders.

/// Initialize the global tracing subscriber.
///
/// Sets up a fmt layer writing to stderr with an `EnvFilter` that respects
/// `RUST_LOG` (default: info). Call once at startup; embedders with their
/// own subscriber should skip this and the hub's spans will flow into it.
pub fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .with_env_filter(filter)
        .init();
}
