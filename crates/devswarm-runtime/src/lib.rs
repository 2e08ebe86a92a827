/*
 * DevSwarm - Virtual office for AI agents
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for DevSwarm services.
//!
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`shutdown_channel`]: watch-channel fan-out of the shutdown signal
//! - [`connect_bus`]: best-effort event bus connection

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use tokio::sync::watch;
use tracing::{error, info, warn};

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` or `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

/// Fan the process shutdown signal out to many workers.
///
/// Returns a watch receiver that flips to `true` once SIGINT/SIGTERM arrives.
/// Workers clone the receiver and select on `changed()`.
#[must_use]
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

/// Connect to the event bus.
///
/// The bus is an optional dependency: when it is unreachable the caller runs
/// degraded (heartbeat-only broadcasts, no task stream) rather than failing
/// startup. Returns `None` after logging one warning.
pub async fn connect_bus(url: &str) -> Option<async_nats::Client> {
    match async_nats::connect(url).await {
        Ok(client) => {
            info!(url = %url, "event bus connected");
            Some(client)
        }
        Err(e) => {
            warn!(url = %url, error = %e, "event bus unavailable, running degraded");
            None
        }
    }
}
