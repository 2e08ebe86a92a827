/*
 * DevSwarm - Virtual office for AI agents
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::module_name_repetitions)]

mod api;
mod bridge;
mod bus;
mod dispatcher;
mod error;
mod hub;
mod models;
mod orchestration;
mod store;
mod worker;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use devswarm_config::Config;
use tokio::sync::watch;
use tracing::{error, info};

use crate::api::AppState;
use crate::bridge::Bridge;
use crate::bus::EventBus;
use crate::dispatcher::Dispatcher;
use crate::hub::Hub;
use crate::orchestration::OrchestrationClient;

const SERVICE_NAME: &str = "devswarm-backend";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(1);
    });

    let _telemetry_guard =
        devswarm_telemetry::init_telemetry(SERVICE_NAME, SERVICE_VERSION, &config.telemetry)
            .unwrap_or_else(|e| {
                eprintln!("fatal: telemetry init failed: {e}");
                process::exit(1);
            });

    info!(
        service = SERVICE_NAME,
        version = SERVICE_VERSION,
        env = %config.devswarm.env,
        "starting"
    );

    let config = Arc::new(config);

    let pool = match store::connect_pool(&config.postgres).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "fatal: postgres connection failed");
            process::exit(1);
        }
    };

    // Bus unavailability is non-fatal: the bridge heartbeat keeps clients
    // converging and the worker rejoins the stream once the bus is back.
    let bus = Arc::new(EventBus::connect(&config.bus).await);

    let orchestration = match OrchestrationClient::new(&config.orchestration) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "fatal: orchestration client init failed");
            process::exit(1);
        }
    };

    let shutdown = devswarm_runtime::shutdown_channel();

    let (hub, hub_handle) = Hub::new();
    tokio::spawn(hub.run(shutdown.clone()));
    info!("hub started");

    let bridge = Bridge::new(pool.clone(), Arc::clone(&bus), hub_handle.clone(), &config);
    tokio::spawn(bridge.run(shutdown.clone()));
    info!("state bridge started");

    tokio::spawn(worker::run(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&orchestration),
        shutdown.clone(),
    ));

    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&orchestration),
        &config,
    );
    let dispatcher_shutdown = shutdown.clone();
    tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

    let http_client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(config.orchestration.timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "fatal: http client init failed");
            process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        pool,
        bus,
        hub: hub_handle,
        http_client,
        config: Arc::clone(&config),
    });
    let app = api::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.backend.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "fatal: failed to bind");
            process::exit(1);
        }
    };

    info!(addr = %addr, "listening");

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("shutdown complete");
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.changed().await;
}
