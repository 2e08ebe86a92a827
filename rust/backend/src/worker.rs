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

//! Task queue worker: drains queued orchestration goals from the durable
//! stream through the consumer group.
//!
//! Deliveries are acknowledged on success and on failure alike; the goal
//! producer owns the retry policy. Failures are recorded in the activity
//! log instead of being redelivered.

use std::sync::Arc;

use async_nats::jetstream;
use futures::StreamExt;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::error::BackendError;
use crate::orchestration::OrchestrationClient;
use crate::store;

const CONSUMER_RETRY_SECS: u64 = 5;
const FETCH_MAX_MESSAGES: usize = 1;
const FETCH_EXPIRES_SECS: u64 = 5;

/// Payload appended to the task stream by goal producers.
#[derive(Debug, Deserialize)]
pub(crate) struct QueuedGoal {
    pub goal: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

pub async fn run(
    pool: PgPool,
    bus: Arc<EventBus>,
    orchestration: Arc<OrchestrationClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("task queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(consumer) = bus.task_consumer().await else {
            // Bus degraded; retry joining the group later.
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(std::time::Duration::from_secs(CONSUMER_RETRY_SECS)) => {}
            }
            continue;
        };

        info!("joined task stream consumer group");
        consume(&pool, &orchestration, &consumer, &mut shutdown).await;
    }

    info!("task queue worker stopped");
}

/// Fetch-and-process loop; returns when shutdown arrives or the stream read
/// fails (the caller then rejoins the group).
async fn consume(
    pool: &PgPool,
    orchestration: &OrchestrationClient,
    consumer: &jetstream::consumer::PullConsumer,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => return,
            batch = fetch_batch(consumer) => batch,
        };

        match batch {
            Ok(messages) => {
                for msg in messages {
                    process_delivery(pool, orchestration, msg).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "stream read error");
                return;
            }
        }
    }
}

async fn fetch_batch(
    consumer: &jetstream::consumer::PullConsumer,
) -> Result<Vec<jetstream::Message>, BackendError> {
    let mut stream = consumer
        .fetch()
        .max_messages(FETCH_MAX_MESSAGES)
        .expires(std::time::Duration::from_secs(FETCH_EXPIRES_SECS))
        .messages()
        .await
        .map_err(|e| BackendError::Bus(e.to_string()))?;

    let mut messages = Vec::new();
    while let Some(msg) = stream.next().await {
        messages.push(msg.map_err(|e| BackendError::Bus(e.to_string()))?);
    }
    Ok(messages)
}

async fn process_delivery(
    pool: &PgPool,
    orchestration: &OrchestrationClient,
    msg: jetstream::Message,
) {
    let payload: QueuedGoal = match serde_json::from_slice(&msg.payload) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed queued goal, acknowledging");
            ack(&msg).await;
            return;
        }
    };

    let preview: String = payload.goal.chars().take(60).collect();
    info!(goal = %preview, priority = payload.priority, "processing queued goal");

    match orchestration
        .run_goal(&payload.goal, payload.target.as_deref())
        .await
    {
        Ok(()) => {
            ack(&msg).await;
            info!(goal = %preview, "queued goal completed");
        }
        Err(e) => {
            ack(&msg).await;
            warn!(goal = %preview, error = %e, "queued goal failed");
            let details = serde_json::json!({
                "goal": payload.goal,
                "target": payload.target,
                "error": e.to_string(),
            });
            if let Err(log_err) = store::log_activity(pool, "system", "task_queue_error", details).await
            {
                warn!(error = %log_err, "failed to record task_queue_error");
            }
        }
    }
}

async fn ack(msg: &jetstream::Message) {
    if let Err(e) = msg.ack().await {
        warn!(error = %e, "delivery ack failed");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
