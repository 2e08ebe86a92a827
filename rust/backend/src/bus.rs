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

//! Event bus client: two pub/sub channels plus the durable task stream.
//!
//! The bus is strictly best-effort. When it is unreachable, publishes become
//! silent no-ops and subscriptions come back absent; the bridge's heartbeat
//! keeps clients converging in the meantime. Degradation and recovery are
//! each logged once per transition.

use std::sync::atomic::{AtomicBool, Ordering};

use async_nats::jetstream;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::DeltaCategory;

/// Payload published on `state_changed`; subscribers only care about arrival.
const STATE_CHANGED_PAYLOAD: &str = "state_updated";

pub struct EventBus {
    config: devswarm_config::BusConfig,
    client: RwLock<Option<async_nats::Client>>,
    degraded: AtomicBool,
}

impl EventBus {
    /// Attempt the initial connection. Failure leaves the bus degraded
    /// rather than failing startup.
    pub async fn connect(config: &devswarm_config::BusConfig) -> Self {
        let client = devswarm_runtime::connect_bus(&config.url).await;
        let degraded = client.is_none();
        Self {
            config: config.clone(),
            client: RwLock::new(client),
            degraded: AtomicBool::new(degraded),
        }
    }

    async fn client(&self) -> Option<async_nats::Client> {
        self.client.read().await.clone()
    }

    /// Re-attempt the connection if none is held. Returns `true` when a new
    /// connection was established this call.
    pub async fn try_reconnect(&self) -> bool {
        if self.client.read().await.is_some() {
            return false;
        }
        let Some(client) = devswarm_runtime::connect_bus(&self.config.url).await else {
            return false;
        };
        *self.client.write().await = Some(client);
        self.mark_ok();
        true
    }

    fn mark_degraded(&self, context: &str, detail: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(context = context, detail = detail, "event bus degraded");
        }
    }

    fn mark_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("event bus recovered");
        }
    }

    /// Best-effort publish; a failed publish never rolls back the mutation
    /// that triggered it.
    async fn publish(&self, subject: String, payload: String) {
        let Some(client) = self.client().await else {
            self.mark_degraded(&subject, "no connection");
            return;
        };
        match client.publish(subject.clone(), payload.into()).await {
            Ok(()) => self.mark_ok(),
            Err(e) => self.mark_degraded(&subject, &e.to_string()),
        }
    }

    /// Signal subscribers that some version-visible mutation occurred.
    pub async fn notify_state_changed(&self) {
        self.publish(
            self.config.state_changed_subject.clone(),
            STATE_CHANGED_PAYLOAD.to_string(),
        )
        .await;
    }

    /// Publish an entity-level delta frame on `agent_events`, then the empty
    /// signal on `state_changed`.
    pub async fn publish_delta<T: Serialize>(&self, category: DeltaCategory, id: &str, data: &T) {
        match delta_frame(category, id, data) {
            Ok(frame) => {
                self.publish(self.config.agent_events_subject.clone(), frame)
                    .await;
            }
            Err(e) => warn!(category = category.as_str(), id = id, error = %e, "delta frame build failed"),
        }
        self.notify_state_changed().await;
    }

    pub async fn subscribe_state_changed(&self) -> Option<async_nats::Subscriber> {
        self.subscribe(self.config.state_changed_subject.clone())
            .await
    }

    pub async fn subscribe_agent_events(&self) -> Option<async_nats::Subscriber> {
        self.subscribe(self.config.agent_events_subject.clone())
            .await
    }

    async fn subscribe(&self, subject: String) -> Option<async_nats::Subscriber> {
        let client = self.client().await?;
        match client.subscribe(subject.clone()).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(subject = %subject, error = %e, "subscribe failed");
                None
            }
        }
    }

    /// Durable pull consumer on the task stream. Stream and consumer are
    /// created on demand; pre-existing ones are reused as-is.
    pub async fn task_consumer(&self) -> Option<jetstream::consumer::PullConsumer> {
        let client = self.client().await?;
        let js = jetstream::new(client);
        let subject = self.config.task_queue_subject.clone();

        let stream = match js
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name(&subject),
                subjects: vec![subject.clone()],
                ..Default::default()
            })
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(subject = %subject, error = %e, "task stream unavailable");
                return None;
            }
        };

        let group = self.config.consumer_group.clone();
        match stream
            .get_or_create_consumer(
                &group,
                jetstream::consumer::pull::Config {
                    durable_name: Some(group.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(consumer) => Some(consumer),
            Err(e) => {
                warn!(group = %group, error = %e, "task consumer unavailable");
                None
            }
        }
    }
}

/// Build the wire frame for an entity-level delta.
///
/// # Errors
///
/// Returns the serialization error if `data` cannot be encoded.
pub fn delta_frame<T: Serialize>(
    category: DeltaCategory,
    id: &str,
    data: &T,
) -> Result<String, serde_json::Error> {
    let frame = serde_json::json!({
        "type": "DELTA_UPDATE",
        "category": category.as_str(),
        "id": id,
        "data": data,
    });
    serde_json::to_string(&frame)
}

/// JetStream rejects several subject characters in stream names; derive a
/// legal name from the configured subject.
fn stream_name(subject: &str) -> String {
    subject
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_frame_shape() {
        let data = serde_json::json!({"id": "t-1", "title": "Research"});
        let frame = delta_frame(DeltaCategory::Tasks, "t-1", &data).unwrap();

        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "DELTA_UPDATE");
        assert_eq!(parsed["category"], "tasks");
        assert_eq!(parsed["id"], "t-1");
        assert_eq!(parsed["data"]["title"], "Research");
    }

    #[test]
    fn test_delta_frame_is_standalone_json() {
        let frame = delta_frame(DeltaCategory::Agents, "researcher", &serde_json::json!({}))
            .unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&frame).is_ok());
        assert!(!frame.contains('\n'), "single-line frame");
    }

    #[test]
    fn test_stream_name_sanitizes_subject() {
        assert_eq!(stream_name("devswarm:task_queue"), "devswarm_task_queue");
        assert_eq!(stream_name("a.b*c>d e/f"), "a_b_c_d_e_f");
        assert_eq!(stream_name("plain-name_1"), "plain-name_1");
    }
}
