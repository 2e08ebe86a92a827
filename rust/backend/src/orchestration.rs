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

//! Client for the external orchestration collaborator (the agent engine).
//! The core only observes that orchestration runs produce mutations; the
//! calls here block until the run finishes and report success or failure.

use std::time::Duration;

use tracing::warn;

use crate::error::BackendError;

pub struct OrchestrationClient {
    base_url: String,
    http: reqwest::Client,
}

impl OrchestrationClient {
    /// # Errors
    ///
    /// Returns `BackendError::Config` if the HTTP client cannot be built.
    pub fn new(config: &devswarm_config::OrchestrationConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Config(format!("http client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Run a queued goal through the orchestration graph.
    pub async fn run_goal(&self, goal: &str, target: Option<&str>) -> Result<(), BackendError> {
        let body = serde_json::json!({ "goal": goal, "target": target });
        self.post_json(&endpoint(&self.base_url, "/api/graph/run"), &body)
            .await
    }

    /// Execute one assigned task with a specific agent.
    pub async fn execute_agent(&self, agent_id: &str, goal: &str) -> Result<(), BackendError> {
        let body = serde_json::json!({ "goal": goal });
        let path = format!("/api/agents/{agent_id}/execute");
        self.post_json(&endpoint(&self.base_url, &path), &body).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Upstream(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Upstream(format!(
                "orchestration returned {status}: {text}"
            )));
        }

        // A 200 with an error field still counts as a failed run.
        match resp.json::<serde_json::Value>().await {
            Ok(data) => {
                if let Some(err) = data.get("error").filter(|e| !e.is_null()) {
                    return Err(BackendError::Upstream(err.to_string()));
                }
                Ok(())
            }
            Err(e) => {
                warn!(url = %url, error = %e, "orchestration response was not JSON");
                Ok(())
            }
        }
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{base}{path}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://localhost:8000", "/api/graph/run"),
            "http://localhost:8000/api/graph/run"
        );
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let config = devswarm_config::OrchestrationConfig {
            base_url: "http://localhost:8000/".to_string(),
            timeout_secs: 5,
        };
        let client = OrchestrationClient::new(&config).unwrap();
        assert_eq!(client.base_url, "http://localhost:8000");
    }
}
