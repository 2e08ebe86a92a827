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

//! Domain models and wire payloads.
//!
//! Wire field names are camelCase; deserialization additionally accepts the
//! snake_case spellings used by older producers. Database reads go through
//! the `from_str_loose` constructors so an unexpected stored value degrades
//! to a sane default instead of poisoning a whole snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Working,
    Meeting,
    Error,
    #[serde(rename = "Clocked Out")]
    ClockedOut,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Working => "Working",
            Self::Meeting => "Meeting",
            Self::Error => "Error",
            Self::ClockedOut => "Clocked Out",
        }
    }

    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "Working" => Self::Working,
            "Meeting" => Self::Meeting,
            "Error" => Self::Error,
            "Clocked Out" => Self::ClockedOut,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Room {
    #[serde(rename = "Private Office")]
    PrivateOffice,
    #[serde(rename = "War Room")]
    WarRoom,
    Desks,
    Lounge,
    #[serde(rename = "Server Room")]
    ServerRoom,
}

impl Room {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrivateOffice => "Private Office",
            Self::WarRoom => "War Room",
            Self::Desks => "Desks",
            Self::Lounge => "Lounge",
            Self::ServerRoom => "Server Room",
        }
    }

    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "Private Office" => Self::PrivateOffice,
            "War Room" => Self::WarRoom,
            "Lounge" => Self::Lounge,
            "Server Room" => Self::ServerRoom,
            _ => Self::Desks,
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Backlog,
    #[serde(rename = "In Progress")]
    InProgress,
    Review,
    Done,
    Blocked,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "Backlog",
            Self::InProgress => "In Progress",
            Self::Review => "Review",
            Self::Done => "Done",
            Self::Blocked => "Blocked",
        }
    }

    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "In Progress" => Self::InProgress,
            "Review" => Self::Review,
            "Done" => Self::Done,
            "Blocked" => Self::Blocked,
            _ => Self::Backlog,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(rename = "room", alias = "current_room")]
    pub current_room: Room,
    pub status: AgentStatus,
    #[serde(rename = "currentTask", alias = "current_task")]
    pub current_task: String,
    #[serde(rename = "thoughtChain", alias = "thought_chain")]
    pub thought_chain: String,
    #[serde(rename = "techStack", alias = "tech_stack", default)]
    pub tech_stack: Vec<String>,
    #[serde(rename = "avatarColor", alias = "avatar_color")]
    pub avatar_color: String,
    #[serde(rename = "updatedAt", alias = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "createdBy", alias = "created_by", default)]
    pub created_by: String,
    #[serde(rename = "assignedAgents", alias = "assigned_agents", default)]
    pub assigned_agents: Vec<String>,
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt", alias = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "fromAgent", alias = "from_agent", default)]
    pub from_agent: String,
    #[serde(rename = "toAgent", alias = "to_agent", default)]
    pub to_agent: String,
    pub content: String,
    #[serde(rename = "messageType", alias = "message_type")]
    pub message_type: String,
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

/// Aggregated token costs per agent. Field names match the dashboard's
/// AgentCost interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCost {
    #[serde(rename = "agentId", alias = "agent_id")]
    pub agent_id: String,
    #[serde(rename = "totalInput", alias = "input_tokens")]
    pub input_tokens: i64,
    #[serde(rename = "totalOutput", alias = "output_tokens")]
    pub output_tokens: i64,
    #[serde(rename = "totalCost", alias = "cost_usd")]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    #[serde(rename = "agentId", alias = "agent_id", default)]
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// Full-state broadcast frame. Empty message/task lists are omitted so the
/// frame stays small for fresh installations.
#[derive(Debug, Serialize)]
pub struct StatePayload {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub agents: HashMap<String, Agent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
    pub version: i64,
}

impl StatePayload {
    #[must_use]
    pub fn new(agents: Vec<Agent>, messages: Vec<Message>, tasks: Vec<Task>, version: i64) -> Self {
        let agents = agents.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            frame_type: "STATE_UPDATE",
            agents,
            messages,
            tasks,
            version,
        }
    }
}

/// Category tag of a `DELTA_UPDATE` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaCategory {
    Agents,
    Tasks,
    Messages,
}

impl DeltaCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::Tasks => "tasks",
            Self::Messages => "messages",
        }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "createdBy", alias = "created_by", default)]
    pub created_by: String,
    #[serde(rename = "assignedAgents", alias = "assigned_agents", default)]
    pub assigned_agents: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentUpdateRequest {
    #[serde(alias = "currentRoom", default)]
    pub current_room: Option<Room>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(alias = "currentTask", default)]
    pub current_task: Option<String>,
    #[serde(alias = "thoughtChain", default)]
    pub thought_chain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    #[serde(rename = "fromAgent", alias = "from_agent", default)]
    pub from_agent: String,
    #[serde(rename = "toAgent", alias = "to_agent", default)]
    pub to_agent: String,
    pub content: String,
    #[serde(
        rename = "messageType",
        alias = "message_type",
        default = "default_message_type"
    )]
    pub message_type: String,
}

fn default_message_type() -> String {
    "chat".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StateOverrideRequest {
    #[serde(alias = "globalStatus", default)]
    pub global_status: Option<AgentStatus>,
    #[serde(alias = "defaultRoom", default)]
    pub default_room: Option<Room>,
    #[serde(default)]
    pub message: String,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_agent() -> Agent {
        Agent {
            id: "researcher".to_string(),
            name: "Mona".to_string(),
            role: "Researcher".to_string(),
            current_room: Room::WarRoom,
            status: AgentStatus::ClockedOut,
            current_task: "Sprint planning".to_string(),
            thought_chain: String::new(),
            tech_stack: vec!["search".to_string()],
            avatar_color: "#4f9cf9".to_string(),
            updated_at: Utc::now(),
        }
    }

    fn sample_task() -> Task {
        Task {
            id: "t-1".to_string(),
            title: "Research multi-agent patterns".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            priority: 3,
            created_by: "orchestrator".to_string(),
            assigned_agents: vec!["researcher".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_agent_serializes_camel_case() {
        let json = serde_json::to_value(sample_agent()).unwrap();
        assert_eq!(json["room"], "War Room");
        assert_eq!(json["status"], "Clocked Out");
        assert_eq!(json["currentTask"], "Sprint planning");
        assert_eq!(json["techStack"][0], "search");
        assert_eq!(json["avatarColor"], "#4f9cf9");
        assert!(json.get("current_room").is_none(), "no snake_case on egress");
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn test_agent_accepts_snake_case_ingress() {
        let json = r##"{
            "id": "devops", "name": "Tonny", "role": "DevOps Engineer",
            "current_room": "Server Room", "status": "Working",
            "current_task": "", "thought_chain": "",
            "tech_stack": ["docker"], "avatar_color": "#10b981",
            "updated_at": "2026-01-05T10:00:00Z"
        }"##;
        let agent: Agent = serde_json::from_str(json).unwrap();
        assert_eq!(agent.current_room, Room::ServerRoom);
        assert_eq!(agent.status, AgentStatus::Working);
    }

    #[test]
    fn test_task_serializes_camel_case() {
        let json = serde_json::to_value(sample_task()).unwrap();
        assert_eq!(json["status"], "In Progress");
        assert_eq!(json["createdBy"], "orchestrator");
        assert_eq!(json["assignedAgents"][0], "researcher");
    }

    #[test]
    fn test_enum_from_str_loose_falls_back() {
        assert_eq!(AgentStatus::from_str_loose("Working"), AgentStatus::Working);
        assert_eq!(AgentStatus::from_str_loose("garbage"), AgentStatus::Idle);
        assert_eq!(Room::from_str_loose("War Room"), Room::WarRoom);
        assert_eq!(Room::from_str_loose("garbage"), Room::Desks);
        assert_eq!(TaskStatus::from_str_loose("Done"), TaskStatus::Done);
        assert_eq!(TaskStatus::from_str_loose("garbage"), TaskStatus::Backlog);
    }

    #[test]
    fn test_enum_round_trip_matches_loose_parse() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Blocked,
        ] {
            assert_eq!(TaskStatus::from_str_loose(status.as_str()), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_illegal_enum_value_rejected_on_wire() {
        let result: Result<TaskStatusRequest, _> =
            serde_json::from_str(r#"{"status": "Cancelled"}"#);
        assert!(result.is_err(), "unknown status must not deserialize");
    }

    #[test]
    fn test_state_payload_omits_empty_collections() {
        let payload = StatePayload::new(vec![sample_agent()], Vec::new(), Vec::new(), 7);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "STATE_UPDATE");
        assert_eq!(json["version"], 7);
        assert!(json.get("messages").is_none());
        assert!(json.get("tasks").is_none());
        assert!(json["agents"]["researcher"].is_object());
    }

    #[test]
    fn test_state_payload_includes_populated_collections() {
        let payload = StatePayload::new(vec![sample_agent()], Vec::new(), vec![sample_task()], 8);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["tasks"][0]["id"], "t-1");
    }

    #[test]
    fn test_state_payload_is_standalone_json() {
        // Every frame must parse in isolation; clients run JSON.parse per frame.
        let payload = StatePayload::new(vec![sample_agent()], Vec::new(), Vec::new(), 1);
        let text = serde_json::to_string(&payload).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["type"], "STATE_UPDATE");
    }

    #[test]
    fn test_create_task_request_both_casings() {
        let camel: CreateTaskRequest = serde_json::from_str(
            r#"{"title":"T","createdBy":"orchestrator","assignedAgents":["researcher"]}"#,
        )
        .unwrap();
        assert_eq!(camel.created_by, "orchestrator");
        assert_eq!(camel.assigned_agents, vec!["researcher"]);

        let snake: CreateTaskRequest = serde_json::from_str(
            r#"{"title":"T","created_by":"orchestrator","assigned_agents":["researcher"]}"#,
        )
        .unwrap();
        assert_eq!(snake.created_by, "orchestrator");
        assert_eq!(snake.assigned_agents, vec!["researcher"]);
    }

    #[test]
    fn test_create_task_request_defaults() {
        let req: CreateTaskRequest = serde_json::from_str(r#"{"title":"T"}"#).unwrap();
        assert!(req.status.is_none());
        assert_eq!(req.priority, 0);
        assert!(req.assigned_agents.is_empty());
    }

    #[test]
    fn test_agent_update_request_both_casings() {
        let snake: AgentUpdateRequest = serde_json::from_str(
            r#"{"status":"Working","current_room":"War Room","current_task":"Sprint planning"}"#,
        )
        .unwrap();
        assert_eq!(snake.status, Some(AgentStatus::Working));
        assert_eq!(snake.current_room, Some(Room::WarRoom));
        assert_eq!(snake.current_task.as_deref(), Some("Sprint planning"));
        assert!(snake.thought_chain.is_none());

        let camel: AgentUpdateRequest =
            serde_json::from_str(r#"{"currentRoom":"Lounge","thoughtChain":"hmm"}"#).unwrap();
        assert_eq!(camel.current_room, Some(Room::Lounge));
        assert_eq!(camel.thought_chain.as_deref(), Some("hmm"));
    }

    #[test]
    fn test_create_message_request_defaults_to_chat() {
        let req: CreateMessageRequest =
            serde_json::from_str(r#"{"fromAgent":"a","toAgent":"b","content":"hi"}"#).unwrap();
        assert_eq!(req.message_type, "chat");
    }

    #[test]
    fn test_state_override_request() {
        let req: StateOverrideRequest = serde_json::from_str(
            r#"{"global_status":"Clocked Out","default_room":"Lounge","message":"EOD"}"#,
        )
        .unwrap();
        assert_eq!(req.global_status, Some(AgentStatus::ClockedOut));
        assert_eq!(req.default_room, Some(Room::Lounge));
        assert_eq!(req.message, "EOD");
    }

    #[test]
    fn test_delta_category_strings() {
        assert_eq!(DeltaCategory::Agents.as_str(), "agents");
        assert_eq!(DeltaCategory::Tasks.as_str(), "tasks");
        assert_eq!(DeltaCategory::Messages.as_str(), "messages");
    }
}
