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

//! Store access: typed queries over the shared Postgres pool, plus the
//! full-state snapshot assembler.
//!
//! Reads by id return `Ok(None)` when the row is absent; only transport and
//! constraint failures surface as errors. None of these functions bump the
//! broadcast version: the mutating caller does that exactly once per
//! mutation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::BackendError;
use crate::models::{
    ActivityEntry, Agent, AgentCost, AgentStatus, CreateMessageRequest, CreateTaskRequest,
    Message, Room, StatePayload, Task, TaskStatus,
};

/// Connect the shared pool.
///
/// # Errors
///
/// Returns `BackendError::Database` if the server is unreachable or the DSN
/// is invalid.
pub async fn connect_pool(
    config: &devswarm_config::PostgresConfig,
) -> Result<PgPool, BackendError> {
    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&config.dsn)
        .await?;

    info!(
        min = config.min_connections,
        max = config.max_connections,
        "postgres pool connected"
    );
    Ok(pool)
}

/// Connectivity probe used by the health endpoint.
pub async fn ping(pool: &PgPool) -> Result<(), BackendError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

const AGENT_COLUMNS: &str = "id, name, role, current_room, status, current_task, \
     thought_chain, tech_stack, avatar_color, updated_at";

type AgentRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Vec<String>,
    String,
    DateTime<Utc>,
);

fn agent_from_row(row: AgentRow) -> Agent {
    let (id, name, role, room, status, current_task, thought_chain, tech_stack, avatar_color, updated_at) =
        row;
    Agent {
        id,
        name,
        role,
        current_room: Room::from_str_loose(&room),
        status: AgentStatus::from_str_loose(&status),
        current_task,
        thought_chain,
        tech_stack,
        avatar_color,
        updated_at,
    }
}

pub async fn get_all_agents(pool: &PgPool) -> Result<Vec<Agent>, BackendError> {
    let rows: Vec<AgentRow> = sqlx::query_as(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(agent_from_row).collect())
}

pub async fn get_agent(pool: &PgPool, id: &str) -> Result<Option<Agent>, BackendError> {
    let row: Option<AgentRow> = sqlx::query_as(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(agent_from_row))
}

/// Persist an agent's mutable fields (room, status, task, thought chain).
pub async fn update_agent(pool: &PgPool, agent: &Agent) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE agents SET current_room = $1, status = $2, current_task = $3,
             thought_chain = $4, updated_at = NOW()
         WHERE id = $5",
    )
    .bind(agent.current_room.as_str())
    .bind(agent.status.as_str())
    .bind(&agent.current_task)
    .bind(&agent.thought_chain)
    .bind(&agent.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move every agent to the given status and room in one statement.
pub async fn bulk_update_agent_status(
    pool: &PgPool,
    status: AgentStatus,
    room: Room,
) -> Result<(), BackendError> {
    sqlx::query("UPDATE agents SET status = $1, current_room = $2, updated_at = NOW()")
        .bind(status.as_str())
        .bind(room.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Office state version
// ---------------------------------------------------------------------------

pub async fn get_version(pool: &PgPool) -> Result<i64, BackendError> {
    let (version,): (i64,) = sqlx::query_as("SELECT version FROM office_state WHERE id = 1")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

/// Atomically advance the broadcast version. Callers invoke this exactly once
/// per durable mutation, after the entity write.
pub async fn bump_version(pool: &PgPool) -> Result<(), BackendError> {
    sqlx::query("UPDATE office_state SET version = version + 1, updated_at = NOW() WHERE id = 1")
        .execute(pool)
        .await?;
    Ok(())
}

/// Assemble the full-state broadcast frame.
///
/// The version is read first so every entity in the frame is at least as
/// fresh as the returned version.
pub async fn get_full_state(
    pool: &PgPool,
    messages_limit: i64,
) -> Result<(String, i64), BackendError> {
    let version = get_version(pool).await?;
    let agents = get_all_agents(pool).await?;
    let messages = get_recent_messages(pool, messages_limit, None).await?;
    let tasks = get_all_tasks(pool).await?;

    let payload = StatePayload::new(agents, messages, tasks, version);
    let data = serde_json::to_string(&payload)
        .map_err(|e| BackendError::Internal(format!("snapshot serialization failed: {e}")))?;
    Ok((data, version))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str =
    "id, title, description, status, priority, created_by, created_at, updated_at";

type TaskRow = (
    String,
    String,
    String,
    String,
    i32,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn task_from_row(row: TaskRow, assigned_agents: Vec<String>) -> Task {
    let (id, title, description, status, priority, created_by, created_at, updated_at) = row;
    Task {
        id,
        title,
        description,
        status: TaskStatus::from_str_loose(&status),
        priority,
        created_by,
        assigned_agents,
        created_at,
        updated_at,
    }
}

async fn attach_assignees(pool: &PgPool, rows: Vec<TaskRow>) -> Result<Vec<Task>, BackendError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let assignees = get_task_assignees(pool, &row.0).await?;
        tasks.push(task_from_row(row, assignees));
    }
    Ok(tasks)
}

pub async fn get_all_tasks(pool: &PgPool) -> Result<Vec<Task>, BackendError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks ORDER BY priority DESC, created_at DESC"
    ))
    .fetch_all(pool)
    .await?;

    attach_assignees(pool, rows).await
}

pub async fn get_tasks_by_agent(pool: &PgPool, agent_id: &str) -> Result<Vec<Task>, BackendError> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT t.id, t.title, t.description, t.status, t.priority, t.created_by,
                t.created_at, t.updated_at
         FROM tasks t
         JOIN task_assignments ta ON t.id = ta.task_id
         WHERE ta.agent_id = $1
         ORDER BY t.priority DESC, t.created_at DESC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;

    attach_assignees(pool, rows).await
}

pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>, BackendError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let assignees = get_task_assignees(pool, &row.0).await?;
            Ok(Some(task_from_row(row, assignees)))
        }
        None => Ok(None),
    }
}

pub async fn get_task_assignees(pool: &PgPool, task_id: &str) -> Result<Vec<String>, BackendError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT agent_id FROM task_assignments WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Insert a task and its assignment set; returns the generated id.
pub async fn create_task(
    pool: &PgPool,
    req: &CreateTaskRequest,
    status: TaskStatus,
) -> Result<String, BackendError> {
    let (id,): (String,) = sqlx::query_as(
        "INSERT INTO tasks (title, description, status, priority, created_by)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(&req.title)
    .bind(&req.description)
    .bind(status.as_str())
    .bind(req.priority)
    .bind(&req.created_by)
    .fetch_one(pool)
    .await?;

    for agent_id in &req.assigned_agents {
        sqlx::query(
            "INSERT INTO task_assignments (task_id, agent_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(&id)
        .bind(agent_id)
        .execute(pool)
        .await?;
    }

    Ok(id)
}

/// Update a task's status. Returns `false` when the id does not exist.
pub async fn update_task_status(
    pool: &PgPool,
    task_id: &str,
    status: TaskStatus,
) -> Result<bool, BackendError> {
    let result = sqlx::query("UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status.as_str())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

const MESSAGE_COLUMNS: &str = "id, from_agent, to_agent, content, message_type, created_at";

type MessageRow = (String, String, String, String, String, DateTime<Utc>);

fn message_from_row(row: MessageRow) -> Message {
    let (id, from_agent, to_agent, content, message_type, created_at) = row;
    Message {
        id,
        from_agent,
        to_agent,
        content,
        message_type,
        created_at,
    }
}

/// The N most recent messages, newest first, optionally scoped to one agent
/// (sender or recipient).
pub async fn get_recent_messages(
    pool: &PgPool,
    limit: i64,
    agent_id: Option<&str>,
) -> Result<Vec<Message>, BackendError> {
    let rows: Vec<MessageRow> = if let Some(agent) = agent_id {
        sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE from_agent = $1 OR to_agent = $1
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(agent)
        .bind(limit)
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(pool)
        .await?
    };

    Ok(rows.into_iter().map(message_from_row).collect())
}

pub async fn get_message(pool: &PgPool, id: &str) -> Result<Option<Message>, BackendError> {
    let row: Option<MessageRow> = sqlx::query_as(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(message_from_row))
}

pub async fn create_message(
    pool: &PgPool,
    req: &CreateMessageRequest,
) -> Result<String, BackendError> {
    let (id,): (String,) = sqlx::query_as(
        "INSERT INTO messages (from_agent, to_agent, content, message_type)
         VALUES ($1, $2, $3, $4)
         RETURNING id",
    )
    .bind(&req.from_agent)
    .bind(&req.to_agent)
    .bind(&req.content)
    .bind(&req.message_type)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Costs
// ---------------------------------------------------------------------------

pub async fn get_agent_costs(pool: &PgPool) -> Result<Vec<AgentCost>, BackendError> {
    let rows: Vec<(String, i64, i64, f64)> = sqlx::query_as(
        "SELECT agent_id,
                COALESCE(SUM(input_tokens), 0)::BIGINT AS total_input,
                COALESCE(SUM(output_tokens), 0)::BIGINT AS total_output,
                COALESCE(SUM(cost_usd), 0)::DOUBLE PRECISION AS total_cost
         FROM agent_costs
         GROUP BY agent_id
         ORDER BY total_cost DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(agent_id, input_tokens, output_tokens, cost_usd)| AgentCost {
            agent_id,
            input_tokens,
            output_tokens,
            cost_usd,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

pub async fn log_activity(
    pool: &PgPool,
    agent_id: &str,
    action: &str,
    details: serde_json::Value,
) -> Result<(), BackendError> {
    sqlx::query("INSERT INTO activity_log (agent_id, action, details) VALUES ($1, $2, $3)")
        .bind(agent_id)
        .bind(action)
        .bind(details)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_activity_log(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<ActivityEntry>, BackendError> {
    let rows: Vec<(i64, String, String, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
        "SELECT id, agent_id, action, details, created_at
         FROM activity_log ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, agent_id, action, details, created_at)| ActivityEntry {
            id,
            agent_id,
            action,
            details,
            created_at,
        })
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_from_row_parses_enums() {
        let now = Utc::now();
        let agent = agent_from_row((
            "devops".to_string(),
            "Tonny".to_string(),
            "DevOps Engineer".to_string(),
            "Server Room".to_string(),
            "Working".to_string(),
            "Restart redis".to_string(),
            String::new(),
            vec!["docker".to_string()],
            "#10b981".to_string(),
            now,
        ));
        assert_eq!(agent.current_room, Room::ServerRoom);
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.updated_at, now);
    }

    #[test]
    fn test_agent_from_row_tolerates_unknown_values() {
        let agent = agent_from_row((
            "x".to_string(),
            "X".to_string(),
            String::new(),
            "Broom Closet".to_string(),
            "Sleeping".to_string(),
            String::new(),
            String::new(),
            Vec::new(),
            String::new(),
            Utc::now(),
        ));
        assert_eq!(agent.current_room, Room::Desks);
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[test]
    fn test_task_from_row_keeps_assignee_order() {
        let now = Utc::now();
        let task = task_from_row(
            (
                "t-1".to_string(),
                "Title".to_string(),
                String::new(),
                "In Progress".to_string(),
                3,
                "orchestrator".to_string(),
                now,
                now,
            ),
            vec!["researcher".to_string(), "devops".to_string()],
        );
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_agents, vec!["researcher", "devops"]);
    }
}
