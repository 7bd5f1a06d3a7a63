//! Audit Recorder.
//!
//! Every mutating store operation appends exactly one [`AuditEvent`] through
//! [`append`], passing the open transaction so the event commits (or rolls
//! back) together with the change it describes. Reads never write here.

use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;

use super::models::{AuditEvent, EntityType};

/// Who performed a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

impl Actor {
    pub fn new(id: &str, role: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
        }
    }

    /// A human acting through the HTTP API or CLI.
    pub fn operator() -> Self {
        Self::new("operator", "human")
    }

    /// The war room orchestrator.
    pub fn war_room() -> Self {
        Self::new("war-room", "system")
    }
}

/// Dotted verb recorded as the event's `action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    AgentCreate,
    AgentUpdate,
    TaskCreate,
    TaskUpdate,
    GatewayCreate,
    GatewayUpdate,
    WorkspaceCreate,
    WorkspaceUpdate,
    WorkStateUpsert,
    WarRoomRun,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentCreate => "agent.create",
            Self::AgentUpdate => "agent.update",
            Self::TaskCreate => "task.create",
            Self::TaskUpdate => "task.update",
            Self::GatewayCreate => "gateway.create",
            Self::GatewayUpdate => "gateway.update",
            Self::WorkspaceCreate => "workspace.create",
            Self::WorkspaceUpdate => "workspace.update",
            Self::WorkStateUpsert => "work_state.upsert",
            Self::WarRoomRun => "war_room.run",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::AgentCreate | Self::AgentUpdate => EntityType::Agent,
            Self::TaskCreate | Self::TaskUpdate => EntityType::Task,
            Self::GatewayCreate | Self::GatewayUpdate => EntityType::Gateway,
            Self::WorkspaceCreate | Self::WorkspaceUpdate => EntityType::Workspace,
            Self::WorkStateUpsert => EntityType::AgentWorkState,
            Self::WarRoomRun => EntityType::WarRoomRun,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append one audit event. Call with the transaction that performs the
/// mutation.
pub fn append<P: Serialize>(
    conn: &Connection,
    actor: &Actor,
    action: AuditAction,
    entity_id: &str,
    payload: &P,
) -> Result<()> {
    let payload = serde_json::to_string(payload).context("Failed to serialize audit payload")?;
    conn.execute(
        "INSERT INTO audit_events (id, actor, role, action, entity_type, entity_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid::Uuid::new_v4().to_string(),
            actor.id,
            actor.role,
            action.as_str(),
            action.entity_type().as_str(),
            entity_id,
            payload,
            super::db::now(),
        ],
    )
    .with_context(|| format!("Failed to append audit event {}", action))?;
    Ok(())
}

/// Newest first. `limit` is clamped to 500.
pub fn list(
    conn: &Connection,
    entity_type: Option<EntityType>,
    limit: i64,
) -> Result<Vec<AuditEvent>> {
    let limit = limit.clamp(1, 500);
    let mut stmt = conn
        .prepare(
            "SELECT id, actor, role, action, entity_type, entity_id, payload, created_at
             FROM audit_events
             WHERE (?1 IS NULL OR entity_type = ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )
        .context("Failed to prepare list_audit_events")?;
    let rows = stmt
        .query_map(
            params![entity_type.map(|e| e.as_str()), limit],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .context("Failed to query audit events")?;

    let mut events = Vec::new();
    for row in rows {
        let (id, actor, role, action, entity_str, entity_id, payload, created_at) =
            row.context("Failed to read audit event row")?;
        events.push(AuditEvent {
            id,
            actor,
            role,
            action,
            entity_type: EntityType::from_str(&entity_str).map_err(|e| anyhow::anyhow!(e))?,
            entity_id,
            payload: serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("corrupt audit payload JSON '{}': {}", payload, e))?,
            created_at,
        });
    }
    Ok(events)
}
