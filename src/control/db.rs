use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::audit::{self, Actor, AuditAction};
use super::models::*;
use crate::errors::ControlError;

/// Current time as an RFC 3339 UTC timestamp with microsecond precision, so
/// that lexical order matches chronological order.
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ControlError::BadRequest(format!("{} must not be empty", field)).into());
    }
    Ok(())
}

/// Async-safe handle to the Mission Control database.
///
/// Wraps `ControlDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ControlDb>>,
}

impl DbHandle {
    pub fn new(db: ControlDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ControlDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| ControlError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only;
    /// never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ControlDb>> {
        self.inner
            .lock()
            .map_err(|_| ControlError::LockPoisoned.into())
    }
}

pub struct ControlDb {
    conn: Connection,
}

const WORKSPACE_COLUMNS: &str =
    "id, name, gateway_id, telegram_chat_id, telegram_topic_id, created_at, updated_at";
const GATEWAY_COLUMNS: &str = "id, name, url, token, enabled, created_at, updated_at";
const AGENT_COLUMNS: &str = "id, name, role, soul_md, model, openclaw_agent_id, enabled, skills_allow, execution_policy, constraints, output_contract, workspace_id, created_at, updated_at";
const TASK_COLUMNS: &str = "id, title, description, status, priority, owner_agent_id, sort_order, workspace_id, created_at, updated_at";
const TURN_COLUMNS: &str =
    "id, conversation_id, speaker_type, speaker_id, content, tool_events, created_at";
const RUN_COLUMNS: &str = "id, conversation_id, workspace_id, final_answer, decision_json, delivery_target, delivery_thread_id, delivery_message_id, delivery_error, created_at, updated_at";

impl ControlDb {
    /// Open (or create) a SQLite database at the given path and create the
    /// schema.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            ControlError::Database(
                anyhow::Error::new(e).context(format!("Failed to open {}", path.display())),
            )
        })?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ControlError::Database(anyhow::Error::new(e).context("Failed to open in-memory database"))
        })?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.create_schema().context("Failed to create schema")?;
        Ok(())
    }

    fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS gateways (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    token TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workspaces (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    gateway_id TEXT REFERENCES gateways(id),
                    telegram_chat_id TEXT,
                    telegram_topic_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    soul_md TEXT NOT NULL DEFAULT '',
                    model TEXT,
                    openclaw_agent_id TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    skills_allow TEXT NOT NULL DEFAULT '[]',
                    execution_policy TEXT NOT NULL DEFAULT '{}',
                    constraints TEXT NOT NULL DEFAULT '{}',
                    output_contract TEXT NOT NULL DEFAULT '{}',
                    workspace_id TEXT REFERENCES workspaces(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_work_states (
                    agent_id TEXT PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
                    current_task_id TEXT,
                    status TEXT,
                    next_step TEXT,
                    blockers TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT,
                    status TEXT NOT NULL DEFAULT 'BACKLOG',
                    priority INTEGER NOT NULL DEFAULT 0,
                    owner_agent_id TEXT REFERENCES agents(id),
                    sort_order INTEGER,
                    workspace_id TEXT REFERENCES workspaces(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    task_id TEXT UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
                    workspace_id TEXT REFERENCES workspaces(id),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS turns (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    speaker_type TEXT NOT NULL,
                    speaker_id TEXT,
                    content TEXT NOT NULL,
                    tool_events TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS war_room_runs (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    workspace_id TEXT REFERENCES workspaces(id),
                    final_answer TEXT NOT NULL,
                    decision_json TEXT NOT NULL,
                    delivery_target TEXT,
                    delivery_thread_id TEXT,
                    delivery_message_id TEXT,
                    delivery_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS audit_events (
                    id TEXT PRIMARY KEY,
                    actor TEXT NOT NULL,
                    role TEXT NOT NULL,
                    action TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    entity_id TEXT,
                    payload TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_agent_id);
                CREATE INDEX IF NOT EXISTS idx_tasks_workspace ON tasks(workspace_id);
                CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_type, entity_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Reference checks ──────────────────────────────────────────────

    fn exists(&self, table: &str, id: &str) -> Result<bool> {
        let sql = format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", table);
        self.conn
            .query_row(&sql, params![id], |row| row.get(0))
            .with_context(|| format!("Failed to check {} existence", table))
    }

    fn check_ref(&self, table: &str, kind: &'static str, id: Option<&str>) -> Result<()> {
        if let Some(id) = id
            && !self.exists(table, id)?
        {
            return Err(ControlError::UnknownReference {
                kind,
                id: id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ── Workspace CRUD ────────────────────────────────────────────────

    pub fn create_workspace(&self, actor: &Actor, new: &NewWorkspace) -> Result<Workspace> {
        require("Workspace name", &new.name)?;
        self.check_ref("gateways", "gateway", new.gateway_id.as_deref())?;
        let id = new_id();
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO workspaces (id, name, gateway_id, telegram_chat_id, telegram_topic_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, new.name, new.gateway_id, new.telegram_chat_id, new.telegram_topic_id, ts],
        )
        .context("Failed to insert workspace")?;
        let workspace = query_workspace(&tx, &id)?.context("Workspace not found after insert")?;
        audit::append(&tx, actor, AuditAction::WorkspaceCreate, &id, &workspace)?;
        tx.commit().context("Failed to commit workspace insert")?;
        Ok(workspace)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let sql = format!("SELECT {} FROM workspaces ORDER BY created_at, rowid", WORKSPACE_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_workspaces")?;
        let rows = stmt
            .query_map([], workspace_from_row)
            .context("Failed to query workspaces")?;
        let mut workspaces = Vec::new();
        for row in rows {
            workspaces.push(row.context("Failed to read workspace row")?);
        }
        Ok(workspaces)
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        query_workspace(&self.conn, id)
    }

    pub fn update_workspace(
        &self,
        actor: &Actor,
        id: &str,
        patch: &WorkspacePatch,
    ) -> Result<Option<Workspace>> {
        if !self.exists("workspaces", id)? {
            return Ok(None);
        }
        if patch.is_empty() {
            return self.get_workspace(id);
        }
        if let Some(name) = &patch.name {
            require("Workspace name", name)?;
        }
        if let Some(gateway_id) = &patch.gateway_id {
            self.check_ref("gateways", "gateway", gateway_id.as_deref())?;
        }
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE workspaces SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, ts, id],
            )
            .context("Failed to update workspace name")?;
        }
        if let Some(gateway_id) = &patch.gateway_id {
            tx.execute(
                "UPDATE workspaces SET gateway_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![gateway_id, ts, id],
            )
            .context("Failed to update workspace gateway")?;
        }
        if let Some(chat_id) = &patch.telegram_chat_id {
            tx.execute(
                "UPDATE workspaces SET telegram_chat_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![chat_id, ts, id],
            )
            .context("Failed to update workspace telegram chat")?;
        }
        if let Some(topic_id) = &patch.telegram_topic_id {
            tx.execute(
                "UPDATE workspaces SET telegram_topic_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![topic_id, ts, id],
            )
            .context("Failed to update workspace telegram topic")?;
        }
        audit::append(&tx, actor, AuditAction::WorkspaceUpdate, id, patch)?;
        tx.commit().context("Failed to commit workspace update")?;
        self.get_workspace(id)
    }

    // ── Gateway CRUD ──────────────────────────────────────────────────

    pub fn create_gateway(&self, actor: &Actor, new: &NewGateway) -> Result<Gateway> {
        require("Gateway url", &new.url)?;
        let id = new_id();
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO gateways (id, name, url, token, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, new.name, new.url, new.token, new.enabled, ts],
        )
        .context("Failed to insert gateway")?;
        // The token never reaches the audit payload: Gateway skips it on serialize.
        let gateway = query_gateway(&tx, &id)?.context("Gateway not found after insert")?;
        audit::append(&tx, actor, AuditAction::GatewayCreate, &id, &gateway)?;
        tx.commit().context("Failed to commit gateway insert")?;
        Ok(gateway)
    }

    pub fn list_gateways(&self) -> Result<Vec<Gateway>> {
        let sql = format!("SELECT {} FROM gateways ORDER BY created_at, rowid", GATEWAY_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_gateways")?;
        let rows = stmt
            .query_map([], gateway_from_row)
            .context("Failed to query gateways")?;
        let mut gateways = Vec::new();
        for row in rows {
            gateways.push(row.context("Failed to read gateway row")?);
        }
        Ok(gateways)
    }

    pub fn get_gateway(&self, id: &str) -> Result<Option<Gateway>> {
        query_gateway(&self.conn, id)
    }

    pub fn update_gateway(
        &self,
        actor: &Actor,
        id: &str,
        patch: &GatewayPatch,
    ) -> Result<Option<Gateway>> {
        if !self.exists("gateways", id)? {
            return Ok(None);
        }
        if patch.is_empty() {
            return self.get_gateway(id);
        }
        if let Some(url) = &patch.url {
            require("Gateway url", url)?;
        }
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE gateways SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, ts, id],
            )
            .context("Failed to update gateway name")?;
        }
        if let Some(url) = &patch.url {
            tx.execute(
                "UPDATE gateways SET url = ?1, updated_at = ?2 WHERE id = ?3",
                params![url, ts, id],
            )
            .context("Failed to update gateway url")?;
        }
        if let Some(token) = &patch.token {
            tx.execute(
                "UPDATE gateways SET token = ?1, updated_at = ?2 WHERE id = ?3",
                params![token, ts, id],
            )
            .context("Failed to update gateway token")?;
        }
        if let Some(enabled) = patch.enabled {
            tx.execute(
                "UPDATE gateways SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled, ts, id],
            )
            .context("Failed to update gateway enabled flag")?;
        }
        let payload = serde_json::json!({
            "name": patch.name,
            "url": patch.url,
            "token_rotated": patch.token.is_some(),
            "enabled": patch.enabled,
        });
        audit::append(&tx, actor, AuditAction::GatewayUpdate, id, &payload)?;
        tx.commit().context("Failed to commit gateway update")?;
        self.get_gateway(id)
    }

    // ── Agent CRUD ────────────────────────────────────────────────────

    pub fn create_agent(&self, actor: &Actor, new: &NewAgent) -> Result<Agent> {
        require("Agent name", &new.name)?;
        self.check_ref("workspaces", "workspace", new.workspace_id.as_deref())?;
        let id = new_id();
        let ts = now();
        let skills = serde_json::to_string(&new.skills_allow).context("Failed to serialize skills_allow")?;
        let policy = serde_json::to_string(&new.execution_policy)
            .context("Failed to serialize execution_policy")?;
        let constraints =
            serde_json::to_string(&new.constraints).context("Failed to serialize constraints")?;
        let contract = serde_json::to_string(&new.output_contract)
            .context("Failed to serialize output_contract")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO agents (id, name, role, soul_md, model, openclaw_agent_id, enabled, skills_allow, execution_policy, constraints, output_contract, workspace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                id,
                new.name,
                new.role,
                new.soul_md,
                new.model,
                new.openclaw_agent_id,
                new.enabled,
                skills,
                policy,
                constraints,
                contract,
                new.workspace_id,
                ts
            ],
        )
        .context("Failed to insert agent")?;
        let agent = query_agent(&tx, &id)?.context("Agent not found after insert")?;
        audit::append(&tx, actor, AuditAction::AgentCreate, &id, &agent)?;
        tx.commit().context("Failed to commit agent insert")?;
        Ok(agent)
    }

    /// Most recently updated first.
    pub fn list_agents(&self, workspace_id: Option<&str>) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM agents WHERE (?1 IS NULL OR workspace_id = ?1) ORDER BY updated_at DESC, rowid DESC",
            AGENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_agents")?;
        let rows = stmt
            .query_map(params![workspace_id], AgentRow::from_row)
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?.into_agent()?);
        }
        Ok(agents)
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        query_agent(&self.conn, id)
    }

    pub fn update_agent(&self, actor: &Actor, id: &str, patch: &AgentPatch) -> Result<Option<Agent>> {
        if !self.exists("agents", id)? {
            return Ok(None);
        }
        if patch.is_empty() {
            return self.get_agent(id);
        }
        if let Some(name) = &patch.name {
            require("Agent name", name)?;
        }
        if let Some(workspace_id) = &patch.workspace_id {
            self.check_ref("workspaces", "workspace", workspace_id.as_deref())?;
        }
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let set = |column: &str, value: &dyn rusqlite::ToSql| -> Result<()> {
            let sql = format!("UPDATE agents SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
            tx.execute(&sql, params![value, ts, id])
                .with_context(|| format!("Failed to update agent {}", column))?;
            Ok(())
        };
        if let Some(name) = &patch.name {
            set("name", name)?;
        }
        if let Some(role) = &patch.role {
            set("role", role)?;
        }
        if let Some(soul) = &patch.soul_md {
            set("soul_md", soul)?;
        }
        if let Some(model) = &patch.model {
            set("model", model)?;
        }
        if let Some(remote) = &patch.openclaw_agent_id {
            set("openclaw_agent_id", remote)?;
        }
        if let Some(enabled) = &patch.enabled {
            set("enabled", enabled)?;
        }
        if let Some(skills) = &patch.skills_allow {
            set("skills_allow", &serde_json::to_string(skills)?)?;
        }
        if let Some(policy) = &patch.execution_policy {
            set("execution_policy", &serde_json::to_string(policy)?)?;
        }
        if let Some(constraints) = &patch.constraints {
            set("constraints", &serde_json::to_string(constraints)?)?;
        }
        if let Some(contract) = &patch.output_contract {
            set("output_contract", &serde_json::to_string(contract)?)?;
        }
        if let Some(workspace_id) = &patch.workspace_id {
            set("workspace_id", workspace_id)?;
        }

        audit::append(&tx, actor, AuditAction::AgentUpdate, id, patch)?;
        tx.commit().context("Failed to commit agent update")?;
        self.get_agent(id)
    }

    // ── Agent work state ──────────────────────────────────────────────

    pub fn get_work_state(&self, agent_id: &str) -> Result<Option<AgentWorkState>> {
        self.conn
            .query_row(
                "SELECT agent_id, current_task_id, status, next_step, blockers, updated_at
                 FROM agent_work_states WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(AgentWorkState {
                        agent_id: row.get(0)?,
                        current_task_id: row.get(1)?,
                        status: row.get(2)?,
                        next_step: row.get(3)?,
                        blockers: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query agent work state")
    }

    /// Overwrite the agent's latest work state. Only the latest row survives.
    pub fn upsert_work_state(
        &self,
        actor: &Actor,
        agent_id: &str,
        update: &WorkStateUpdate,
    ) -> Result<AgentWorkState> {
        if !self.exists("agents", agent_id)? {
            return Err(ControlError::AgentNotFound {
                id: agent_id.to_string(),
            }
            .into());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO agent_work_states (agent_id, current_task_id, status, next_step, blockers, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id) DO UPDATE SET
                current_task_id = excluded.current_task_id,
                status = excluded.status,
                next_step = excluded.next_step,
                blockers = excluded.blockers,
                updated_at = excluded.updated_at",
            params![
                agent_id,
                update.current_task_id,
                update.status,
                update.next_step,
                update.blockers,
                now()
            ],
        )
        .context("Failed to upsert agent work state")?;
        audit::append(&tx, actor, AuditAction::WorkStateUpsert, agent_id, update)?;
        tx.commit().context("Failed to commit work state upsert")?;
        self.get_work_state(agent_id)?
            .context("Work state not found after upsert")
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn create_task(&self, actor: &Actor, new: &NewTask) -> Result<Task> {
        require("Task title", &new.title)?;
        self.check_ref("agents", "agent", new.owner_agent_id.as_deref())?;
        self.check_ref("workspaces", "workspace", new.workspace_id.as_deref())?;
        let id = new_id();
        let ts = now();
        let status = new.status.unwrap_or(TaskStatus::Backlog);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO tasks (id, title, description, status, priority, owner_agent_id, sort_order, workspace_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                new.title,
                new.description,
                status.as_str(),
                new.priority,
                new.owner_agent_id,
                new.sort_order,
                new.workspace_id,
                ts
            ],
        )
        .context("Failed to insert task")?;
        let task = query_task(&tx, &id)?.context("Task not found after insert")?;
        audit::append(&tx, actor, AuditAction::TaskCreate, &id, &task)?;
        tx.commit().context("Failed to commit task insert")?;
        Ok(task)
    }

    /// Explicit `sort_order` first, then priority (high first), then most
    /// recently updated.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR workspace_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR owner_agent_id = ?3)
             ORDER BY sort_order IS NULL, sort_order ASC, priority DESC, updated_at DESC, rowid DESC",
            TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(
                params![
                    filter.workspace_id,
                    filter.status.map(|s| s.as_str()),
                    filter.owner_agent_id
                ],
                TaskRow::from_row,
            )
            .context("Failed to query tasks")?;
        collect_tasks(rows)
    }

    /// Tasks in DOING or BLOCKED, ordered by status ascending, priority
    /// descending, then most recently updated.
    pub fn list_active_tasks(&self, workspace_id: Option<&str>) -> Result<Vec<Task>> {
        let active = TaskStatus::ALL
            .iter()
            .filter(|s| s.is_active())
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE status IN ({}) AND (?1 IS NULL OR workspace_id = ?1)
             ORDER BY status ASC, priority DESC, updated_at DESC, rowid DESC",
            TASK_COLUMNS, active
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_active_tasks")?;
        let rows = stmt
            .query_map(params![workspace_id], TaskRow::from_row)
            .context("Failed to query active tasks")?;
        collect_tasks(rows)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        query_task(&self.conn, id)
    }

    pub fn update_task(&self, actor: &Actor, id: &str, patch: &TaskPatch) -> Result<Option<Task>> {
        if !self.exists("tasks", id)? {
            return Ok(None);
        }
        if patch.is_empty() {
            return self.get_task(id);
        }
        if let Some(title) = &patch.title {
            require("Task title", title)?;
        }
        if let Some(owner) = &patch.owner_agent_id {
            self.check_ref("agents", "agent", owner.as_deref())?;
        }
        if let Some(workspace_id) = &patch.workspace_id {
            self.check_ref("workspaces", "workspace", workspace_id.as_deref())?;
        }
        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let set = |column: &str, value: &dyn rusqlite::ToSql| -> Result<()> {
            let sql = format!("UPDATE tasks SET {} = ?1, updated_at = ?2 WHERE id = ?3", column);
            tx.execute(&sql, params![value, ts, id])
                .with_context(|| format!("Failed to update task {}", column))?;
            Ok(())
        };
        if let Some(title) = &patch.title {
            set("title", title)?;
        }
        if let Some(description) = &patch.description {
            set("description", description)?;
        }
        if let Some(status) = &patch.status {
            set("status", &status.as_str())?;
        }
        if let Some(priority) = &patch.priority {
            set("priority", priority)?;
        }
        if let Some(owner) = &patch.owner_agent_id {
            set("owner_agent_id", owner)?;
        }
        if let Some(sort_order) = &patch.sort_order {
            set("sort_order", sort_order)?;
        }
        if let Some(workspace_id) = &patch.workspace_id {
            set("workspace_id", workspace_id)?;
        }

        audit::append(&tx, actor, AuditAction::TaskUpdate, id, patch)?;
        tx.commit().context("Failed to commit task update")?;
        self.get_task(id)
    }

    /// Overwrite a task's status. Returns `None` if the task does not exist.
    /// No compare-and-swap: the last writer wins.
    pub fn set_task_status(&self, actor: &Actor, id: &str, status: TaskStatus) -> Result<Option<Task>> {
        let Some(before) = self.get_task(id)? else {
            return Ok(None);
        };
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now(), id],
        )
        .context("Failed to update task status")?;
        let payload = serde_json::json!({"status": {"from": before.status, "to": status}});
        audit::append(&tx, actor, AuditAction::TaskUpdate, id, &payload)?;
        tx.commit().context("Failed to commit task status update")?;
        self.get_task(id)
    }

    // ── Board view ────────────────────────────────────────────────────

    pub fn get_board(&self, workspace_id: Option<&str>) -> Result<BoardView> {
        let all_tasks = self.list_tasks(&TaskFilter {
            workspace_id: workspace_id.map(str::to_string),
            ..TaskFilter::default()
        })?;

        let columns = TaskStatus::ALL
            .iter()
            .map(|status| ColumnView {
                status: *status,
                tasks: all_tasks
                    .iter()
                    .filter(|t| t.status == *status)
                    .cloned()
                    .collect(),
            })
            .collect();

        Ok(BoardView {
            workspace_id: workspace_id.map(str::to_string),
            columns,
        })
    }

    // ── Conversations & turns ─────────────────────────────────────────

    pub fn create_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        self.check_ref("tasks", "task", new.task_id.as_deref())?;
        self.check_ref("workspaces", "workspace", new.workspace_id.as_deref())?;
        if let Some(task_id) = &new.task_id
            && self.conversation_id_for_task(task_id)?.is_some()
        {
            return Err(ControlError::Conflict(format!(
                "Task {} already has a conversation",
                task_id
            ))
            .into());
        }
        let id = new_id();
        self.conn
            .execute(
                "INSERT INTO conversations (id, type, task_id, workspace_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, new.kind.as_str(), new.task_id, new.workspace_id, now()],
            )
            .context("Failed to insert conversation")?;
        self.get_conversation(&id)?
            .context("Conversation not found after insert")
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                "SELECT id, type, task_id, workspace_id, created_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query conversation")?
            .map(|(id, kind, task_id, workspace_id, created_at)| -> Result<Conversation> {
                Ok(Conversation {
                    id,
                    kind: ConversationType::from_str(&kind).map_err(|e| anyhow::anyhow!(e))?,
                    task_id,
                    workspace_id,
                    created_at,
                })
            })
            .transpose()
    }

    pub fn get_conversation_detail(&self, id: &str) -> Result<Option<ConversationDetail>> {
        let Some(conversation) = self.get_conversation(id)? else {
            return Ok(None);
        };
        let turns = self.list_turns(id)?;
        Ok(Some(ConversationDetail {
            conversation,
            turns,
        }))
    }

    fn conversation_id_for_task(&self, task_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT id FROM conversations WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query task conversation")
    }

    /// The task's TASK conversation, created on first access. `None` if the
    /// task does not exist.
    pub fn task_conversation(&self, task_id: &str) -> Result<Option<ConversationDetail>> {
        let Some(task) = self.get_task(task_id)? else {
            return Ok(None);
        };
        let id = match self.conversation_id_for_task(task_id)? {
            Some(id) => id,
            None => {
                self.create_conversation(&NewConversation {
                    kind: ConversationType::Task,
                    task_id: Some(task.id.clone()),
                    workspace_id: task.workspace_id.clone(),
                })?
                .id
            }
        };
        self.get_conversation_detail(&id)
    }

    /// Append a turn. Turns are never edited or deleted.
    pub fn append_turn(&self, conversation_id: &str, turn: &NewTurn) -> Result<Turn> {
        if !self.exists("conversations", conversation_id)? {
            return Err(ControlError::ConversationNotFound {
                id: conversation_id.to_string(),
            }
            .into());
        }
        let id = new_id();
        let tool_events = match &turn.tool_events {
            Some(v) => Some(serde_json::to_string(v).context("Failed to serialize tool events")?),
            None => None,
        };
        let created_at = now();
        self.conn
            .execute(
                "INSERT INTO turns (id, conversation_id, speaker_type, speaker_id, content, tool_events, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    conversation_id,
                    turn.speaker_type.as_str(),
                    turn.speaker_id,
                    turn.content,
                    tool_events,
                    created_at
                ],
            )
            .context("Failed to insert turn")?;
        Ok(Turn {
            id,
            conversation_id: conversation_id.to_string(),
            speaker_type: turn.speaker_type,
            speaker_id: turn.speaker_id.clone(),
            content: turn.content.clone(),
            tool_events: turn.tool_events.clone(),
            created_at,
        })
    }

    /// Turns in creation order; ties break on insertion order.
    pub fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let sql = format!(
            "SELECT {} FROM turns WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
            TURN_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_turns")?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query turns")?;
        let mut turns = Vec::new();
        for row in rows {
            let (id, conversation_id, speaker_str, speaker_id, content, events_str, created_at) =
                row.context("Failed to read turn row")?;
            let tool_events = match events_str {
                Some(s) => Some(
                    serde_json::from_str(&s)
                        .map_err(|e| anyhow::anyhow!("corrupt tool_events JSON '{}': {}", s, e))?,
                ),
                None => None,
            };
            turns.push(Turn {
                id,
                conversation_id,
                speaker_type: speaker_str.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                speaker_id,
                content,
                tool_events,
                created_at,
            });
        }
        Ok(turns)
    }

    pub fn count_conversations(&self, kind: ConversationType) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE type = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count conversations")
    }

    // ── War room runs ─────────────────────────────────────────────────

    pub fn create_war_room_run(
        &self,
        actor: &Actor,
        conversation_id: &str,
        workspace_id: Option<&str>,
        decision: &DecisionDocument,
    ) -> Result<WarRoomRun> {
        let id = new_id();
        let ts = now();
        let decision_json =
            serde_json::to_string(decision).context("Failed to serialize decision document")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO war_room_runs (id, conversation_id, workspace_id, final_answer, decision_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id,
                conversation_id,
                workspace_id,
                decision.final_answer_for_telegram,
                decision_json,
                ts
            ],
        )
        .context("Failed to insert war room run")?;
        let payload = serde_json::json!({
            "conversation_id": conversation_id,
            "proposed": decision.proposed_task_moves.len(),
            "applied": decision.applied_task_moves.len(),
        });
        audit::append(&tx, actor, AuditAction::WarRoomRun, &id, &payload)?;
        tx.commit().context("Failed to commit war room run")?;
        self.get_war_room_run(&id)?
            .context("War room run not found after insert")
    }

    /// Patch the delivery outcome onto an already-committed run.
    pub fn record_delivery(&self, run_id: &str, delivery: &DeliveryRecord) -> Result<Option<WarRoomRun>> {
        let count = self
            .conn
            .execute(
                "UPDATE war_room_runs SET delivery_target = ?1, delivery_thread_id = ?2,
                    delivery_message_id = ?3, delivery_error = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    delivery.target,
                    delivery.thread_id,
                    delivery.message_id,
                    delivery.error,
                    now(),
                    run_id
                ],
            )
            .context("Failed to record war room delivery")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_war_room_run(run_id)
    }

    pub fn get_war_room_run(&self, id: &str) -> Result<Option<WarRoomRun>> {
        let sql = format!("SELECT {} FROM war_room_runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query war room run")?
            .map(RunRow::into_run)
            .transpose()
    }

    /// Newest first.
    pub fn list_war_room_runs(&self, limit: i64) -> Result<Vec<WarRoomRun>> {
        let sql = format!(
            "SELECT {} FROM war_room_runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_war_room_runs")?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 500)], RunRow::from_row)
            .context("Failed to query war room runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read war room run row")?.into_run()?);
        }
        Ok(runs)
    }

    // ── Audit ─────────────────────────────────────────────────────────

    pub fn list_audit_events(&self, entity_type: Option<EntityType>, limit: i64) -> Result<Vec<AuditEvent>> {
        audit::list(&self.conn, entity_type, limit)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn query_workspace(conn: &Connection, id: &str) -> Result<Option<Workspace>> {
    let sql = format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLUMNS);
    conn.query_row(&sql, params![id], workspace_from_row)
        .optional()
        .context("Failed to query workspace")
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        gateway_id: row.get(2)?,
        telegram_chat_id: row.get(3)?,
        telegram_topic_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_gateway(conn: &Connection, id: &str) -> Result<Option<Gateway>> {
    let sql = format!("SELECT {} FROM gateways WHERE id = ?1", GATEWAY_COLUMNS);
    conn.query_row(&sql, params![id], gateway_from_row)
        .optional()
        .context("Failed to query gateway")
}

fn gateway_from_row(row: &Row<'_>) -> rusqlite::Result<Gateway> {
    Ok(Gateway {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        token: row.get(3)?,
        enabled: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_agent(conn: &Connection, id: &str) -> Result<Option<Agent>> {
    let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
    conn.query_row(&sql, params![id], AgentRow::from_row)
        .optional()
        .context("Failed to query agent")?
        .map(AgentRow::into_agent)
        .transpose()
}

fn query_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    conn.query_row(&sql, params![id], TaskRow::from_row)
        .optional()
        .context("Failed to query task")?
        .map(TaskRow::into_task)
        .transpose()
}

fn collect_tasks<I>(rows: I) -> Result<Vec<Task>>
where
    I: Iterator<Item = rusqlite::Result<TaskRow>>,
{
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.context("Failed to read task row")?.into_task()?);
    }
    Ok(tasks)
}

/// Intermediate row struct for reading agents before decoding the JSON
/// policy columns.
struct AgentRow {
    id: String,
    name: String,
    role: String,
    soul_md: String,
    model: Option<String>,
    openclaw_agent_id: Option<String>,
    enabled: bool,
    skills_allow: String,
    execution_policy: String,
    constraints: String,
    output_contract: String,
    workspace_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl AgentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            role: row.get(2)?,
            soul_md: row.get(3)?,
            model: row.get(4)?,
            openclaw_agent_id: row.get(5)?,
            enabled: row.get(6)?,
            skills_allow: row.get(7)?,
            execution_policy: row.get(8)?,
            constraints: row.get(9)?,
            output_contract: row.get(10)?,
            workspace_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_agent(self) -> Result<Agent> {
        Ok(Agent {
            skills_allow: serde_json::from_str(&self.skills_allow)
                .context("Failed to parse agent skills_allow JSON")?,
            execution_policy: serde_json::from_str(&self.execution_policy)
                .context("Failed to parse agent execution_policy JSON")?,
            constraints: serde_json::from_str(&self.constraints)
                .context("Failed to parse agent constraints JSON")?,
            output_contract: serde_json::from_str(&self.output_contract)
                .context("Failed to parse agent output_contract JSON")?,
            id: self.id,
            name: self.name,
            role: self.role,
            soul_md: self.soul_md,
            model: self.model,
            openclaw_agent_id: self.openclaw_agent_id,
            enabled: self.enabled,
            workspace_id: self.workspace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for tasks; `status` is decoded after the read.
struct TaskRow {
    id: String,
    title: String,
    description: Option<String>,
    status: String,
    priority: i64,
    owner_agent_id: Option<String>,
    sort_order: Option<i64>,
    workspace_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            status: row.get(3)?,
            priority: row.get(4)?,
            owner_agent_id: row.get(5)?,
            sort_order: row.get(6)?,
            workspace_id: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let status = TaskStatus::from_str(&self.status)
            .map_err(|_| ControlError::InvalidStatus(self.status.clone()))
            .context("Failed to parse task status")?;
        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority: self.priority,
            owner_agent_id: self.owner_agent_id,
            sort_order: self.sort_order,
            workspace_id: self.workspace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct RunRow {
    id: String,
    conversation_id: String,
    workspace_id: Option<String>,
    final_answer: String,
    decision_json: String,
    delivery_target: Option<String>,
    delivery_thread_id: Option<String>,
    delivery_message_id: Option<String>,
    delivery_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            workspace_id: row.get(2)?,
            final_answer: row.get(3)?,
            decision_json: row.get(4)?,
            delivery_target: row.get(5)?,
            delivery_thread_id: row.get(6)?,
            delivery_message_id: row.get(7)?,
            delivery_error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_run(self) -> Result<WarRoomRun> {
        let decision: DecisionDocument = serde_json::from_str(&self.decision_json)
            .context("Failed to parse war room decision JSON")?;
        Ok(WarRoomRun {
            id: self.id,
            conversation_id: self.conversation_id,
            workspace_id: self.workspace_id,
            final_answer: self.final_answer,
            decision,
            delivery_target: self.delivery_target,
            delivery_thread_id: self.delivery_thread_id,
            delivery_message_id: self.delivery_message_id,
            delivery_error: self.delivery_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
