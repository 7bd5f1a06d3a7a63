use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, Path, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::audit::Actor;
use super::db::DbHandle;
use super::gateway::GatewayStatus;
use super::models::*;
use super::war_room::WarRoom;
use crate::config::Settings;
use crate::errors::ControlError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct AgentQuery {
    pub workspace_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct BoardQuery {
    pub workspace_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct AuditQuery {
    pub entity_type: Option<EntityType>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct RunWarRoomRequest {
    pub workspace_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ControlError>() {
            if e.is_not_found() {
                return ApiError::NotFound(e.to_string());
            }
            match e {
                ControlError::UnknownReference { .. }
                | ControlError::InvalidStatus(_)
                | ControlError::BadRequest(_) => return ApiError::BadRequest(e.to_string()),
                ControlError::Conflict(_) => return ApiError::Conflict(e.to_string()),
                _ => {}
            }
        }
        tracing::error!(error = %format!("{:#}", err), "Request failed");
        ApiError::Internal(err.to_string())
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        anyhow::Error::from(err).into()
    }
}

/// JSON body extractor whose rejections use the `{"error": ...}` envelope.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/workspaces", get(list_workspaces).post(create_workspace))
        .route("/api/workspaces/{id}", get(get_workspace).patch(update_workspace))
        .route("/api/gateways", get(list_gateways).post(create_gateway))
        .route("/api/gateways/{id}", get(get_gateway).patch(update_gateway))
        .route("/api/gateway/status", get(gateway_status))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/{id}", get(get_agent).patch(update_agent))
        .route(
            "/api/agents/{id}/work-state",
            get(get_work_state).put(upsert_work_state),
        )
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).patch(update_task))
        .route("/api/tasks/{id}/conversation", get(get_task_conversation))
        .route("/api/board", get(get_board))
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/{id}", get(get_conversation))
        .route("/api/conversations/{id}/turns", post(add_turn))
        .route("/api/war-room/run", post(run_war_room))
        .route("/api/war-room/runs", get(list_runs))
        .route("/api/war-room/runs/{id}", get(get_run))
        .route("/api/audit", get(list_audit))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

// Workspaces

async fn list_workspaces(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let workspaces = state.db.call(|db| db.list_workspaces()).await?;
    Ok(Json(workspaces))
}

async fn create_workspace(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewWorkspace>,
) -> Result<impl IntoResponse, ApiError> {
    let workspace = state
        .db
        .call(move |db| db.create_workspace(&Actor::operator(), &req))
        .await?;
    Ok((StatusCode::CREATED, Json(workspace)))
}

async fn get_workspace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let workspace = state
        .db
        .call(move |db| db.get_workspace(&lookup))
        .await?
        .ok_or_else(|| ControlError::WorkspaceNotFound { id })?;
    Ok(Json(workspace))
}

async fn update_workspace(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<WorkspacePatch>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let workspace = state
        .db
        .call(move |db| db.update_workspace(&Actor::operator(), &lookup, &patch))
        .await?
        .ok_or_else(|| ControlError::WorkspaceNotFound { id })?;
    Ok(Json(workspace))
}

// Gateways

async fn list_gateways(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let gateways = state.db.call(|db| db.list_gateways()).await?;
    Ok(Json(gateways))
}

async fn create_gateway(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewGateway>,
) -> Result<impl IntoResponse, ApiError> {
    let gateway = state
        .db
        .call(move |db| db.create_gateway(&Actor::operator(), &req))
        .await?;
    Ok((StatusCode::CREATED, Json(gateway)))
}

async fn get_gateway(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let gateway = state
        .db
        .call(move |db| db.get_gateway(&lookup))
        .await?
        .ok_or_else(|| ControlError::GatewayNotFound { id })?;
    Ok(Json(gateway))
}

async fn update_gateway(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<GatewayPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let gateway = state
        .db
        .call(move |db| db.update_gateway(&Actor::operator(), &lookup, &patch))
        .await?
        .ok_or_else(|| ControlError::GatewayNotFound { id })?;
    Ok(Json(gateway))
}

async fn gateway_status(State(state): State<SharedState>) -> Json<GatewayStatus> {
    let status = match state.settings.gateway_client() {
        Ok(Some(client)) => client.probe().await,
        Ok(None) => GatewayStatus::not_configured(state.settings.openclaw_gateway_url.clone()),
        Err(e) => GatewayStatus {
            configured: true,
            gateway_url: state.settings.openclaw_gateway_url.clone(),
            error: Some(e.to_string()),
            ..GatewayStatus::default()
        },
    };
    Json(status)
}

// Agents

async fn list_agents(
    State(state): State<SharedState>,
    Query(query): Query<AgentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let agents = state
        .db
        .call(move |db| db.list_agents(query.workspace_id.as_deref()))
        .await?;
    Ok(Json(agents))
}

async fn create_agent(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewAgent>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state
        .db
        .call(move |db| db.create_agent(&Actor::operator(), &req))
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let agent = state
        .db
        .call(move |db| db.get_agent(&lookup))
        .await?
        .ok_or_else(|| ControlError::AgentNotFound { id })?;
    Ok(Json(agent))
}

async fn update_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<AgentPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let agent = state
        .db
        .call(move |db| db.update_agent(&Actor::operator(), &lookup, &patch))
        .await?
        .ok_or_else(|| ControlError::AgentNotFound { id })?;
    Ok(Json(agent))
}

/// `null` when the agent has never reported.
async fn get_work_state(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let work_state = state
        .db
        .call(move |db| {
            if db.get_agent(&id)?.is_none() {
                return Err(ControlError::AgentNotFound { id }.into());
            }
            db.get_work_state(&id)
        })
        .await?;
    Ok(Json(work_state))
}

async fn upsert_work_state(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<WorkStateUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let work_state = state
        .db
        .call(move |db| db.upsert_work_state(&Actor::operator(), &id, &update))
        .await?;
    Ok(Json(work_state))
}

// Tasks

async fn list_tasks(
    State(state): State<SharedState>,
    Query(filter): Query<TaskFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.db.call(move |db| db.list_tasks(&filter)).await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .call(move |db| db.create_task(&Actor::operator(), &req))
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let task = state
        .db
        .call(move |db| db.get_task(&lookup))
        .await?
        .ok_or_else(|| ControlError::TaskNotFound { id })?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(patch): ApiJson<TaskPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let task = state
        .db
        .call(move |db| db.update_task(&Actor::operator(), &lookup, &patch))
        .await?
        .ok_or_else(|| ControlError::TaskNotFound { id })?;
    Ok(Json(task))
}

async fn get_task_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let detail = state
        .db
        .call(move |db| db.task_conversation(&lookup))
        .await?
        .ok_or_else(|| ControlError::TaskNotFound { id })?;
    Ok(Json(detail))
}

async fn get_board(
    State(state): State<SharedState>,
    Query(query): Query<BoardQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let board = state
        .db
        .call(move |db| db.get_board(query.workspace_id.as_deref()))
        .await?;
    Ok(Json(board))
}

// Conversations

async fn create_conversation(
    State(state): State<SharedState>,
    ApiJson(req): ApiJson<NewConversation>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state.db.call(move |db| db.create_conversation(&req)).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let detail = state
        .db
        .call(move |db| db.get_conversation_detail(&lookup))
        .await?
        .ok_or_else(|| ControlError::ConversationNotFound { id })?;
    Ok(Json(detail))
}

async fn add_turn(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ApiJson(turn): ApiJson<NewTurn>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = state.db.call(move |db| db.append_turn(&id, &turn)).await?;
    Ok((StatusCode::CREATED, Json(turn)))
}

// War room

/// The body is optional; `{"workspace_id": "..."}` scopes the run.
async fn run_war_room(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: RunWarRoomRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunWarRoomRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid war room request: {}", e)))?
    };

    let war_room =
        WarRoom::configure(state.db.clone(), &state.settings, req.workspace_id.as_deref()).await?;
    let outcome = war_room.run().await?;
    Ok(Json(outcome))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50);
    let runs = state.db.call(move |db| db.list_war_room_runs(limit)).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let run = state
        .db
        .call(move |db| db.get_war_room_run(&lookup))
        .await?
        .ok_or_else(|| ControlError::RunNotFound { id })?;
    Ok(Json(run))
}

// Audit

async fn list_audit(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let events = state
        .db
        .call(move |db| db.list_audit_events(query.entity_type, limit))
        .await?;
    Ok(Json(events))
}
