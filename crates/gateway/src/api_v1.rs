//! HTTP API v1: REST surface over the orchestrator.
//!
//! Endpoints:
//!
//! - `GET    /v1/tools`: List available tools
//! - `POST   /v1/agents/{agent_id}/execute`: Run an agent, wait for the answer
//! - `POST   /v1/agents/{agent_id}/stream`: Start a streaming execution
//! - `GET    /v1/streams`: Active streaming sessions
//! - `GET    /v1/streams/{session_id}`: Stream status
//! - `DELETE /v1/streams/{session_id}`: Cancel a stream
//! - `GET    /v1/streams/{session_id}/subscribers`: Relay subscribers of a session
//! - `GET    /v1/sessions/{session_id}/executions`: Execution records, newest first
//! - `POST   /v1/chat`: Enqueue a plain chat job
//! - `GET    /v1/ws`: WebSocket subscribe protocol

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use agentrelay_agent::{
    ChatJob, ExecutionOutcome, ExecutionRequest, JobQueue, Orchestrator, QueueError, StreamState,
    StreamingHandle, StreamingOptions,
};
use agentrelay_core::{Error, ExecutionError, ExecutionRecord, Message, ToolDefinition};
use agentrelay_stream::{ConnectionId, EventRelay, StreamStatus, StreamingSession};

use crate::ws;

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub relay: EventRelay,
    pub queue: JobQueue,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedApiState = Arc<ApiState>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/tools", get(list_tools_handler))
        .route("/agents/{agent_id}/execute", post(execute_handler))
        .route("/agents/{agent_id}/stream", post(stream_handler))
        .route("/streams", get(list_streams_handler))
        .route(
            "/streams/{session_id}",
            get(stream_status_handler).delete(cancel_stream_handler),
        )
        .route("/streams/{session_id}/subscribers", get(subscribers_handler))
        .route("/sessions/{session_id}/executions", get(executions_handler))
        .route("/chat", post(chat_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    /// Omit to start a fresh session
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_user")]
    user_id: String,
    message: String,
    #[serde(default)]
    context: Vec<Message>,
    #[serde(default)]
    streaming_options: Option<StreamingOptions>,
}

fn default_user() -> String {
    "anonymous".into()
}

impl ExecuteBody {
    fn into_request(self, agent_id: String) -> ExecutionRequest {
        let session_id = self.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut request = ExecutionRequest::new(agent_id, session_id, self.user_id, self.message)
            .with_context(self.context);
        request.streaming_options = self.streaming_options;
        request
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

/// Map a domain error onto the HTTP status a caller can act on.
fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::AgentNotFound(_) => StatusCode::NOT_FOUND,
        Error::Provider(_) => StatusCode::BAD_GATEWAY,
        Error::Execution(ExecutionError::SessionBusy { .. }) => StatusCode::CONFLICT,
        Error::Execution(ExecutionError::NotFound(_)) => StatusCode::NOT_FOUND,
        Error::Cancelled { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn from_domain(err: Error) -> ApiError {
    api_error(error_status(&err), err.to_string())
}

#[derive(Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

#[derive(Serialize, Deserialize)]
pub struct StreamListResponse {
    pub sessions: Vec<StreamingSession>,
    pub count: usize,
}

#[derive(Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribersResponse {
    pub subscriber_count: usize,
    pub subscriber_ids: Vec<ConnectionId>,
}

#[derive(Serialize, Deserialize)]
pub struct ExecutionListResponse {
    pub executions: Vec<ExecutionRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueuedResponse {
    pub queued: bool,
    pub session_id: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn list_tools_handler(State(state): State<SharedApiState>) -> Json<ToolListResponse> {
    let tools = state.orchestrator.tools().definitions();
    let count = tools.len();
    Json(ToolListResponse { tools, count })
}

async fn execute_handler(
    State(state): State<SharedApiState>,
    Path(agent_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecutionOutcome>, ApiError> {
    let request = body.into_request(agent_id);
    info!(agent_id = %request.agent_id, session_id = %request.session_id, "Blocking execution requested");

    state
        .orchestrator
        .execute_agent(request)
        .await
        .map(Json)
        .map_err(from_domain)
}

async fn stream_handler(
    State(state): State<SharedApiState>,
    Path(agent_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Result<(StatusCode, Json<StreamingHandle>), ApiError> {
    let request = body.into_request(agent_id);
    info!(agent_id = %request.agent_id, session_id = %request.session_id, "Streaming execution requested");

    let handle = state
        .orchestrator
        .execute_agent_streaming(request)
        .await
        .map_err(from_domain)?;

    // Startup failures are reported in-band; the only one is an unknown agent.
    let status = match handle.status {
        StreamState::Streaming => StatusCode::ACCEPTED,
        StreamState::Error => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(handle)))
}

async fn list_streams_handler(State(state): State<SharedApiState>) -> Json<StreamListResponse> {
    let sessions = state.orchestrator.registry().list_active();
    let count = sessions.len();
    Json(StreamListResponse { sessions, count })
}

async fn stream_status_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
) -> Json<StreamStatus> {
    Json(state.orchestrator.get_streaming_status(&session_id))
}

async fn cancel_stream_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.orchestrator.cancel_streaming_execution(&session_id);
    info!(session_id = %session_id, cancelled, "Stream cancel requested");
    Json(CancelResponse { cancelled })
}

async fn subscribers_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
) -> Json<SubscribersResponse> {
    Json(SubscribersResponse {
        subscriber_count: state.relay.subscriber_count(&session_id),
        subscriber_ids: state.relay.subscriber_ids(&session_id),
    })
}

async fn executions_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    let executions = state
        .orchestrator
        .store()
        .find_by_session(&session_id)
        .await
        .map_err(|e| from_domain(e.into()))?;
    Ok(Json(ExecutionListResponse { executions }))
}

async fn chat_handler(
    State(state): State<SharedApiState>,
    Json(job): Json<ChatJob>,
) -> Result<(StatusCode, Json<ChatQueuedResponse>), ApiError> {
    if job.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Message must not be empty"));
    }

    let session_id = job.session_id.clone();
    state.queue.submit(job).map_err(|e| {
        warn!(session_id = %session_id, "Chat job rejected: {e}");
        let status = match e {
            QueueError::Full => StatusCode::TOO_MANY_REQUESTS,
            QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        api_error(status, e.to_string())
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatQueuedResponse {
            queued: true,
            session_id,
        }),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────
