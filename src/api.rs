//! REST API for the atomic operations bridge
//!
//! The server has no execution engine: verified operations are handed off
//! in `executing` (directly, or once approved) and an external runner posts
//! the result to `/api/operations/:id/execution`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{AtomicBridge, RequestContext};
use crate::error::AtomicOpsError;
use crate::models::{CorrectedAxes, ExecutionRecord};

pub const DEFAULT_USER: &str = "default";

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessRequest {
    pub user_input: String,
    pub user_id: Option<String>,
    pub persona_context: Option<String>,
    pub conversation_context: Option<String>,
    pub memory_context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CorrectionRequest {
    pub destination: Option<String>,
    pub consumer: Option<String>,
    pub semantics: Option<String>,
    pub reasoning: Option<String>,
}

impl CorrectionRequest {
    fn axes(&self) -> crate::Result<CorrectedAxes> {
        Ok(CorrectedAxes {
            destination: parse_axis(self.destination.as_deref())?,
            consumer: parse_axis(self.consumer.as_deref())?,
            semantics: parse_axis(self.semantics.as_deref())?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ClarificationRequest {
    pub response: String,
}

fn parse_axis<T: FromStr<Err = AtomicOpsError>>(raw: Option<&str>) -> crate::Result<Option<T>> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.parse().map(Some),
        None => Ok(None),
    }
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiReply = (StatusCode, Json<ApiResponse>);

fn reply<T: Serialize>(result: crate::Result<T>) -> ApiReply {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(error = %e, "Request failed");
            }
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}

fn status_for(error: &AtomicOpsError) -> StatusCode {
    match error {
        AtomicOpsError::OperationNotFound(_) => StatusCode::NOT_FOUND,
        AtomicOpsError::ValidationError(_) => StatusCode::BAD_REQUEST,
        AtomicOpsError::InvalidState(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub bridge: Arc<AtomicBridge>,
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn process(State(state): State<ApiState>, Json(req): Json<ProcessRequest>) -> ApiReply {
    let user_id = req
        .user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    info!(user_id = %user_id, "Received process request");

    let context = RequestContext {
        persona_context: req.persona_context,
        conversation_context: req.conversation_context,
        memory_context: req.memory_context,
    };
    reply(
        state
            .bridge
            .process_request(&req.user_input, &user_id, None, &context)
            .await,
    )
}

async fn get_operation(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiReply {
    let result = state
        .bridge
        .get_operation(id)
        .await
        .and_then(|op| op.ok_or(AtomicOpsError::OperationNotFound(id)));
    reply(result)
}

async fn approve(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiReply {
    reply(
        state
            .bridge
            .approve_operation(id, None, &RequestContext::default())
            .await,
    )
}

async fn reject(State(state): State<ApiState>, Path(id): Path<Uuid>) -> ApiReply {
    reply(state.bridge.reject_operation(id).await)
}

async fn correct(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CorrectionRequest>,
) -> ApiReply {
    let axes = match req.axes() {
        Ok(axes) => axes,
        Err(e) => return reply::<()>(Err(e)),
    };
    reply(
        state
            .bridge
            .record_user_correction(id, axes, req.reasoning)
            .await,
    )
}

async fn execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(record): Json<ExecutionRecord>,
) -> ApiReply {
    reply(state.bridge.record_execution(id, record).await)
}

async fn pending(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiReply {
    reply(state.bridge.get_pending_operations(&user_id).await)
}

async fn stats(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiReply {
    reply(state.bridge.stats(&user_id).await)
}

async fn clarification(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<ClarificationRequest>,
) -> ApiReply {
    reply(
        state
            .bridge
            .answer_clarification(&user_id, &req.response, None, &RequestContext::default())
            .await,
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(bridge: Arc<AtomicBridge>) -> Router {
    let state = ApiState { bridge };

    Router::new()
        .route("/health", get(health))
        .route("/api/process", post(process))
        .route("/api/operations/:id", get(get_operation))
        .route("/api/operations/:id/approve", post(approve))
        .route("/api/operations/:id/reject", post(reject))
        .route("/api/operations/:id/correct", post(correct))
        .route("/api/operations/:id/execution", post(execution))
        .route("/api/users/:user_id/pending", get(pending))
        .route("/api/users/:user_id/stats", get(stats))
        .route("/api/users/:user_id/clarification", post(clarification))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    bridge: Arc<AtomicBridge>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(bridge);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
