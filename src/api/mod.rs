/// HTTP API Layer
///
/// REST endpoints over the engine:
/// - Workflow submit, inspect, delete, stop and terminate
/// - CronWorkflow CRUD plus suspend and resume
/// - Archived workflow list, get, resubmit and delete
///
/// Every workflow a handler returns has its node map unpacked.

use crate::{
    error::EngineError,
    persist::{ArchiveRepository, StatusPersister},
    runtime::controller::WorkflowController,
    workflow::{storage::CronWorkflowStore, submit::WorkflowSubmitter},
};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

// Workflow endpoints
pub mod workflows;

// CronWorkflow endpoints
pub mod cron;

// Archived workflow endpoints
pub mod archive;

// Re-export router builders
pub use archive::create_archive_routes;
pub use cron::create_cron_routes;
pub use workflows::create_workflow_routes;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub submitter: WorkflowSubmitter,
    pub crons: CronWorkflowStore,
    pub controller: Arc<WorkflowController>,
    pub persister: StatusPersister,
    pub archive: ArchiveRepository,
    /// Bearer token required on every API call when set
    pub token: Option<String>,
}

/// Engine error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<crate::error::StoreError> for ApiError {
    fn from(err: crate::error::StoreError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::AlreadyExists(_) | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Capacity { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ API request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Reject requests without the configured bearer token
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        Some(_) => unauthorized("Invalid token"),
        None => unauthorized("Missing authorization token"),
    }
}

fn unauthorized(message: &str) -> Response {
    let body = json!({
        "error": message,
        "code": StatusCode::UNAUTHORIZED.as_u16(),
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
