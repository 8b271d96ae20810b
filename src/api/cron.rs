/// CronWorkflow REST API endpoints
///
/// The cron scheduler service follows the store's watch stream, so creating,
/// deleting or rescheduling a CronWorkflow here takes effect without a restart.

use super::{ApiResult, AppState};
use crate::error::EngineError;
use crate::runtime::backoff::{retry_with_backoff, Backoff};
use crate::workflow::{
    submit::flatten_retry,
    types::{CronWorkflow, CronWorkflowStatus, LabelSelector},
    validate::validate_cron_workflow,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Create cron workflow routes
pub fn create_cron_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/cron-workflows/{namespace}", get(list_crons).post(create_cron))
        .route(
            "/api/v1/cron-workflows/{namespace}/{name}",
            get(get_cron).delete(delete_cron),
        )
        .route("/api/v1/cron-workflows/{namespace}/{name}/suspend", put(suspend_cron))
        .route("/api/v1/cron-workflows/{namespace}/{name}/resume", put(resume_cron))
}

/// POST /api/v1/cron-workflows/{namespace}
async fn create_cron(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut cron): Json<CronWorkflow>,
) -> ApiResult<(StatusCode, Json<CronWorkflow>)> {
    if cron.metadata.namespace.is_empty() {
        cron.metadata.namespace = namespace;
    }
    if cron.metadata.name.is_empty() {
        return Err(EngineError::Validation("metadata.name is required".to_string()).into());
    }
    validate_cron_workflow(&cron)?;

    cron.metadata.uid = Uuid::new_v4().to_string();
    cron.metadata.creation_timestamp = Some(Utc::now());
    cron.metadata.resource_version = 0;
    cron.status = CronWorkflowStatus::default();

    let created = state.crons.create(&cron).await?;
    tracing::info!("⏰ Created cron workflow {} ({})", created.metadata.key(), created.spec.schedule);
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/cron-workflows/{namespace}
async fn list_crons(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> ApiResult<Json<Value>> {
    let crons = state.crons.list(Some(&namespace), &LabelSelector::default()).await?;
    Ok(Json(json!({ "items": crons })))
}

/// GET /api/v1/cron-workflows/{namespace}/{name}
async fn get_cron(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<CronWorkflow>> {
    Ok(Json(state.crons.get(&namespace, &name).await?))
}

/// DELETE /api/v1/cron-workflows/{namespace}/{name}
async fn delete_cron(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.crons.delete(&namespace, &name).await?;
    tracing::info!("🗑️ Deleted cron workflow {}/{}", namespace, name);
    Ok(Json(json!({ "message": format!("CronWorkflow '{}' deleted", name) })))
}

/// PUT /api/v1/cron-workflows/{namespace}/{name}/suspend
async fn suspend_cron(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<CronWorkflow>> {
    Ok(Json(set_suspend(&state, &namespace, &name, true).await?))
}

/// PUT /api/v1/cron-workflows/{namespace}/{name}/resume
async fn resume_cron(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<CronWorkflow>> {
    Ok(Json(set_suspend(&state, &namespace, &name, false).await?))
}

async fn set_suspend(state: &AppState, namespace: &str, name: &str, suspend: bool) -> ApiResult<CronWorkflow> {
    let crons = &state.crons;
    let updated = retry_with_backoff(
        &Backoff::default(),
        &CancellationToken::new(),
        || async move {
            let mut cron = crons.get(namespace, name).await?;
            if cron.spec.suspend == suspend {
                return Ok::<_, EngineError>(cron);
            }
            cron.spec.suspend = suspend;
            Ok::<_, EngineError>(crons.update(&cron).await?)
        },
        |e| matches!(e, EngineError::Conflict(_)),
    )
    .await
    .map_err(flatten_retry)?;

    tracing::info!(
        "{} cron workflow {}",
        if suspend { "⏸️ Suspended" } else { "▶️ Resumed" },
        updated.metadata.key()
    );
    Ok(updated)
}
