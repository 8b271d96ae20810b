/// Workflow REST API endpoints
///
/// Submission goes through `WorkflowSubmitter`; the controller picks new
/// workflows up from the store's watch stream. Reads hydrate the status so
/// clients never see packed or offloaded node maps.

use super::{ApiResult, AppState};
use crate::workflow::types::{LabelSelector, Workflow};
use crate::error::EngineError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Label selector, e.g. `team=data,env!=prod`
    #[serde(default, rename = "labelSelector")]
    pub label_selector: Option<String>,
}

/// Create workflow routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/workflows/{namespace}", get(list_workflows).post(submit_workflow))
        .route(
            "/api/v1/workflows/{namespace}/{name}",
            get(get_workflow).delete(delete_workflow),
        )
        .route("/api/v1/workflows/{namespace}/{name}/stop", put(stop_workflow))
        .route("/api/v1/workflows/{namespace}/{name}/terminate", put(terminate_workflow))
}

/// POST /api/v1/workflows/{namespace}
async fn submit_workflow(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut workflow): Json<Workflow>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    if workflow.metadata.namespace.is_empty() {
        workflow.metadata.namespace = namespace.clone();
    }
    if workflow.metadata.namespace != namespace {
        return Err(EngineError::Validation(format!(
            "workflow namespace '{}' does not match request namespace '{}'",
            workflow.metadata.namespace, namespace
        ))
        .into());
    }
    let created = state.submitter.submit(workflow).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/workflows/{namespace}
async fn list_workflows(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let selector = LabelSelector::parse(query.label_selector.as_deref().unwrap_or(""))
        .map_err(EngineError::Validation)?;
    let mut workflows = state.submitter.store().list(Some(&namespace), &selector).await?;
    for workflow in workflows.iter_mut() {
        state.persister.hydrate(workflow).await?;
    }
    Ok(Json(json!({ "items": workflows })))
}

/// GET /api/v1/workflows/{namespace}/{name}
async fn get_workflow(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state.submitter.store().get(&namespace, &name).await?;
    state.persister.hydrate(&mut workflow).await?;
    Ok(Json(workflow))
}

/// DELETE /api/v1/workflows/{namespace}/{name}
async fn delete_workflow(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.controller.delete_workflow(&namespace, &name).await?;
    Ok(Json(json!({ "message": format!("Workflow '{}' deleted", name) })))
}

/// PUT /api/v1/workflows/{namespace}/{name}/stop
async fn stop_workflow(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state.submitter.stop(&namespace, &name).await?;
    state.persister.hydrate(&mut workflow).await?;
    Ok(Json(workflow))
}

/// PUT /api/v1/workflows/{namespace}/{name}/terminate
async fn terminate_workflow(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Workflow>> {
    let mut workflow = state.submitter.terminate(&namespace, &name).await?;
    state.persister.hydrate(&mut workflow).await?;
    Ok(Json(workflow))
}
