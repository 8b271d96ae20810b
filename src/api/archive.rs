/// Archived workflow REST API endpoints

use super::{ApiResult, AppState};
use crate::error::EngineError;
use crate::persist::{ArchiveFilter, ArchivedWorkflow};
use crate::workflow::types::{LabelSelector, Workflow, WorkflowPhase};
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
pub struct ArchiveQuery {
    pub namespace: Option<String>,
    /// Comma separated phases, e.g. `Failed,Error`
    pub phases: Option<String>,
    #[serde(rename = "labelSelector")]
    pub label_selector: Option<String>,
    #[serde(rename = "namePrefix")]
    pub name_prefix: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ArchiveQuery {
    fn filter(&self) -> Result<ArchiveFilter, EngineError> {
        let phases = self
            .phases
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<WorkflowPhase>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::Validation)?;
        let selector = LabelSelector::parse(self.label_selector.as_deref().unwrap_or(""))
            .map_err(EngineError::Validation)?;
        Ok(ArchiveFilter {
            phases,
            selector,
            name_prefix: self.name_prefix.clone().filter(|p| !p.is_empty()),
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Create archive routes
pub fn create_archive_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/archived-workflows", get(list_archived))
        .route("/api/v1/archived-workflows/{uid}", get(find_archived))
        .route(
            "/api/v1/archived-workflows/{namespace}/{uid}",
            get(get_archived).delete(delete_archived),
        )
        .route(
            "/api/v1/archived-workflows/{namespace}/{uid}/resubmit",
            put(resubmit_archived),
        )
}

/// GET /api/v1/archived-workflows
async fn list_archived(
    State(state): State<AppState>,
    Query(query): Query<ArchiveQuery>,
) -> ApiResult<Json<Value>> {
    let filter = query.filter()?;
    let items = state
        .archive
        .list(query.namespace.as_deref().filter(|ns| !ns.is_empty()), &filter)
        .await?;
    Ok(Json(json!({ "items": items })))
}

/// GET /api/v1/archived-workflows/{uid}
async fn find_archived(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> ApiResult<Json<ArchivedWorkflow>> {
    Ok(Json(state.archive.find_by_uid(&uid).await?))
}

/// GET /api/v1/archived-workflows/{namespace}/{uid}
async fn get_archived(
    State(state): State<AppState>,
    Path((namespace, uid)): Path<(String, String)>,
) -> ApiResult<Json<ArchivedWorkflow>> {
    Ok(Json(state.archive.get(&namespace, &uid).await?))
}

/// DELETE /api/v1/archived-workflows/{namespace}/{uid}
async fn delete_archived(
    State(state): State<AppState>,
    Path((namespace, uid)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    state.archive.delete(&namespace, &uid).await?;
    Ok(Json(json!({ "message": format!("Archived workflow '{}' deleted", uid) })))
}

/// PUT /api/v1/archived-workflows/{namespace}/{uid}/resubmit
async fn resubmit_archived(
    State(state): State<AppState>,
    Path((namespace, uid)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<Workflow>)> {
    let created = state.archive.resubmit(&namespace, &uid, &state.submitter).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
