use super::ApiError;
use crate::state::SyncState;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use nodesync_core::SyncError;
use nodesync_core::model::{ChangeBatch, ConsumerKey, Mutation, MutationResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header naming the acting collaborator.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub sync_state: Arc<SyncState>,
    pub batch_size: usize,
}

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_workspaces: usize,
    pub active_connections: usize,
    pub active_consumers: usize,
}

/// Query for GET /workspaces/{id}/changes
#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    /// Consumer key, `type:root`
    pub consumer: String,
    #[serde(default)]
    pub cursor: i64,
    pub limit: Option<usize>,
}

/// Create API routes
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/workspaces/{workspace_id}/mutations", post(push_mutations))
        .route("/workspaces/{workspace_id}/changes", get(get_changes))
        .with_state(state)
}

/// GET /api/status - Get server status (public endpoint)
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.sync_state.stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_workspaces: stats.active_workspaces,
        active_connections: stats.active_connections,
        active_consumers: stats.active_consumers,
    })
}

/// POST /api/workspaces/{id}/mutations - Push a batch of mutations
async fn push_mutations(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Json(mutations): Json<Vec<Mutation>>,
) -> Result<Json<Vec<MutationResult>>, ApiError> {
    let actor_id = actor(&headers)?;
    let hub = state.sync_state.hub(&workspace_id).await?;
    Ok(Json(hub.authority().push_mutations(&actor_id, mutations)))
}

/// GET /api/workspaces/{id}/changes - Pull one page of a consumer stream
async fn get_changes(
    State(state): State<ApiState>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangeBatch>, ApiError> {
    let actor_id = actor(&headers)?;
    let key: ConsumerKey = query.consumer.parse().map_err(SyncError::InvalidInput)?;
    let limit = query.limit.unwrap_or(state.batch_size);
    let hub = state.sync_state.hub(&workspace_id).await?;
    Ok(Json(
        hub.authority()
            .pull_changes(&actor_id, &key, query.cursor, limit)?,
    ))
}

fn actor(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError(SyncError::Permission(format!("missing {} header", ACTOR_HEADER))))
}
