//! Policy administration handlers
//!
//! Each endpoint maps onto one rule store operation.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use policygate_store::PolicyRule;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

/// Removal result
#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    /// Number of rule file lines dropped
    pub removed: usize,
}

/// `GET /policies`: the rule file verbatim
pub async fn list_policies(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let content = state.store()?.list().await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    ))
}

/// `GET /rules`: parsed `name = "body"` rules
pub async fn list_rules(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<PolicyRule>>> {
    Ok(Json(state.store()?.rules().await?))
}

/// `POST /policies` with `{"name": ..., "rule": ...}`
pub async fn add_policy(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PolicyRule>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(rule) = payload?;
    state.store()?.append(&rule).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /policies/{name}`: drops every line containing `name`
pub async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RemoveResponse>> {
    let removed = state.store()?.remove(&name).await?;
    Ok(Json(RemoveResponse { removed }))
}
