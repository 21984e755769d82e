//! API Routes

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::state::AppState;

/// Container gate: administrative surface over the rule file plus `/run`
pub fn docker_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/policies",
            get(handlers::policies::list_policies).post(handlers::policies::add_policy),
        )
        .route("/rules", get(handlers::policies::list_rules))
        .route("/policies/:name", delete(handlers::policies::delete_policy))
        .route("/run/*image", get(handlers::run::run_container))
}

/// Admission controller: `/admit`
pub fn admission_routes() -> Router<Arc<AppState>> {
    Router::new().route("/admit", post(handlers::admit::admit))
}
