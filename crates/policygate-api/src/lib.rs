//! PolicyGate HTTP API
//!
//! Protocol surfaces of the gateway. Each deployment shape mounts its own
//! routes next to the shared health endpoints:
//!
//! ```text
//! docker shape                          admission shape
//! ├── GET    /policies                  └── POST /admit
//! ├── POST   /policies
//! ├── DELETE /policies/{name}
//! ├── GET    /rules
//! └── GET    /run/{image}
//!
//! both: GET /health, GET /ready
//! ```
//!
//! Gate outcomes are translated by [`reply`] (plain HTTP) and [`admission`]
//! (AdmissionReview). Everything else that can go wrong is an [`ApiError`].

pub mod admission;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod reply;
pub mod routes;
pub mod state;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use state::AppState;

/// Deployment shape served by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    /// Rule administration plus `docker run` gating
    Docker,
    /// Kubernetes validating admission webhook
    Admission,
}

/// API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Deployment shape
    pub mode: GatewayMode,
    /// Enable request tracing
    pub enable_tracing: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Requests slower than this are logged at warn level
    pub slow_request_threshold: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Docker,
            enable_tracing: true,
            max_body_size: 2 * 1024 * 1024, // 2MB
            slow_request_threshold: Duration::from_millis(1000),
        }
    }
}

/// Create the main API router with all middleware
pub fn create_router(state: Arc<AppState>, config: ApiConfig) -> Router {
    let mut router = create_test_router(state, config.mode)
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(axum::middleware::from_fn_with_state(
            config.slow_request_threshold,
            middleware::timing_middleware,
        ));

    // Tracing sits inside the request ID layers so the span sees the ID
    if config.enable_tracing {
        router = router.layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");

                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        );
    }

    // Add request ID middleware
    let x_request_id = HeaderName::from_static("x-request-id");
    router
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

/// Create a minimal router (no middleware) for the given deployment shape
pub fn create_test_router(state: Arc<AppState>, mode: GatewayMode) -> Router {
    let routes = match mode {
        GatewayMode::Docker => routes::docker_routes(),
        GatewayMode::Admission => routes::admission_routes(),
    };

    Router::new()
        .merge(routes)
        .route("/health", axum::routing::get(handlers::health::health_check))
        .route("/ready", axum::routing::get(handlers::health::readiness_check))
        .with_state(state)
}
