//! HTTP response mapping for the container gate
//!
//! | Outcome | Status | Code |
//! |---|---|---|
//! | allowed | 200 | `ALLOWED` |
//! | denied | 403 | `POLICY_DENIED` |
//! | engine unreachable | 502 | `ENGINE_UNREACHABLE` |
//! | malformed verdict | 502 | `MALFORMED_VERDICT` |
//! | action failed | 500 | `ACTION_FAILED` |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use policygate_guard::{GateFault, Outcome};

use crate::error::ErrorResponse;

/// HTTP representation of a gate outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReply {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

/// Map the outcome of a container run onto an HTTP reply
pub fn http_reply(image: &str, outcome: &Outcome) -> GateReply {
    let (status, code, message) = match outcome {
        Outcome::Allowed { .. } => (
            StatusCode::OK,
            "ALLOWED",
            format!("Container running with image {image}"),
        ),
        Outcome::Denied => (
            StatusCode::FORBIDDEN,
            "POLICY_DENIED",
            "Policy violation: Image not allowed".to_string(),
        ),
        Outcome::Faulted(fault @ GateFault::Evaluation(_)) => (
            StatusCode::BAD_GATEWAY,
            fault.code(),
            format!("Policy evaluation failed: {}", fault.detail()),
        ),
        Outcome::Faulted(fault @ GateFault::ActionFailed(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            fault.code(),
            fault.detail(),
        ),
    };

    GateReply {
        status,
        body: ErrorResponse {
            code: code.to_string(),
            message,
        },
    }
}

impl IntoResponse for GateReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
