//! Container gate handler

use axum::extract::{Path, State};
use policygate_guard::validate_image;
use policygate_policy::ActionRequest;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::reply::{http_reply, GateReply};
use crate::state::AppState;

/// `GET /run/{image}`: run the image if policy allows it
pub async fn run_container(
    State(state): State<Arc<AppState>>,
    Path(image): Path<String>,
) -> ApiResult<GateReply> {
    validate_image(&image)?;

    let request = ActionRequest::run_container(image.clone());
    let outcome = state.gate.handle(&request).await;

    Ok(http_reply(&image, &outcome))
}
