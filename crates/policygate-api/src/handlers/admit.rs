//! Admission review handler

use axum::{body::Bytes, extract::State, Json};
use std::sync::Arc;

use crate::admission::{
    parse_review, rejection_response, review_response, AdmissionReview, ReviewAction,
};
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /admit`: review a proposed pod operation.
///
/// Reviews that cannot be decoded, or carry no `request` or `uid`, are
/// rejected with 400 before any evaluation. Every other review gets a 200
/// carrying the verdict, or a refusal when there is no object to evaluate.
pub async fn admit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<AdmissionReview>> {
    let (review, action) = parse_review(&body)?;

    let response = match action {
        ReviewAction::Evaluate(request) => {
            let outcome = state.gate.handle(&request).await;
            review_response(&review, &outcome)
        }
        ReviewAction::Reject(message) => {
            tracing::warn!(%message, "Admission review refused without evaluation");
            rejection_response(&review, &message)
        }
    };

    Ok(Json(response))
}
