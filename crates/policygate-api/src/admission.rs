//! Kubernetes admission review mapping
//!
//! Only the fields the gate needs are modelled. The response echoes the
//! review's `apiVersion`, `kind` and `request.uid` so the API server can
//! correlate it with the request it sent.

use policygate_guard::{GateFault, Outcome};
use policygate_policy::ActionRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};

pub const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_KIND: &str = "AdmissionReview";

/// `admission.k8s.io/v1` AdmissionReview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

fn default_api_version() -> String {
    ADMISSION_API_VERSION.to_string()
}

fn default_kind() -> String {
    ADMISSION_KIND.to_string()
}

/// The proposed operation under review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    pub operation: String,
    #[serde(default)]
    pub object: Option<Value>,
}

/// The verdict sent back to the API server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

/// `meta/v1` Status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    pub code: u16,
}

/// `meta/v1` StatusDetails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    pub causes: Vec<StatusCause>,
}

/// `meta/v1` StatusCause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusCause {
    pub reason: String,
    pub message: String,
}

/// What a decoded review asks the gate to do
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    /// Evaluate the proposed operation
    Evaluate(ActionRequest),
    /// Refuse without evaluating; the reason goes back in the review
    Reject(String),
}

/// Decode a review and build the action request it asks about.
///
/// Undecodable bodies and reviews without a `request` or `uid` cannot be
/// answered in kind and are malformed requests. A review that has a `uid`
/// but no `object` (every DELETE review) is answered with a rejection.
pub fn parse_review(body: &[u8]) -> ApiResult<(AdmissionReview, ReviewAction)> {
    let review: AdmissionReview = serde_json::from_slice(body).map_err(|e| {
        ApiError::MalformedRequest(format!("failed to decode admission review: {e}"))
    })?;

    let request = review.request.as_ref().ok_or_else(|| {
        ApiError::MalformedRequest("admission review has no request".to_string())
    })?;
    if request.uid.is_empty() {
        return Err(ApiError::MalformedRequest(
            "admission request has an empty uid".to_string(),
        ));
    }

    let action = match &request.object {
        Some(Value::Null) | None => ReviewAction::Reject(format!(
            "admission request {} ({}) has no object to evaluate",
            request.uid, request.operation
        )),
        Some(object) => ReviewAction::Evaluate(ActionRequest::AdmitPod {
            uid: request.uid.clone(),
            namespace: request.namespace.clone(),
            operation: request.operation.clone(),
            object: object.clone(),
        }),
    };
    Ok((review, action))
}

/// Refuse `review` without evaluating it. The status is `BadRequest`,
/// never `Forbidden`, so it does not read as a policy violation.
pub fn rejection_response(review: &AdmissionReview, message: &str) -> AdmissionReview {
    let status = Status {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: Some("BadRequest".to_string()),
        details: Some(StatusDetails {
            causes: vec![StatusCause {
                reason: "FieldValueRequired".to_string(),
                message: message.to_string(),
            }],
        }),
        code: 400,
    };
    answer(review, false, status)
}

/// Build the response review for `review` from the gate outcome
pub fn review_response(review: &AdmissionReview, outcome: &Outcome) -> AdmissionReview {
    let (allowed, status) = match outcome {
        Outcome::Allowed { .. } => (
            true,
            Status {
                status: "Success".to_string(),
                message: "Allowed by policy".to_string(),
                reason: None,
                details: None,
                code: 200,
            },
        ),
        Outcome::Denied => (
            false,
            Status {
                status: "Failure".to_string(),
                message: "Denied by policy".to_string(),
                reason: Some("Forbidden".to_string()),
                details: Some(StatusDetails {
                    causes: vec![StatusCause {
                        reason: "PolicyViolation".to_string(),
                        message: "Pod creation denied by policy".to_string(),
                    }],
                }),
                code: 403,
            },
        ),
        Outcome::Faulted(fault) => {
            let cause = match fault {
                GateFault::Evaluation(_) => "EvaluationFailed",
                GateFault::ActionFailed(_) => "ActionFailed",
            };
            (
                false,
                Status {
                    status: "Failure".to_string(),
                    message: fault.detail(),
                    reason: Some("InternalError".to_string()),
                    details: Some(StatusDetails {
                        causes: vec![StatusCause {
                            reason: cause.to_string(),
                            message: format!("{}: {}", fault.code(), fault.detail()),
                        }],
                    }),
                    code: 500,
                },
            )
        }
    };

    answer(review, allowed, status)
}

fn answer(review: &AdmissionReview, allowed: bool, status: Status) -> AdmissionReview {
    let uid = review
        .request
        .as_ref()
        .map(|r| r.uid.clone())
        .unwrap_or_default();

    AdmissionReview {
        api_version: review.api_version.clone(),
        kind: review.kind.clone(),
        request: None,
        response: Some(AdmissionResponse {
            uid,
            allowed,
            status: Some(status),
        }),
    }
}
