//! PolicyGate Guard - Action gate
//!
//! Binds one action request to its effect through a fixed sequence of states:
//!
//! ```text
//! Received ──► Evaluating ──┬──► Allowed   (action performed, or Faulted if it fails)
//!                           ├──► Denied    (no action)
//!                           └──► Faulted   (no verdict, no action)
//! ```
//!
//! # Key Principle
//!
//! **A denied request never produces a side effect.** Neither does a request
//! whose evaluation failed. The protected action is awaited strictly after an
//! allow verdict for the same request.

pub mod action;

use std::fmt;
use std::sync::Arc;

use policygate_policy::{ActionRequest, DecisionClient, EvaluationFault, Verdict};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub use action::{ActionError, AdmitPod, DockerRunner, ProtectedAction};

/// Errors raised before a request reaches the gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("Malformed request: {message}")]
    MalformedRequest { message: String },
}

pub type Result<T> = std::result::Result<T, GuardError>;

/// Check an image reference before it is evaluated or handed to docker.
///
/// Rejects empty references, references starting with `-` (docker would
/// parse them as flags) and references containing whitespace or control
/// characters.
pub fn validate_image(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(GuardError::MalformedRequest {
            message: "image reference must not be empty".to_string(),
        });
    }
    if image.starts_with('-') {
        return Err(GuardError::MalformedRequest {
            message: format!("image reference {image:?} must not start with '-'"),
        });
    }
    if image.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GuardError::MalformedRequest {
            message: format!("image reference {image:?} contains whitespace"),
        });
    }
    Ok(())
}

/// States a request passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Received,
    Evaluating,
    Allowed,
    Denied,
    Faulted,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Evaluating => "evaluating",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Why a request ended up faulted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFault {
    /// No verdict could be obtained
    Evaluation(EvaluationFault),
    /// Allowed, but the action itself failed
    ActionFailed(ActionError),
}

impl GateFault {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Evaluation(fault) => fault.code(),
            Self::ActionFailed(_) => "ACTION_FAILED",
        }
    }

    /// Human-readable failure detail
    pub fn detail(&self) -> String {
        match self {
            Self::Evaluation(fault) => fault.to_string(),
            Self::ActionFailed(err) => err.to_string(),
        }
    }
}

/// Terminal state of a gated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Allowed { detail: String },
    Denied,
    Faulted(GateFault),
}

impl Outcome {
    /// The terminal [`GateState`]
    pub fn state(&self) -> GateState {
        match self {
            Self::Allowed { .. } => GateState::Allowed,
            Self::Denied => GateState::Denied,
            Self::Faulted(_) => GateState::Faulted,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// The action gate
#[derive(Clone)]
pub struct ActionGate {
    decisions: DecisionClient,
    action: Arc<dyn ProtectedAction>,
}

impl ActionGate {
    /// Create a gate performing `action` on allow
    pub fn new(decisions: DecisionClient, action: Arc<dyn ProtectedAction>) -> Self {
        Self { decisions, action }
    }

    /// Run one request through the gate
    pub async fn handle(&self, request: &ActionRequest) -> Outcome {
        let span = info_span!(
            "gate",
            kind = request.kind(),
            subject = %request.subject(),
        );

        async {
            debug!(state = %GateState::Received);
            debug!(state = %GateState::Evaluating);

            let outcome = match self.decisions.evaluate(request).await {
                Verdict::Allow => match self.action.perform(request).await {
                    Ok(detail) => Outcome::Allowed { detail },
                    Err(err) => {
                        warn!(error = %err, "Allowed action failed");
                        Outcome::Faulted(GateFault::ActionFailed(err))
                    }
                },
                Verdict::Deny => Outcome::Denied,
                Verdict::EvaluationFailed(fault) => Outcome::Faulted(GateFault::Evaluation(fault)),
            };

            let state = outcome.state();
            metrics::counter!(
                "policygate_decisions_total",
                "kind" => request.kind(),
                "outcome" => state.to_string()
            )
            .increment(1);
            info!(%state, "Gate decision");

            outcome
        }
        .instrument(span)
        .await
    }
}
