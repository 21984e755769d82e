//! PolicyGate Policy - Decision client
//!
//! Turns an action request into a policy-engine query and interprets the
//! engine's answer as a single [`Verdict`].
//!
//! # Key Principle
//!
//! **"The engine said no" and "the engine could not answer" are different
//! verdicts.** A missing or non-boolean decision field is reported as
//! [`EvaluationFault::MalformedVerdict`], never folded into [`Verdict::Deny`].
//!
//! Nothing here retries. One request yields exactly one verdict.

pub mod opa;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub use opa::{OpaClient, OpaConfig, OpaEndpoint};

/// An action waiting on a policy decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionRequest {
    /// Launch a container from an image reference
    RunContainer { image: String },
    /// Admit a Kubernetes object
    AdmitPod {
        /// Correlation identity of the admission request (not sent to the engine)
        uid: String,
        namespace: String,
        operation: String,
        object: Value,
    },
}

impl ActionRequest {
    /// Request to run a container
    pub fn run_container(image: impl Into<String>) -> Self {
        Self::RunContainer {
            image: image.into(),
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunContainer { .. } => "run_container",
            Self::AdmitPod { .. } => "admit_pod",
        }
    }

    /// The thing being gated: image reference or admission uid
    pub fn subject(&self) -> &str {
        match self {
            Self::RunContainer { image } => image,
            Self::AdmitPod { uid, .. } => uid,
        }
    }
}

/// Query document sent to the policy engine: `{"input": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionQuery {
    pub input: Value,
}

impl DecisionQuery {
    /// Embed the request's identifying fields under the fixed schema paths
    /// `input.docker_image.name` and `input.request.{namespace,operation,object}`.
    pub fn for_request(request: &ActionRequest) -> Self {
        let input = match request {
            ActionRequest::RunContainer { image } => json!({
                "docker_image": { "name": image },
            }),
            ActionRequest::AdmitPod {
                namespace,
                operation,
                object,
                ..
            } => json!({
                "request": {
                    "namespace": namespace,
                    "operation": operation,
                    "object": object,
                },
            }),
        };
        Self { input }
    }
}

/// Errors raised while talking to the policy engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Policy engine request failed: {0}")]
    Transport(String),

    #[error("Policy engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Policy engine returned an undecodable document: {0}")]
    Decode(String),

    #[error("Invalid policy engine configuration: {0}")]
    Config(String),
}

/// Why no verdict could be obtained
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationFault {
    #[error("engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("malformed result: {0}")]
    MalformedVerdict(String),
}

impl EvaluationFault {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::EngineUnreachable(_) => "ENGINE_UNREACHABLE",
            Self::MalformedVerdict(_) => "MALFORMED_VERDICT",
        }
    }
}

impl From<EngineError> for EvaluationFault {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Decode(_) => Self::MalformedVerdict(err.to_string()),
            EngineError::Transport(_) | EngineError::Status { .. } | EngineError::Config(_) => {
                Self::EngineUnreachable(err.to_string())
            }
        }
    }
}

/// Outcome of one policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    EvaluationFailed(EvaluationFault),
}

impl Verdict {
    /// Label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::EvaluationFailed(_) => "evaluation_failed",
        }
    }
}

/// Where the boolean decision lives in the engine's result document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictPath {
    /// Top-level `result` field (OPA Data API)
    Result,
    /// Named binding in the first entry of the `result` set (OPA Query API)
    Binding(String),
}

impl VerdictPath {
    /// Extract the decision, failing on an absent or non-boolean field
    pub fn extract(&self, document: &Value) -> Result<bool, EvaluationFault> {
        let field = match self {
            Self::Result => document.get("result").ok_or_else(|| {
                EvaluationFault::MalformedVerdict(
                    "result field is missing (decision undefined)".to_string(),
                )
            })?,
            Self::Binding(name) => {
                let first = document
                    .get("result")
                    .and_then(Value::as_array)
                    .and_then(|set| set.first())
                    .ok_or_else(|| {
                        EvaluationFault::MalformedVerdict("result set is empty".to_string())
                    })?;
                first.get(name).ok_or_else(|| {
                    EvaluationFault::MalformedVerdict(format!("binding {name} is missing"))
                })?
            }
        };

        field.as_bool().ok_or_else(|| {
            EvaluationFault::MalformedVerdict(format!("decision is not a boolean: {field}"))
        })
    }
}

/// Policy engine trait
#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluate a query and return the raw result document
    async fn evaluate(&self, query: &DecisionQuery) -> Result<Value, EngineError>;
}

/// Builds queries, dispatches them and interprets the result
#[derive(Clone)]
pub struct DecisionClient {
    engine: Arc<dyn PolicyEngine>,
    path: VerdictPath,
}

impl DecisionClient {
    /// Create a client reading the decision at `path`
    pub fn new(engine: Arc<dyn PolicyEngine>, path: VerdictPath) -> Self {
        Self { engine, path }
    }

    /// Obtain exactly one verdict for `request`
    pub async fn evaluate(&self, request: &ActionRequest) -> Verdict {
        let query = DecisionQuery::for_request(request);

        let document = match self.engine.evaluate(&query).await {
            Ok(document) => document,
            Err(err) => {
                warn!(
                    kind = request.kind(),
                    subject = request.subject(),
                    error = %err,
                    "Policy engine call failed"
                );
                return Verdict::EvaluationFailed(err.into());
            }
        };

        match self.path.extract(&document) {
            Ok(true) => Verdict::Allow,
            Ok(false) => Verdict::Deny,
            Err(fault) => {
                warn!(
                    kind = request.kind(),
                    subject = request.subject(),
                    %fault,
                    "Policy engine returned no usable decision"
                );
                debug!(document = %document, "Rejected result document");
                Verdict::EvaluationFailed(fault)
            }
        }
    }
}
