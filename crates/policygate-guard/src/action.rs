//! Protected actions
//!
//! The side effects the gate authorizes. An implementation is only ever
//! called after an allow verdict for the same request.

use std::process::Stdio;

use policygate_policy::ActionRequest;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The protected action ran and failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Action execution failed: {message}")]
pub struct ActionError {
    pub message: String,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A side effect gated by policy
#[async_trait::async_trait]
pub trait ProtectedAction: Send + Sync {
    /// Perform the action and return a short confirmation detail
    async fn perform(&self, request: &ActionRequest) -> Result<String, ActionError>;
}

/// Starts a detached container with `docker run --rm -d <image>`
#[derive(Debug, Clone)]
pub struct DockerRunner {
    binary: String,
}

impl DockerRunner {
    /// Use `docker` from `PATH`
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use a specific docker-compatible binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProtectedAction for DockerRunner {
    async fn perform(&self, request: &ActionRequest) -> Result<String, ActionError> {
        let ActionRequest::RunContainer { image } = request else {
            return Err(ActionError::new(format!(
                "{} cannot perform {}",
                self.binary,
                request.kind()
            )));
        };

        debug!(binary = %self.binary, %image, "Starting container");
        let output = Command::new(&self.binary)
            .args(["run", "--rm", "-d"])
            .arg(image)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ActionError::new(format!("failed to spawn {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(%image, status = %output.status, %stderr, "Container failed to start");
            return Err(ActionError::new(format!(
                "{} run exited with {}: {stderr}",
                self.binary, output.status
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(%image, container_id = %container_id, "Container started");
        Ok(container_id)
    }
}

/// Admission needs no local effect: allowing the review lets the API
/// server carry on with the operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitPod;

#[async_trait::async_trait]
impl ProtectedAction for AdmitPod {
    async fn perform(&self, request: &ActionRequest) -> Result<String, ActionError> {
        match request {
            ActionRequest::AdmitPod { .. } => Ok("Allowed by policy".to_string()),
            other => Err(ActionError::new(format!(
                "admission cannot perform {}",
                other.kind()
            ))),
        }
    }
}
