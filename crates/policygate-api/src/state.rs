//! Application state shared across handlers
//!
//! Holds the action gate and, depending on the deployment shape, the rule
//! store and the OPA client used for readiness checks.

use std::sync::Arc;

use policygate_guard::ActionGate;
use policygate_policy::OpaClient;
use policygate_store::PolicyStore;

use crate::error::{ApiError, ApiResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Gate every action passes through
    pub gate: ActionGate,
    /// Rule store behind the administrative surface
    pub store: Option<Arc<PolicyStore>>,
    /// OPA client probed by the readiness check
    pub opa: Option<Arc<OpaClient>>,
}

impl AppState {
    /// Create a new application state
    pub fn new(gate: ActionGate) -> Self {
        Self {
            gate,
            store: None,
            opa: None,
        }
    }

    /// Attach the rule store
    pub fn with_store(mut self, store: Arc<PolicyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the OPA client for readiness checks
    pub fn with_opa(mut self, opa: Arc<OpaClient>) -> Self {
        self.opa = Some(opa);
        self
    }

    /// The rule store, or an error when this deployment has none
    pub fn store(&self) -> ApiResult<&Arc<PolicyStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| ApiError::Internal("rule store is not configured".to_string()))
    }
}
