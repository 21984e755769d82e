//! Open Policy Agent REST client
//!
//! Two ways of asking OPA for a decision are supported:
//!
//! - **Data API**: `POST /v1/data/<path>` with `{"input": ...}`, answered by
//!   `{"result": <value>}`
//! - **Query API**: `POST /v1/query` with `{"query": ..., "input": ...}`,
//!   answered by `{"result": [{<binding>: <value>, ...}, ...]}`

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{DecisionQuery, EngineError, PolicyEngine};

/// Which OPA API answers the decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpaEndpoint {
    /// Data API document path, e.g. `main/docker/allow`
    Data { path: String },
    /// Ad-hoc Rego query, e.g. `allow = data.kubernetes.admission.allow`
    Query { query: String },
}

/// OPA client configuration
#[derive(Debug, Clone)]
pub struct OpaConfig {
    /// Base URL, e.g. `http://localhost:8181`
    pub url: String,
    /// Decision endpoint
    pub endpoint: OpaEndpoint,
    /// Per-request timeout (none by default)
    pub timeout: Option<Duration>,
}

impl OpaConfig {
    /// Query a document through the Data API
    pub fn data(url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint: OpaEndpoint::Data { path: path.into() },
            timeout: None,
        }
    }

    /// Run an ad-hoc query through the Query API
    pub fn query(url: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            endpoint: OpaEndpoint::Query {
                query: query.into(),
            },
            timeout: None,
        }
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP client for an OPA server
pub struct OpaClient {
    base_url: String,
    endpoint: OpaEndpoint,
    client: reqwest::Client,
}

impl OpaClient {
    /// Create a new client
    pub fn new(config: OpaConfig) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            endpoint: config.endpoint,
            client,
        })
    }

    /// Base URL of the OPA server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upload a Rego module as policy `id` (`PUT /v1/policies/{id}`)
    pub async fn upload_policy(&self, id: &str, module: &str) -> Result<(), EngineError> {
        let response = self
            .client
            .put(format!("{}/v1/policies/{}", self.base_url, id))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(module.to_string())
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        check_status(response).await?;
        info!(policy_id = %id, bytes = module.len(), "Policy module uploaded to OPA");
        Ok(())
    }

    /// Check OPA liveness (`GET /health`)
    pub async fn health(&self) -> Result<(), EngineError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl PolicyEngine for OpaClient {
    async fn evaluate(&self, query: &DecisionQuery) -> Result<Value, EngineError> {
        let request = match &self.endpoint {
            OpaEndpoint::Data { path } => self
                .client
                .post(format!(
                    "{}/v1/data/{}",
                    self.base_url,
                    path.trim_matches('/')
                ))
                .json(query),
            OpaEndpoint::Query { query: rego } => self
                .client
                .post(format!("{}/v1/query", self.base_url))
                .json(&json!({ "query": rego, "input": query.input })),
        };

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let response = check_status(response).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        debug!(bytes = bytes.len(), "OPA result received");

        serde_json::from_slice(&bytes).map_err(|e| EngineError::Decode(e.to_string()))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Status {
        status: status.as_u16(),
        body,
    })
}
