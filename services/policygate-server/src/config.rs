//! Server Configuration
//!
//! Configuration management for the PolicyGate server.
//! Supports environment variables, config files, and CLI arguments.

use policygate_api::GatewayMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deployment shape and protected action
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Policy engine connection
    #[serde(default)]
    pub opa: OpaSettings,

    /// API configuration
    #[serde(default)]
    pub api: ApiSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long in-flight requests may take to drain after a shutdown signal
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerSettings {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid socket address {addr}: {e}"))
    }

    /// Get the shutdown timeout duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Deployment shape (docker, admission)
    #[serde(default = "default_mode")]
    pub mode: GatewayMode,

    /// Rule file behind the administrative surface (docker shape)
    #[serde(default = "default_rule_file")]
    pub rule_file: PathBuf,

    /// Rego module uploaded to OPA at startup (admission shape)
    #[serde(default = "default_policy_module")]
    pub policy_module: PathBuf,

    /// Docker CLI used to start allowed containers
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            rule_file: default_rule_file(),
            policy_module: default_policy_module(),
            docker_binary: default_docker_binary(),
        }
    }
}

/// OPA connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpaSettings {
    /// OPA base URL
    #[serde(default = "default_opa_url")]
    pub url: String,

    /// Data API document queried in the docker shape
    #[serde(default = "default_decision_path")]
    pub decision_path: String,

    /// Query API query run in the admission shape
    #[serde(default = "default_query")]
    pub query: String,

    /// Binding holding the decision in the query result
    #[serde(default = "default_binding")]
    pub binding: String,

    /// Per-request timeout in seconds (unset = no timeout)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Policy id the admission module is uploaded under
    #[serde(default = "default_policy_id")]
    pub policy_id: String,
}

impl Default for OpaSettings {
    fn default() -> Self {
        Self {
            url: default_opa_url(),
            decision_path: default_decision_path(),
            query: default_query(),
            binding: default_binding(),
            timeout_secs: None,
            policy_id: default_policy_id(),
        }
    }
}

impl OpaSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Enable request tracing
    #[serde(default = "default_true")]
    pub enable_tracing: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enable_tracing: true,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log slow requests threshold in ms
    #[serde(default = "default_slow_request_threshold")]
    pub slow_request_threshold_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            slow_request_threshold_ms: default_slow_request_threshold(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port (separate from main server)
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// =============================================================================
// Default Functions
// =============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_mode() -> GatewayMode {
    GatewayMode::Docker
}

fn default_rule_file() -> PathBuf {
    PathBuf::from("docker.rego")
}

fn default_policy_module() -> PathBuf {
    PathBuf::from("k8s.rego")
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_opa_url() -> String {
    "http://localhost:8181".to_string()
}

fn default_decision_path() -> String {
    "main/docker/allow".to_string()
}

fn default_query() -> String {
    "allow = data.kubernetes.admission.allow".to_string()
}

fn default_binding() -> String {
    "allow".to_string()
}

fn default_policy_id() -> String {
    "kubernetes/admission".to_string()
}

fn default_max_body_size() -> usize {
    2 * 1024 * 1024 // 2MB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_slow_request_threshold() -> u64 {
    1000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Configuration Loading
// =============================================================================

impl ServerConfig {
    /// Load configuration from environment and optional config file
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));

        // POLICYGATE__OPA__URL=... overrides opa.url
        builder = builder.add_source(
            config::Environment::with_prefix("POLICYGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let server_config: ServerConfig = builder.build()?.try_deserialize()?;
        Ok(server_config)
    }
}
