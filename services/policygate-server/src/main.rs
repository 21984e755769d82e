//! PolicyGate Server
//!
//! Policy-gated action gateway. Every protected action is checked against
//! Open Policy Agent before it runs.
//!
//! # Shapes
//!
//! - `docker`: rule administration over a Rego rule file plus
//!   `GET /run/{image}`, which starts the container only when OPA allows it
//! - `admission`: Kubernetes validating admission webhook on `POST /admit`
//!
//! # Usage
//!
//! ```bash
//! # Container gate against a local OPA
//! policygate-server --rule-file docker.rego
//!
//! # Admission controller
//! policygate-server --mode admission --policy k8s.rego --port 8443
//!
//! # Environment overrides
//! POLICYGATE__OPA__URL=http://opa:8181 policygate-server
//! ```

mod config;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use policygate_api::{create_router, ApiConfig, AppState, GatewayMode};
use policygate_guard::{ActionGate, AdmitPod, DockerRunner, ProtectedAction};
use policygate_policy::{DecisionClient, OpaClient, OpaConfig, VerdictPath};
use policygate_store::PolicyStore;

use crate::config::ServerConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// PolicyGate Server - policy-gated action gateway
#[derive(Parser, Debug)]
#[command(name = "policygate-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "POLICYGATE_CONFIG")]
    config: Option<String>,

    /// Deployment shape (docker, admission)
    #[arg(long, env = "POLICYGATE_MODE")]
    mode: Option<String>,

    /// Host to bind to
    #[arg(long, env = "POLICYGATE_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "POLICYGATE_PORT")]
    port: Option<u16>,

    /// Rule file (docker shape)
    #[arg(long, env = "POLICYGATE_RULE_FILE")]
    rule_file: Option<PathBuf>,

    /// Rego module to upload (admission shape)
    #[arg(long = "policy", env = "POLICYGATE_POLICY")]
    policy_module: Option<PathBuf>,

    /// OPA base URL
    #[arg(long, env = "POLICYGATE_OPA_URL")]
    opa_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "POLICYGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "POLICYGATE_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    /// Apply CLI overrides on top of the loaded configuration
    fn apply(self, config: &mut ServerConfig) -> anyhow::Result<()> {
        if let Some(mode) = self.mode {
            config.gateway.mode = parse_mode(&mode)?;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(rule_file) = self.rule_file {
            config.gateway.rule_file = rule_file;
        }
        if let Some(policy_module) = self.policy_module {
            config.gateway.policy_module = policy_module;
        }
        if let Some(opa_url) = self.opa_url {
            config.opa.url = opa_url;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        Ok(())
    }
}

fn parse_mode(mode: &str) -> anyhow::Result<GatewayMode> {
    match mode {
        "docker" => Ok(GatewayMode::Docker),
        "admission" => Ok(GatewayMode::Admission),
        other => anyhow::bail!("Unknown mode {other:?} (expected docker or admission)"),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let mut server_config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut server_config)?;

    // Initialize logging
    init_logging(&server_config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?server_config.gateway.mode,
        "Starting PolicyGate Server"
    );

    // Start metrics exporter if enabled
    if server_config.metrics.enabled {
        start_metrics_server(&server_config.metrics)?;
    }

    let (state, store) = match server_config.gateway.mode {
        GatewayMode::Docker => init_docker(&server_config).await?,
        GatewayMode::Admission => (init_admission(&server_config).await?, None),
    };

    let api_config = ApiConfig {
        mode: server_config.gateway.mode,
        enable_tracing: server_config.api.enable_tracing,
        max_body_size: server_config.api.max_body_size,
        slow_request_threshold: Duration::from_millis(
            server_config.logging.slow_request_threshold_ms,
        ),
    };

    let app = create_router(Arc::new(state), api_config);

    let addr = server_config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        host = %server_config.server.host,
        port = %server_config.server.port,
        "Server listening"
    );

    serve(listener, app, server_config.server.shutdown_timeout()).await?;

    if let Some(store) = store {
        store.close().await;
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

// =============================================================================
// Initialization Functions
// =============================================================================

/// Initialize tracing/logging
fn init_logging(config: &config::LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => {
            subscriber
                .with(fmt::layer().json().with_target(true))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().pretty().with_target(true))
                .init();
        }
    }
}

fn opa_config(config: &ServerConfig, endpoint: OpaConfig) -> OpaConfig {
    match config.opa.timeout() {
        Some(timeout) => endpoint.with_timeout(timeout),
        None => endpoint,
    }
}

/// Container gate: open the rule file and wire `docker run` behind OPA's Data API
async fn init_docker(config: &ServerConfig) -> anyhow::Result<(AppState, Option<Arc<PolicyStore>>)> {
    let store = PolicyStore::open(&config.gateway.rule_file)
        .await
        .context("Failed to open rule file")?;
    let store = Arc::new(store);

    let opa = OpaClient::new(opa_config(
        config,
        OpaConfig::data(&config.opa.url, &config.opa.decision_path),
    ))?;
    let opa = Arc::new(opa);

    tracing::info!(
        rule_file = %config.gateway.rule_file.display(),
        opa = %opa.base_url(),
        decision_path = %config.opa.decision_path,
        "Container gate initialized"
    );

    let action: Arc<dyn ProtectedAction> =
        Arc::new(DockerRunner::with_binary(&config.gateway.docker_binary));
    let gate = ActionGate::new(DecisionClient::new(opa.clone(), VerdictPath::Result), action);

    let state = AppState::new(gate).with_store(store.clone()).with_opa(opa);
    Ok((state, Some(store)))
}

/// Admission controller: upload the module and query OPA's Query API
async fn init_admission(config: &ServerConfig) -> anyhow::Result<AppState> {
    let module = tokio::fs::read_to_string(&config.gateway.policy_module)
        .await
        .with_context(|| {
            format!(
                "Failed to read policy module {}",
                config.gateway.policy_module.display()
            )
        })?;

    let opa = OpaClient::new(opa_config(
        config,
        OpaConfig::query(&config.opa.url, &config.opa.query),
    ))?;
    let opa = Arc::new(opa);

    opa.upload_policy(&config.opa.policy_id, &module)
        .await
        .context("Failed to upload policy module to OPA")?;

    tracing::info!(
        policy_module = %config.gateway.policy_module.display(),
        opa = %opa.base_url(),
        query = %config.opa.query,
        "Admission controller initialized"
    );

    let decisions = DecisionClient::new(
        opa.clone(),
        VerdictPath::Binding(config.opa.binding.clone()),
    );
    let gate = ActionGate::new(decisions, Arc::new(AdmitPod));

    Ok(AppState::new(gate).with_opa(opa))
}

/// Start Prometheus metrics exporter
fn start_metrics_server(config: &config::MetricsConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    // The exporter runs on its own background task
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    tracing::info!(port = config.port, "Metrics server started");
    Ok(())
}

// =============================================================================
// Graceful Shutdown
// =============================================================================

/// Serve until a shutdown signal, then give in-flight requests `timeout` to finish
async fn serve(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    timeout: Duration,
) -> anyhow::Result<()> {
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop_rx.changed().await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => return result.context("Server error"),
        () = shutdown_signal() => {}
    }

    let _ = stop_tx.send(true);
    tracing::info!(
        timeout_secs = timeout.as_secs(),
        "Waiting for in-flight requests to complete..."
    );

    match tokio::time::timeout(timeout, server).await {
        Ok(result) => result.context("Server error"),
        Err(_) => {
            tracing::warn!("Shutdown timeout elapsed, dropping remaining connections");
            Ok(())
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
