//! Router Daemon - Inference Request Routing Control Plane
//!
//! Runs the router's background machinery: discovery, liveness probes,
//! engine stats scraping, request stats, dynamic policy reloads and the
//! periodic stats log. The request-forwarding layer embeds `router-core`
//! and calls `select`/`record`; this daemon is the standalone host for the
//! control plane.
//!
//! # Usage
//!
//! ```bash
//! # Static backends
//! router-daemon \
//!     --static-backends http://10.0.0.1:8000,http://10.0.0.2:8000 \
//!     --static-models llama-3-8b,llama-3-8b
//!
//! # Kubernetes pod discovery
//! router-daemon --discovery k8s --k8s-namespace inference --k8s-label-selector app=vllm
//!
//! # With config file
//! router-daemon --config /etc/inference-router/router.toml
//!
//! # Verbose logging
//! RUST_LOG=debug router-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Re-read the dynamic config file now

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use router_core::config::{
    default_config_path, load_config_from_path, parse_static_backends, ConfigOverrides,
    DiscoveryMode,
};
use router_core::{PollOutcome, Router, RouterConfig, StrategyKind};

/// Router Daemon - control plane for routing inference requests
#[derive(Parser, Debug)]
#[command(name = "router-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend discovery mode (static, k8s)
    #[arg(long, value_name = "MODE")]
    discovery: Option<DiscoveryMode>,

    /// Comma-separated backend URLs for static discovery
    #[arg(long, value_name = "URLS")]
    static_backends: Option<String>,

    /// Comma-separated model per static backend
    #[arg(long, value_name = "MODELS", requires = "static_backends")]
    static_models: Option<String>,

    /// Comma-separated role per static backend (empty for none)
    #[arg(long, value_name = "ROLES", requires = "static_backends")]
    static_roles: Option<String>,

    /// Probe static backends for liveness
    #[arg(long)]
    static_health_checks: bool,

    /// Namespace watched in k8s mode
    #[arg(long, value_name = "NAMESPACE")]
    k8s_namespace: Option<String>,

    /// Port the engines listen on in k8s mode
    #[arg(long, value_name = "PORT")]
    k8s_port: Option<u16>,

    /// Label selector for engine pods in k8s mode
    #[arg(long, value_name = "SELECTOR")]
    k8s_label_selector: Option<String>,

    /// Routing strategy (roundrobin, least_load, disaggregated)
    #[arg(long, value_name = "STRATEGY")]
    routing_logic: Option<StrategyKind>,

    /// Request attribute used for session affinity
    #[arg(long, value_name = "KEY")]
    session_key: Option<String>,

    /// Load at which a session owner is skipped
    #[arg(long, value_name = "LOAD")]
    kv_aware_threshold: Option<f64>,

    /// Engine stats scrape interval in seconds
    #[arg(long, value_name = "SECS")]
    engine_stats_interval: Option<u64>,

    /// Engine stats request timeout in milliseconds (defaults to half the
    /// interval when the interval is short)
    #[arg(long, value_name = "MS")]
    engine_stats_timeout_ms: Option<u64>,

    /// Request stats window in seconds
    #[arg(long, value_name = "SECS")]
    request_stats_window: Option<u64>,

    /// JSON routing policy file polled for changes
    #[arg(long, value_name = "FILE")]
    dynamic_config: Option<PathBuf>,

    /// Stats log interval in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    log_stats_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ROUTER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// CLI flags as configuration overrides
    fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();

        if let Some(mode) = self.discovery {
            overrides = overrides.with_discovery_mode(mode);
        }
        if let Some(ref urls) = self.static_backends {
            let models = self.static_models.as_deref().unwrap_or_default();
            let backends = parse_static_backends(urls, models, self.static_roles.as_deref())
                .context("Invalid --static-backends/--static-models/--static-roles")?;
            overrides = overrides.with_static_backends(backends);
        }
        if self.static_health_checks {
            overrides = overrides.with_health_checks(true);
        }
        if let Some(ref namespace) = self.k8s_namespace {
            overrides = overrides.with_namespace(namespace.clone());
        }
        if let Some(port) = self.k8s_port {
            overrides = overrides.with_port(port);
        }
        if let Some(ref selector) = self.k8s_label_selector {
            overrides = overrides.with_label_selector(selector.clone());
        }
        if let Some(strategy) = self.routing_logic {
            overrides = overrides.with_strategy(strategy);
        }
        if let Some(ref key) = self.session_key {
            overrides = overrides.with_session_key(key.clone());
        }
        if let Some(threshold) = self.kv_aware_threshold {
            overrides = overrides.with_kv_aware_threshold(threshold);
        }
        if let Some(secs) = self.engine_stats_interval {
            overrides = overrides.with_engine_stats_interval_secs(secs);
        }
        if let Some(ms) = self.engine_stats_timeout_ms {
            overrides = overrides.with_engine_stats_timeout_ms(ms);
        }
        if let Some(secs) = self.request_stats_window {
            overrides = overrides.with_request_stats_window_secs(secs);
        }
        if let Some(ref path) = self.dynamic_config {
            overrides = overrides.with_dynamic_config_path(path.clone());
        }
        if let Some(secs) = self.log_stats_interval {
            overrides = overrides.with_log_stats_interval_secs(secs);
        }

        Ok(overrides)
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("router_core={level},router_daemon={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

/// File, then environment, then CLI
fn load_config(args: &Args) -> Result<RouterConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides()?.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Block until SIGTERM/SIGINT, re-polling the dynamic config on SIGHUP
async fn wait_for_shutdown(router: &Router) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                return Ok(());
            }
            _ = sighup.recv() => match router.poll_dynamic_config().await {
                Some(PollOutcome::Applied(revision)) => {
                    info!(revision, "Received SIGHUP, routing policy reloaded");
                }
                Some(outcome) => info!(?outcome, "Received SIGHUP, routing policy unchanged"),
                None => warn!("Received SIGHUP but no dynamic config file is configured"),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("Router daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = load_config(&args)?;
    if let Some(ref path) = config.config_file_path {
        info!(config_path = ?path, "Config file");
    }
    info!(source = %config.source(), "Configuration loaded");

    let router = Router::new(config).context("Failed to build router")?;
    router.start().await.context("Failed to start router")?;

    let result = wait_for_shutdown(&router).await;

    info!("Shutting down...");
    router.close().await;

    match result {
        Ok(()) => {
            info!("Router daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
