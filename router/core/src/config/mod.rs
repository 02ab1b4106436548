//! TOML Configuration File Support
//!
//! Centralized configuration loading for the router, from a TOML file at
//! `~/.config/inference-router/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`ROUTER_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/inference-router/router.toml`
//!   (typically `~/.config/inference-router/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [discovery]
//! mode = "static"
//! health_checks = true
//! health_check_interval_secs = 10
//! health_check_timeout_secs = 3
//!
//! [[discovery.backends]]
//! url = "http://10.0.0.1:8000"
//! models = ["llama-3-8b"]
//! role = "prefill"
//!
//! [[discovery.backends]]
//! url = "http://10.0.0.2:8000"
//! models = ["llama-3-8b"]
//! aliases = ["default"]
//! role = "decode"
//!
//! [stats]
//! engine_stats_interval_secs = 30
//! engine_stats_timeout_ms = 5000
//! request_stats_window_secs = 60
//! log_interval_secs = 10
//!
//! [routing]
//! strategy = "disaggregated"
//! session_key = "x-user-id"
//! kv_aware_threshold = 0.8
//! prefill_labels = ["prefill"]
//! decode_labels = ["decode"]
//!
//! [dynamic_config]
//! path = "/etc/router/policy.json"
//! poll_interval_secs = 10
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::{
    ClusterDiscoveryConfig, DiscoveryConfig, StaticBackendConfig, StaticDiscoveryConfig,
};
use crate::dynamic_config::DynamicConfigSettings;
use crate::routing::{RoutingPolicy, StrategyKind};
use crate::stats::{RequestStatsConfig, ScraperConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Where backends come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    #[default]
    Static,
    Cluster,
}

impl FromStr for DiscoveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "cluster" | "k8s" | "kubernetes" => Ok(Self::Cluster),
            other => Err(ConfigError::ValidationError(format!(
                "unknown discovery mode '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Cluster subsection of `[discovery]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterToml {
    pub api_server: Option<String>,
    pub namespace: Option<String>,
    pub port: Option<u16>,
    pub label_selector: Option<String>,
    /// Pod label used as the backend role
    pub role_label: Option<String>,
    pub token_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
    pub insecure_skip_tls_verify: Option<bool>,
    pub request_timeout_secs: Option<u64>,
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_secs: Option<u64>,
}

/// Discovery section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryToml {
    /// "static" or "cluster"
    pub mode: Option<String>,

    /// Static backend list
    pub backends: Option<Vec<StaticBackendConfig>>,

    /// Whether static backends are liveness-probed
    pub health_checks: Option<bool>,
    pub health_check_interval_secs: Option<u64>,
    pub health_check_timeout_secs: Option<u64>,
    pub failure_threshold: Option<u32>,

    pub cluster: ClusterToml,
}

/// Stats section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsToml {
    pub engine_stats_interval_secs: Option<u64>,
    pub engine_stats_timeout_ms: Option<u64>,
    pub staleness_threshold: Option<u32>,
    pub request_stats_window_secs: Option<u64>,
    pub request_stats_max_samples: Option<usize>,
    /// 0 disables the periodic stats log
    pub log_interval_secs: Option<u64>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    pub strategy: Option<String>,
    pub session_key: Option<String>,
    pub kv_aware_threshold: Option<f64>,
    pub prefill_labels: Option<Vec<String>>,
    pub decode_labels: Option<Vec<String>>,
}

/// Dynamic config section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfigToml {
    pub path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    pub discovery: DiscoveryToml,
    pub stats: StatsToml,
    pub routing: RoutingToml,
    pub dynamic_config: DynamicConfigToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the router
///
/// Consolidates configuration from every source and tracks where the last
/// applied value came from. Use [`load_config`] to load with proper priority
/// handling, then [`ConfigOverrides::apply`] for CLI flags.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    pub discovery_mode: DiscoveryMode,

    /// Static list and its liveness probing
    pub static_discovery: StaticDiscoveryConfig,

    /// Cluster-watch settings
    pub cluster: ClusterDiscoveryConfig,

    /// Engine stats scraping
    pub scraper: ScraperConfig,

    /// Request stats windows
    pub request_stats: RequestStatsConfig,

    /// Initial routing policy
    pub policy: RoutingPolicy,

    /// Dynamic policy file, if any
    pub dynamic_config: Option<DynamicConfigSettings>,

    /// Periodic stats log interval; `None` disables it
    pub stats_log_interval: Option<Duration>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            discovery_mode: DiscoveryMode::Static,
            static_discovery: StaticDiscoveryConfig::default(),
            cluster: ClusterDiscoveryConfig::default(),
            scraper: ScraperConfig::default(),
            request_stats: RequestStatsConfig::default(),
            policy: RoutingPolicy::default(),
            dynamic_config: None,
            stats_log_interval: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RouterConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the default path and the environment
    pub fn load() -> Result<Self, ConfigError> {
        load_config()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// The discovery configuration for the selected mode
    pub fn discovery(&self) -> DiscoveryConfig {
        match self.discovery_mode {
            DiscoveryMode::Static => DiscoveryConfig::Static(self.static_discovery.clone()),
            DiscoveryMode::Cluster => DiscoveryConfig::Cluster(self.cluster.clone()),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = ConfigError::ValidationError;

        match self.discovery_mode {
            DiscoveryMode::Static => {
                if self.static_discovery.backends.is_empty() {
                    return Err(invalid("static discovery requires at least one backend".into()));
                }
                for backend in &self.static_discovery.backends {
                    if backend.url.trim().is_empty() {
                        return Err(invalid("static backend url must not be empty".into()));
                    }
                    if backend.models.is_empty() {
                        return Err(invalid(format!(
                            "static backend {} serves no models",
                            backend.url
                        )));
                    }
                }
                if self.static_discovery.health.enabled {
                    self.static_discovery.health.validate().map_err(invalid)?;
                }
            }
            DiscoveryMode::Cluster => self.cluster.validate().map_err(invalid)?,
        }

        self.scraper.validate().map_err(invalid)?;
        self.request_stats.validate().map_err(invalid)?;
        self.policy.validate().map_err(|e| invalid(e.to_string()))?;
        if let Some(dynamic) = &self.dynamic_config {
            dynamic.validate().map_err(invalid)?;
        }
        if self.stats_log_interval.is_some_and(|i| i.is_zero()) {
            return Err(invalid("stats log interval must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/inference-router/router.toml` or
/// `~/.config/inference-router/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("inference-router").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI arguments are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RouterConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RouterConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RouterConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = RouterConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RouterToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env)?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RouterConfig, toml: &RouterToml) -> Result<(), ConfigError> {
    // Discovery settings
    if let Some(ref mode) = toml.discovery.mode {
        config.discovery_mode = mode.parse()?;
    }
    if let Some(ref backends) = toml.discovery.backends {
        config.static_discovery.backends = backends.clone();
    }
    let health = &mut config.static_discovery.health;
    if let Some(enabled) = toml.discovery.health_checks {
        health.enabled = enabled;
    }
    if let Some(interval) = toml.discovery.health_check_interval_secs {
        health.interval = Duration::from_secs(interval);
    }
    if let Some(timeout) = toml.discovery.health_check_timeout_secs {
        health.timeout = Duration::from_secs(timeout);
    }
    if let Some(threshold) = toml.discovery.failure_threshold {
        health.failure_threshold = threshold;
    }

    let cluster_toml = &toml.discovery.cluster;
    let cluster = &mut config.cluster;
    if let Some(ref api) = cluster_toml.api_server {
        cluster.api_server = api.clone();
    }
    if let Some(ref namespace) = cluster_toml.namespace {
        cluster.namespace = namespace.clone();
    }
    if let Some(port) = cluster_toml.port {
        cluster.port = port;
    }
    if let Some(ref selector) = cluster_toml.label_selector {
        cluster.label_selector = selector.clone();
    }
    if cluster_toml.role_label.is_some() {
        cluster.role_label = cluster_toml.role_label.clone();
    }
    if cluster_toml.token_path.is_some() {
        cluster.token_path = cluster_toml.token_path.clone();
    }
    if cluster_toml.ca_cert_path.is_some() {
        cluster.ca_cert_path = cluster_toml.ca_cert_path.clone();
    }
    if let Some(insecure) = cluster_toml.insecure_skip_tls_verify {
        cluster.insecure_skip_tls_verify = insecure;
    }
    if let Some(timeout) = cluster_toml.request_timeout_secs {
        cluster.request_timeout = Duration::from_secs(timeout);
    }
    if let Some(initial) = cluster_toml.reconnect_initial_ms {
        cluster.backoff.initial = Duration::from_millis(initial);
    }
    if let Some(max) = cluster_toml.reconnect_max_secs {
        cluster.backoff.max = Duration::from_secs(max);
    }

    // Stats settings
    if let Some(interval) = toml.stats.engine_stats_interval_secs {
        config.scraper.set_interval(Duration::from_secs(interval));
    }
    if let Some(timeout) = toml.stats.engine_stats_timeout_ms {
        config.scraper.timeout = Duration::from_millis(timeout);
    }
    if let Some(threshold) = toml.stats.staleness_threshold {
        config.scraper.staleness_threshold = threshold;
    }
    if let Some(window) = toml.stats.request_stats_window_secs {
        config.request_stats.window = Duration::from_secs(window);
    }
    if let Some(max) = toml.stats.request_stats_max_samples {
        config.request_stats.max_samples = max;
    }
    if let Some(interval) = toml.stats.log_interval_secs {
        config.stats_log_interval = (interval > 0).then(|| Duration::from_secs(interval));
    }

    // Routing settings
    if let Some(ref strategy) = toml.routing.strategy {
        config.policy.strategy = strategy
            .parse()
            .map_err(|e: crate::routing::PolicyError| ConfigError::ValidationError(e.to_string()))?;
    }
    if toml.routing.session_key.is_some() {
        config.policy.session_key = toml.routing.session_key.clone();
    }
    if let Some(threshold) = toml.routing.kv_aware_threshold {
        config.policy.kv_aware_threshold = threshold;
    }
    if let Some(ref labels) = toml.routing.prefill_labels {
        config.policy.prefill_labels = labels.clone();
    }
    if let Some(ref labels) = toml.routing.decode_labels {
        config.policy.decode_labels = labels.clone();
    }

    // Dynamic config settings
    if let Some(ref path) = toml.dynamic_config.path {
        config.dynamic_config = Some(DynamicConfigSettings::new(path));
    }
    if let (Some(interval), Some(dynamic)) = (
        toml.dynamic_config.poll_interval_secs,
        config.dynamic_config.as_mut(),
    ) {
        dynamic.poll_interval = Duration::from_secs(interval);
    }

    Ok(())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "Ignoring unparsable environment variable");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RouterConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Discovery settings from environment
    if let Some(mode) = env("ROUTER_DISCOVERY") {
        config.discovery_mode = mode.parse()?;
        config.source = ConfigSource::Env;
    }
    if let Some(urls) = env("ROUTER_STATIC_BACKENDS") {
        let models = env("ROUTER_STATIC_MODELS").unwrap_or_default();
        let roles = env("ROUTER_STATIC_ROLES");
        config.static_discovery.backends = parse_static_backends(&urls, &models, roles.as_deref())?;
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = env("ROUTER_STATIC_HEALTH_CHECKS") {
        config.static_discovery.health.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Some(api) = env("ROUTER_K8S_API_SERVER") {
        config.cluster.api_server = api;
        config.source = ConfigSource::Env;
    }
    if let Some(namespace) = env("ROUTER_K8S_NAMESPACE") {
        config.cluster.namespace = namespace;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = env("ROUTER_K8S_PORT").and_then(|v| parse_env("ROUTER_K8S_PORT", &v)) {
        config.cluster.port = port;
        config.source = ConfigSource::Env;
    }
    if let Some(selector) = env("ROUTER_K8S_LABEL_SELECTOR") {
        config.cluster.label_selector = selector;
        config.source = ConfigSource::Env;
    }

    // Stats settings from environment
    if let Some(secs) = env("ROUTER_ENGINE_STATS_INTERVAL")
        .and_then(|v| parse_env::<u64>("ROUTER_ENGINE_STATS_INTERVAL", &v))
    {
        config.scraper.set_interval(Duration::from_secs(secs));
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env("ROUTER_ENGINE_STATS_TIMEOUT_MS")
        .and_then(|v| parse_env::<u64>("ROUTER_ENGINE_STATS_TIMEOUT_MS", &v))
    {
        config.scraper.timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("ROUTER_REQUEST_STATS_WINDOW")
        .and_then(|v| parse_env::<u64>("ROUTER_REQUEST_STATS_WINDOW", &v))
    {
        config.request_stats.window = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("ROUTER_LOG_STATS_INTERVAL")
        .and_then(|v| parse_env::<u64>("ROUTER_LOG_STATS_INTERVAL", &v))
    {
        config.stats_log_interval = (secs > 0).then(|| Duration::from_secs(secs));
        config.source = ConfigSource::Env;
    }

    // Routing settings from environment
    if let Some(strategy) = env("ROUTER_ROUTING_LOGIC")
        .and_then(|v| parse_env::<StrategyKind>("ROUTER_ROUTING_LOGIC", &v))
    {
        config.policy.strategy = strategy;
        config.source = ConfigSource::Env;
    }
    if let Some(key) = env("ROUTER_SESSION_KEY") {
        config.policy.session_key = Some(key);
        config.source = ConfigSource::Env;
    }
    if let Some(threshold) = env("ROUTER_KV_AWARE_THRESHOLD")
        .and_then(|v| parse_env::<f64>("ROUTER_KV_AWARE_THRESHOLD", &v))
    {
        config.policy.kv_aware_threshold = threshold;
        config.source = ConfigSource::Env;
    }

    // Dynamic config from environment
    if let Some(path) = env("ROUTER_DYNAMIC_CONFIG") {
        let interval = config.dynamic_config.as_ref().map(|d| d.poll_interval);
        let mut settings = DynamicConfigSettings::new(path);
        if let Some(interval) = interval {
            settings.poll_interval = interval;
        }
        config.dynamic_config = Some(settings);
        config.source = ConfigSource::Env;
    }

    Ok(())
}

/// Build a static backend list from comma-separated URLs, models (one per
/// URL) and optional roles (one per URL, empty for none)
pub fn parse_static_backends(
    urls: &str,
    models: &str,
    roles: Option<&str>,
) -> Result<Vec<StaticBackendConfig>, ConfigError> {
    let split = |s: &str| -> Vec<String> { s.split(',').map(|p| p.trim().to_string()).collect() };

    let urls: Vec<String> = split(urls).into_iter().filter(|u| !u.is_empty()).collect();
    let models = split(models);
    if urls.len() != models.len() || models.iter().any(String::is_empty) {
        return Err(ConfigError::ValidationError(format!(
            "static backends need one model per url ({} urls, {} models)",
            urls.len(),
            models.len()
        )));
    }

    let roles = match roles {
        Some(roles) => {
            let roles = split(roles);
            if roles.len() != urls.len() {
                return Err(ConfigError::ValidationError(format!(
                    "static roles need one entry per url ({} urls, {} roles)",
                    urls.len(),
                    roles.len()
                )));
            }
            roles
        }
        None => vec![String::new(); urls.len()],
    };

    Ok(urls
        .into_iter()
        .zip(models)
        .zip(roles)
        .map(|((url, model), role)| {
            let mut backend = StaticBackendConfig::new(url, model);
            backend.role = (!role.is_empty()).then_some(role);
            backend
        })
        .collect())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub discovery_mode: Option<DiscoveryMode>,
    pub static_backends: Option<Vec<StaticBackendConfig>>,
    pub health_checks: Option<bool>,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub port: Option<u16>,
    pub strategy: Option<StrategyKind>,
    pub session_key: Option<String>,
    pub kv_aware_threshold: Option<f64>,
    pub engine_stats_interval_secs: Option<u64>,
    pub engine_stats_timeout_ms: Option<u64>,
    pub request_stats_window_secs: Option<u64>,
    pub dynamic_config_path: Option<PathBuf>,
    pub log_stats_interval_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_discovery_mode(mut self, mode: DiscoveryMode) -> Self {
        self.discovery_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_static_backends(mut self, backends: Vec<StaticBackendConfig>) -> Self {
        self.static_backends = Some(backends);
        self
    }

    #[must_use]
    pub fn with_health_checks(mut self, enabled: bool) -> Self {
        self.health_checks = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: String) -> Self {
        self.namespace = Some(namespace);
        self
    }

    #[must_use]
    pub fn with_label_selector(mut self, selector: String) -> Self {
        self.label_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_session_key(mut self, key: String) -> Self {
        self.session_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_kv_aware_threshold(mut self, threshold: f64) -> Self {
        self.kv_aware_threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn with_engine_stats_interval_secs(mut self, secs: u64) -> Self {
        self.engine_stats_interval_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_engine_stats_timeout_ms(mut self, ms: u64) -> Self {
        self.engine_stats_timeout_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_request_stats_window_secs(mut self, secs: u64) -> Self {
        self.request_stats_window_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_dynamic_config_path(mut self, path: PathBuf) -> Self {
        self.dynamic_config_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_log_stats_interval_secs(mut self, secs: u64) -> Self {
        self.log_stats_interval_secs = Some(secs);
        self
    }

    fn is_empty(&self) -> bool {
        self.discovery_mode.is_none()
            && self.static_backends.is_none()
            && self.health_checks.is_none()
            && self.namespace.is_none()
            && self.label_selector.is_none()
            && self.port.is_none()
            && self.strategy.is_none()
            && self.session_key.is_none()
            && self.kv_aware_threshold.is_none()
            && self.engine_stats_interval_secs.is_none()
            && self.engine_stats_timeout_ms.is_none()
            && self.request_stats_window_secs.is_none()
            && self.dynamic_config_path.is_none()
            && self.log_stats_interval_secs.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RouterConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(mode) = self.discovery_mode {
            config.discovery_mode = mode;
        }
        if let Some(ref backends) = self.static_backends {
            config.static_discovery.backends = backends.clone();
        }
        if let Some(enabled) = self.health_checks {
            config.static_discovery.health.enabled = enabled;
        }
        if let Some(ref namespace) = self.namespace {
            config.cluster.namespace = namespace.clone();
        }
        if let Some(ref selector) = self.label_selector {
            config.cluster.label_selector = selector.clone();
        }
        if let Some(port) = self.port {
            config.cluster.port = port;
        }
        if let Some(strategy) = self.strategy {
            config.policy.strategy = strategy;
        }
        if let Some(ref key) = self.session_key {
            config.policy.session_key = Some(key.clone());
        }
        if let Some(threshold) = self.kv_aware_threshold {
            config.policy.kv_aware_threshold = threshold;
        }
        if let Some(secs) = self.engine_stats_interval_secs {
            config.scraper.set_interval(Duration::from_secs(secs));
        }
        if let Some(ms) = self.engine_stats_timeout_ms {
            config.scraper.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = self.request_stats_window_secs {
            config.request_stats.window = Duration::from_secs(secs);
        }
        if let Some(ref path) = self.dynamic_config_path {
            let interval = config.dynamic_config.as_ref().map(|d| d.poll_interval);
            let mut settings = DynamicConfigSettings::new(path);
            if let Some(interval) = interval {
                settings.poll_interval = interval;
            }
            config.dynamic_config = Some(settings);
        }
        if let Some(secs) = self.log_stats_interval_secs {
            config.stats_log_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
