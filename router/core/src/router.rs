//! Router
//!
//! Owns every control-plane component and their lifecycles. Components are
//! wired around one shared [`BackendRegistry`], one [`PolicyHandle`] and one
//! set of [`RouterMetrics`].
//!
//! Start order is discovery first, so the initial membership is in place
//! before anything scrapes or routes. Close runs in reverse.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{ConfigError, RouterConfig};
use crate::discovery::{Discovery, DiscoveryError};
use crate::dynamic_config::{DynamicConfigWatcher, PollOutcome};
use crate::lifecycle::LifecycleError;
use crate::probe::{BackendProbe, HttpProbe, ProbeError};
use crate::registry::{BackendRegistry, EndpointId};
use crate::routing::{
    NoEligibleBackend, PolicyError, PolicyHandle, RouterMetrics, RoutingDecision,
    RoutingDecisionContext, RoutingEngine, RoutingPolicy,
};
use crate::stats::{EngineStatsScraper, EngineStatsStore, RequestStatsMonitor, StatsLogger};

/// Errors from building or starting the router
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Failed to build backend probe: {0}")]
    Probe(#[from] ProbeError),

    #[error("Router has been closed")]
    Closed,
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// The routing control plane
pub struct Router {
    config: RouterConfig,
    registry: Arc<BackendRegistry>,
    discovery: Discovery,
    scraper: EngineStatsScraper,
    engine_stats: Arc<EngineStatsStore>,
    request_stats: Arc<RequestStatsMonitor>,
    policy: Arc<PolicyHandle>,
    metrics: Arc<RouterMetrics>,
    engine: RoutingEngine,
    watcher: Option<DynamicConfigWatcher>,
    stats_logger: Option<StatsLogger>,
    state: AtomicU8,
}

impl Router {
    /// Build a router that probes backends over HTTP
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        let probe = HttpProbe::new()?;
        Self::with_probe(config, Arc::new(probe))
    }

    /// Build a router with a custom probe
    pub fn with_probe(
        config: RouterConfig,
        probe: Arc<dyn BackendProbe>,
    ) -> Result<Self, RouterError> {
        config.validate()?;

        let registry = Arc::new(BackendRegistry::new());
        let metrics = Arc::new(RouterMetrics::new());
        let policy = Arc::new(PolicyHandle::new(config.policy.clone()));

        let discovery =
            Discovery::from_config(&config.discovery(), Arc::clone(&registry), Arc::clone(&probe))?;

        let request_stats = Arc::new(RequestStatsMonitor::new(config.request_stats.clone()));

        let engine_stats = Arc::new(EngineStatsStore::new(&config.scraper));
        let scraper = EngineStatsScraper::new(
            config.scraper.clone(),
            Arc::clone(&registry),
            probe,
            Arc::clone(&engine_stats),
        )
        .with_metrics(Arc::clone(&metrics))
        .with_request_stats(Arc::clone(&request_stats));

        let engine = RoutingEngine::new(
            Arc::clone(&registry),
            Arc::clone(&engine_stats),
            Arc::clone(&request_stats),
            Arc::clone(&policy),
            Arc::clone(&metrics),
        );

        let watcher = config.dynamic_config.clone().map(|settings| {
            DynamicConfigWatcher::new(settings, Arc::clone(&policy), Arc::clone(&metrics))
        });

        let stats_logger = config.stats_log_interval.map(|interval| {
            StatsLogger::new(
                interval,
                Arc::clone(&registry),
                Arc::clone(&engine_stats),
                Arc::clone(&request_stats),
            )
        });

        Ok(Self {
            config,
            registry,
            discovery,
            scraper,
            engine_stats,
            request_stats,
            policy,
            metrics,
            engine,
            watcher,
            stats_logger,
            state: AtomicU8::new(CREATED),
        })
    }

    /// Start every background component
    ///
    /// Fails if the initial discovery cannot establish membership. Calling
    /// start on a running router is a no-op.
    pub async fn start(&self) -> Result<(), RouterError> {
        match self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(RouterError::Closed),
        }

        tracing::info!(
            discovery = self.config.discovery().mode(),
            strategy = %self.config.policy.strategy,
            config_source = %self.config.source(),
            "Starting router"
        );

        if let Err(e) = self.discovery.start().await {
            tracing::error!(error = %e, "Discovery failed to start");
            self.close().await;
            return Err(e.into());
        }
        self.scraper.start()?;
        if let Some(watcher) = &self.watcher {
            watcher.start()?;
        }
        if let Some(logger) = &self.stats_logger {
            logger.start()?;
        }

        let snapshot = self.registry.snapshot();
        tracing::info!(
            backends = snapshot.len(),
            live = snapshot.live_count(),
            "Router started"
        );
        Ok(())
    }

    /// Stop every background component. Safe to call more than once.
    pub async fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }

        tracing::info!("Shutting down router");
        if let Some(logger) = &self.stats_logger {
            logger.close().await;
        }
        if let Some(watcher) = &self.watcher {
            watcher.close().await;
        }
        self.scraper.close().await;
        self.discovery.close().await;
        tracing::info!("Router stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Choose a backend for a request
    pub fn select(&self, ctx: &RoutingDecisionContext) -> Result<RoutingDecision, NoEligibleBackend> {
        self.engine.select(ctx)
    }

    /// Record a successful completion against the request stats
    pub fn record(&self, backend: &EndpointId, model: &str, latency: Duration) {
        self.request_stats
            .record(backend, model, latency, Instant::now());
    }

    /// Record a completion, flagging failures
    pub fn record_outcome(&self, backend: &EndpointId, model: &str, latency: Duration, success: bool) {
        self.request_stats
            .record_outcome(backend, model, latency, Instant::now(), success);
    }

    /// Validate and install a routing policy, returning its revision
    pub fn install_policy(&self, policy: RoutingPolicy) -> Result<u64, PolicyError> {
        if let Err(e) = policy.validate() {
            self.metrics.policy_rejections.inc();
            return Err(e);
        }
        let revision = self.policy.install(policy);
        self.metrics.policy_reloads.inc();
        Ok(revision)
    }

    /// Poll the dynamic config file now, if one is configured
    pub async fn poll_dynamic_config(&self) -> Option<PollOutcome> {
        match &self.watcher {
            Some(watcher) => Some(watcher.poll_once().await),
            None => None,
        }
    }

    /// Run one engine stats scrape now
    pub async fn scrape_now(&self) {
        let report = self.scraper.scrape_once().await;
        tracing::debug!(
            succeeded = report.succeeded,
            failed = report.failed,
            "Manual engine stats scrape"
        );
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> String {
        let snapshot = self.registry.snapshot();
        self.metrics
            .update_backends(snapshot.len(), snapshot.live_count());
        self.metrics.to_prometheus()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn engine_stats(&self) -> &Arc<EngineStatsStore> {
        &self.engine_stats
    }

    pub fn request_stats(&self) -> &Arc<RequestStatsMonitor> {
        &self.request_stats
    }

    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, DiscoveryMode};
    use crate::discovery::StaticBackendConfig;
    use crate::probe::EngineLoad;
    use crate::routing::{RoutingReason, StrategyKind};
    use async_trait::async_trait;

    struct FixedProbe;

    #[async_trait]
    impl BackendProbe for FixedProbe {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn health_check(&self, _: &EndpointId, _: Duration) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn fetch_load(&self, endpoint: &EndpointId, _: Duration) -> Result<EngineLoad, ProbeError> {
            let kv = if endpoint.as_str().ends_with(":1") { 0.9 } else { 0.1 };
            Ok(EngineLoad {
                kv_cache_usage: kv,
                ..EngineLoad::default()
            })
        }

        async fn list_models(&self, _: &EndpointId, _: Duration) -> Result<Vec<String>, ProbeError> {
            Ok(vec!["m".into()])
        }
    }

    fn config() -> RouterConfig {
        let mut config = RouterConfig::default();
        ConfigOverrides::new()
            .with_discovery_mode(DiscoveryMode::Static)
            .with_static_backends(vec![
                StaticBackendConfig::new("http://b:1", "m"),
                StaticBackendConfig::new("http://b:2", "m"),
            ])
            .apply(&mut config);
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Router::with_probe(RouterConfig::default(), Arc::new(FixedProbe));
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_select_close() {
        let router = Router::with_probe(config(), Arc::new(FixedProbe)).unwrap();
        router.start().await.unwrap();
        router.start().await.unwrap();
        assert!(router.is_running());
        assert_eq!(router.registry().len(), 2);

        router.scrape_now().await;
        let decision = router.select(&RoutingDecisionContext::new("m")).unwrap();
        assert_eq!(decision.endpoint.id, EndpointId::new("http://b:2"));
        assert_eq!(decision.reason, RoutingReason::Strategy(StrategyKind::LeastLoad));

        router.close().await;
        router.close().await;
        assert!(!router.is_running());
        assert!(matches!(router.start().await, Err(RouterError::Closed)));
    }

    #[tokio::test]
    async fn test_install_policy_validates() {
        let router = Router::with_probe(config(), Arc::new(FixedProbe)).unwrap();
        assert!(router
            .install_policy(RoutingPolicy::default().with_threshold(2.0))
            .is_err());
        assert_eq!(router.policy().revision(), 1);

        let revision = router
            .install_policy(RoutingPolicy::new(StrategyKind::RoundRobin))
            .unwrap();
        assert_eq!(revision, 2);
        assert_eq!(router.metrics().policy_rejections.get(), 1);
        assert_eq!(router.metrics().policy_reloads.get(), 1);
    }

    #[tokio::test]
    async fn test_render_metrics_reports_backends() {
        let router = Router::with_probe(config(), Arc::new(FixedProbe)).unwrap();
        router.start().await.unwrap();
        let text = router.render_metrics();
        assert!(text.contains("router_backends{state=\"registered\"} 2"));
        router.close().await;
    }
}
