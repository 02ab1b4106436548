//! Integration tests for the routing control plane
//!
//! These tests drive the public API end to end with an in-memory probe:
//! - Least-load selection from scraped engine stats
//! - Session affinity, overflow and idempotence
//! - Staleness after failed scrapes
//! - Liveness thresholds for static backends
//! - Policy swaps under concurrent selection
//! - Dynamic config file reloads
//! - Layered configuration feeding a router

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::{NamedTempFile, TempDir};

use router_core::config::{load_config_with_env, ConfigOverrides, DiscoveryMode};
use router_core::discovery::{FailureTracker, StaticBackendConfig, StaticDiscovery};
use router_core::dynamic_config::DynamicConfigSettings;
use router_core::stats::{EngineStatsScraper, ScraperConfig};
use router_core::{
    BackendEndpoint, BackendProbe, BackendRegistry, EndpointId, EngineLoad, EngineStatsStore,
    PolicyHandle, ProbeError, RequestStatsMonitor, Router, RouterConfig, RouterMetrics,
    RoutingDecisionContext, RoutingEngine, RoutingPolicy, RoutingReason, StrategyKind,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Probe answering from an in-memory table. Backends without an entry fail.
#[derive(Default)]
struct TableProbe {
    loads: Mutex<HashMap<EndpointId, f64>>,
    healthy: Mutex<HashMap<EndpointId, bool>>,
}

impl TableProbe {
    fn set_load(&self, url: &str, load: f64) {
        self.loads.lock().insert(EndpointId::new(url), load);
    }

    fn fail_scrape(&self, url: &str) {
        self.loads.lock().remove(&EndpointId::new(url));
    }

    fn set_healthy(&self, url: &str, healthy: bool) {
        self.healthy.lock().insert(EndpointId::new(url), healthy);
    }
}

#[async_trait]
impl BackendProbe for TableProbe {
    fn name(&self) -> &str {
        "table"
    }

    async fn health_check(&self, endpoint: &EndpointId, _: Duration) -> Result<(), ProbeError> {
        match self.healthy.lock().get(endpoint).copied().unwrap_or(true) {
            true => Ok(()),
            false => Err(ProbeError::Status {
                url: endpoint.join("health"),
                status: 503,
            }),
        }
    }

    async fn fetch_load(
        &self,
        endpoint: &EndpointId,
        _: Duration,
    ) -> Result<EngineLoad, ProbeError> {
        match self.loads.lock().get(endpoint) {
            Some(load) => Ok(EngineLoad {
                kv_cache_usage: *load,
                ..EngineLoad::default()
            }),
            None => Err(ProbeError::Transport {
                url: endpoint.join("metrics"),
                message: "connection refused".into(),
            }),
        }
    }

    async fn list_models(&self, _: &EndpointId, _: Duration) -> Result<Vec<String>, ProbeError> {
        Ok(vec!["m".into()])
    }
}

const B1: &str = "http://10.0.0.1:8000";
const B2: &str = "http://10.0.0.2:8000";

fn two_backend_config(policy: RoutingPolicy) -> RouterConfig {
    let mut config = RouterConfig::default();
    ConfigOverrides::new()
        .with_discovery_mode(DiscoveryMode::Static)
        .with_static_backends(vec![
            StaticBackendConfig::new(B1, "m"),
            StaticBackendConfig::new(B2, "m"),
        ])
        .apply(&mut config);
    config.policy = policy;
    config
}

async fn started_router(policy: RoutingPolicy, probe: Arc<TableProbe>) -> Router {
    let router = Router::with_probe(two_backend_config(policy), probe).unwrap();
    router.start().await.unwrap();
    router
}

/// Components wired by hand, for tests that drive the scraper directly
struct Parts {
    registry: Arc<BackendRegistry>,
    store: Arc<EngineStatsStore>,
    requests: Arc<RequestStatsMonitor>,
    scraper: EngineStatsScraper,
    policy: Arc<PolicyHandle>,
    engine: RoutingEngine,
}

fn parts(probe: Arc<TableProbe>, policy: RoutingPolicy, config: ScraperConfig) -> Parts {
    let registry = Arc::new(BackendRegistry::with_endpoints([
        BackendEndpoint::new(B1).with_model("m"),
        BackendEndpoint::new(B2).with_model("m"),
    ]));
    let store = Arc::new(EngineStatsStore::new(&config));
    let requests = Arc::new(RequestStatsMonitor::default());
    let scraper = EngineStatsScraper::new(config, Arc::clone(&registry), probe, Arc::clone(&store))
        .with_request_stats(Arc::clone(&requests));
    let policy = Arc::new(PolicyHandle::new(policy));
    let engine = RoutingEngine::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Arc::clone(&requests),
        Arc::clone(&policy),
        Arc::new(RouterMetrics::new()),
    );
    Parts {
        registry,
        store,
        requests,
        scraper,
        policy,
        engine,
    }
}

/// Replace a file in one step so a poller never reads half of it
fn write_atomic(path: &Path, content: &str) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

// =============================================================================
// Selection Scenarios
// =============================================================================

#[tokio::test]
async fn test_least_load_picks_lower_load() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.2);
    probe.set_load(B2, 0.9);

    let router = started_router(RoutingPolicy::new(StrategyKind::LeastLoad), probe).await;
    router.scrape_now().await;

    let decision = router.select(&RoutingDecisionContext::new("m")).unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new(B1));
    assert_eq!(decision.load, Some(0.2));
    router.close().await;
}

#[tokio::test]
async fn test_unknown_model_has_no_eligible_backend() {
    let probe = Arc::new(TableProbe::default());
    let router = started_router(RoutingPolicy::default(), probe).await;

    let err = router.select(&RoutingDecisionContext::new("x")).unwrap_err();
    assert_eq!(err.model, "x");

    let text = router.render_metrics();
    assert!(text.contains("router_no_eligible_backend_total 1"));
    assert!(text.contains("router_selections_total 0"));
    router.close().await;
}

#[tokio::test]
async fn test_affinity_owner_over_threshold_falls_through() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.3);
    probe.set_load(B2, 0.3);

    let policy = RoutingPolicy::new(StrategyKind::LeastLoad)
        .with_session_key("x-user-id")
        .with_threshold(0.8);
    let router = started_router(policy, Arc::clone(&probe)).await;
    router.scrape_now().await;

    let ctx = RoutingDecisionContext::new("m").with_session("s");
    let first = router.select(&ctx).unwrap();
    assert_eq!(first.reason, RoutingReason::SessionAffinity);
    let owner = first.endpoint.id.clone();
    let other = if owner == EndpointId::new(B1) { B2 } else { B1 };

    // Idempotent while nothing changes
    for _ in 0..10 {
        assert_eq!(router.select(&ctx).unwrap().endpoint.id, owner);
    }

    probe.set_load(owner.as_str(), 0.95);
    router.scrape_now().await;

    let decision = router.select(&ctx).unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new(other));
    assert_eq!(
        decision.reason,
        RoutingReason::AffinityOverflow(StrategyKind::LeastLoad)
    );
    assert_eq!(router.metrics().affinity_overflows.get(), 1);
    router.close().await;
}

#[tokio::test]
async fn test_every_backend_over_threshold_still_routes() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.97);
    probe.set_load(B2, 0.91);

    let policy = RoutingPolicy::new(StrategyKind::LeastLoad)
        .with_session_key("x-user-id")
        .with_threshold(0.8);
    let router = started_router(policy, probe).await;
    router.scrape_now().await;

    let decision = router
        .select(&RoutingDecisionContext::new("m").with_session("anyone"))
        .unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new(B2));
    router.close().await;
}

// =============================================================================
// Staleness
// =============================================================================

#[tokio::test]
async fn test_stale_backend_ranks_after_fresh_but_stays_selectable() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.6);
    probe.set_load(B2, 0.1);

    let config = ScraperConfig {
        staleness_threshold: 2,
        ..ScraperConfig::default()
    };
    let p = parts(
        Arc::clone(&probe),
        RoutingPolicy::new(StrategyKind::LeastLoad),
        config,
    );

    p.scraper.scrape_once().await;
    let ctx = RoutingDecisionContext::new("m");
    assert_eq!(p.engine.select(&ctx).unwrap().endpoint.id, EndpointId::new(B2));

    // Misses up to the threshold keep the last snapshot usable
    probe.fail_scrape(B2);
    p.scraper.scrape_once().await;
    p.scraper.scrape_once().await;
    assert!(p.store.fresh(&EndpointId::new(B2)).is_some());
    assert_eq!(p.engine.select(&ctx).unwrap().endpoint.id, EndpointId::new(B2));

    // Exceeding the threshold makes it stale
    let report = p.scraper.scrape_once().await;
    assert_eq!(report.failed, 1);
    assert!(p.store.fresh(&EndpointId::new(B2)).is_none());
    assert_eq!(p.engine.select(&ctx).unwrap().endpoint.id, EndpointId::new(B1));

    // Alone, the stale backend is still chosen
    p.registry.remove(&EndpointId::new(B1));
    let decision = p.engine.select(&ctx).unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new(B2));
    assert_eq!(decision.load, None);

    // One success restores it
    probe.set_load(B2, 0.1);
    p.scraper.scrape_once().await;
    assert!(p.store.fresh(&EndpointId::new(B2)).is_some());
}

#[tokio::test]
async fn test_removed_backend_stats_are_pruned() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.1);
    probe.set_load(B2, 0.1);
    let p = parts(probe, RoutingPolicy::default(), ScraperConfig::default());

    let now = Instant::now();
    p.requests.record(&EndpointId::new(B1), "m", Duration::from_millis(5), now);
    p.requests.record(&EndpointId::new(B2), "m", Duration::from_millis(5), now);
    if let Some(old) = now.checked_sub(Duration::from_secs(600)) {
        for i in 0..100 {
            p.requests.record(&EndpointId::new(B1), &format!("unknown-{}", i), Duration::ZERO, old);
        }
    }

    p.scraper.scrape_once().await;
    assert_eq!(p.store.len(), 2);
    // Idle windows are dropped each cycle
    assert_eq!(p.requests.window_count(), 2);

    p.registry.remove(&EndpointId::new(B2));
    p.scraper.scrape_once().await;
    assert_eq!(p.store.len(), 1);
    assert!(p.store.status(&EndpointId::new(B2)).is_none());
    assert_eq!(p.requests.window_count(), 1);
    assert_eq!(p.requests.recent(&EndpointId::new(B1), "m").count, 1);
}

// =============================================================================
// Liveness
// =============================================================================

#[tokio::test]
async fn test_static_liveness_threshold_and_reinstatement() {
    let probe = Arc::new(TableProbe::default());
    let registry = Arc::new(BackendRegistry::new());

    let mut config = two_backend_config(RoutingPolicy::default()).static_discovery;
    config.health.failure_threshold = 3;
    let discovery = StaticDiscovery::new(config, Arc::clone(&registry), probe.clone());
    discovery.start().unwrap();
    assert_eq!(registry.snapshot().live_count(), 2);

    let b2 = EndpointId::new(B2);
    let mut tracker = FailureTracker::new(3);
    probe.set_healthy(B2, false);

    for _ in 0..2 {
        discovery.probe_once(&mut tracker).await;
        assert!(registry.get(&b2).unwrap().live);
    }
    discovery.probe_once(&mut tracker).await;
    assert!(!registry.get(&b2).unwrap().live);
    assert_eq!(registry.len(), 2);

    probe.set_healthy(B2, true);
    discovery.probe_once(&mut tracker).await;
    assert!(registry.get(&b2).unwrap().live);

    discovery.close().await;
}

#[tokio::test]
async fn test_unreachable_backend_is_not_selected() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.9);
    probe.set_load(B2, 0.1);
    let router = started_router(RoutingPolicy::default(), probe).await;
    router.scrape_now().await;

    router.registry().set_liveness(&EndpointId::new(B2), false);
    let decision = router.select(&RoutingDecisionContext::new("m")).unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new(B1));
    router.close().await;
}

// =============================================================================
// Policy Swaps
// =============================================================================

#[tokio::test]
async fn test_threshold_swap_applies_to_later_selects() {
    let probe = Arc::new(TableProbe::default());
    probe.set_load(B1, 0.6);
    probe.set_load(B2, 0.6);

    let policy = RoutingPolicy::new(StrategyKind::LeastLoad)
        .with_session_key("x-user-id")
        .with_threshold(0.8);
    let router = started_router(policy.clone(), probe).await;
    router.scrape_now().await;

    let ctx = RoutingDecisionContext::new("m").with_session("s");
    let before = router.select(&ctx).unwrap();
    assert_eq!(before.reason, RoutingReason::SessionAffinity);
    assert_eq!(before.policy_revision, 1);

    router.install_policy(policy.with_threshold(0.5)).unwrap();

    let after = router.select(&ctx).unwrap();
    assert_eq!(
        after.reason,
        RoutingReason::AffinityOverflow(StrategyKind::LeastLoad)
    );
    assert_eq!(after.policy_revision, 2);
    router.close().await;
}

#[test]
fn test_concurrent_selects_see_one_policy() {
    let probe = Arc::new(TableProbe::default());
    let p = parts(
        probe,
        RoutingPolicy::new(StrategyKind::RoundRobin),
        ScraperConfig::default(),
    );
    let engine = &p.engine;
    let policy = &p.policy;

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(move || {
                let ctx = RoutingDecisionContext::new("m");
                for _ in 0..2_000 {
                    let decision = engine.select(&ctx).unwrap();
                    // Odd revisions are round-robin, even ones least-load
                    let expected = if decision.policy_revision % 2 == 1 {
                        StrategyKind::RoundRobin
                    } else {
                        StrategyKind::LeastLoad
                    };
                    assert_eq!(decision.reason, RoutingReason::Strategy(expected));
                }
            });
        }

        scope.spawn(move || {
            for i in 0..200 {
                let next = if i % 2 == 0 {
                    RoutingPolicy::new(StrategyKind::LeastLoad).with_threshold(0.5)
                } else {
                    RoutingPolicy::new(StrategyKind::RoundRobin).with_threshold(0.8)
                };
                policy.install(next);
            }
        });
    });

    assert_eq!(policy.revision(), 201);
}

#[tokio::test]
async fn test_dynamic_config_file_swaps_policy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("policy.json");

    let mut config = two_backend_config(RoutingPolicy::new(StrategyKind::LeastLoad));
    let mut settings = DynamicConfigSettings::new(&path);
    settings.poll_interval = Duration::from_millis(20);
    config.dynamic_config = Some(settings);

    let router = Router::with_probe(config, Arc::new(TableProbe::default())).unwrap();
    router.start().await.unwrap();
    assert_eq!(router.policy().revision(), 1);

    write_atomic(
        &path,
        r#"{"routing_logic": "roundrobin", "kv_aware_threshold": 0.5}"#,
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while router.policy().revision() == 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let active = router.policy().load();
    assert_eq!(active.revision, 2);
    assert_eq!(active.policy.strategy, StrategyKind::RoundRobin);
    assert_eq!(active.policy.kv_aware_threshold, 0.5);

    // An invalid document leaves the policy in place
    write_atomic(&path, r#"{"kv_aware_threshold": 3.0}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(router.policy().revision(), 2);
    assert_eq!(router.metrics().policy_rejections.get(), 1);

    router.close().await;
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_router_from_layered_config() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[discovery]
mode = "static"

[[discovery.backends]]
url = "http://10.0.0.1:8000/"
models = ["llama"]
aliases = ["default"]

[routing]
strategy = "least_load"
"#,
    )
    .unwrap();

    let env = |key: &str| match key {
        "ROUTER_ROUTING_LOGIC" => Some("roundrobin".to_string()),
        _ => None,
    };
    let mut config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();
    assert_eq!(config.policy.strategy, StrategyKind::RoundRobin);

    ConfigOverrides::new()
        .with_strategy(StrategyKind::Disaggregated)
        .apply(&mut config);

    let router = Router::with_probe(config, Arc::new(TableProbe::default())).unwrap();
    router.start().await.unwrap();

    let decision = router
        .select(&RoutingDecisionContext::new("default"))
        .unwrap();
    assert_eq!(decision.endpoint.id, EndpointId::new("http://10.0.0.1:8000"));
    assert_eq!(
        decision.reason,
        RoutingReason::Strategy(StrategyKind::Disaggregated)
    );
    router.close().await;
}

#[tokio::test]
async fn test_request_stats_flow_through_router() {
    let router = started_router(RoutingPolicy::default(), Arc::new(TableProbe::default())).await;
    let b1 = EndpointId::new(B1);

    router.record(&b1, "m", Duration::from_millis(120));
    router.record_outcome(&b1, "m", Duration::from_millis(80), false);

    let stats = router.request_stats().recent(&b1, "m");
    assert_eq!(stats.count, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.mean_latency, Duration::from_millis(100));
    router.close().await;
}
