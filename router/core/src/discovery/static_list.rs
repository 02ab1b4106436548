//! Static backend list with optional liveness probing

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::lifecycle::{LifecycleError, WorkerHandle};
use crate::probe::BackendProbe;
use crate::registry::{BackendEndpoint, BackendRegistry, EndpointId};

// ============================================================================
// Configuration
// ============================================================================

/// One statically configured backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBackendConfig {
    pub url: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl StaticBackendConfig {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            models: vec![model.into()],
            aliases: Vec::new(),
            role: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn to_endpoint(&self) -> BackendEndpoint {
        let mut endpoint = BackendEndpoint::new(&self.url).with_models(self.models.iter().cloned());
        endpoint.aliases.extend(self.aliases.iter().cloned());
        endpoint.role = self.role.clone();
        endpoint.labels = self.labels.clone();
        endpoint
    }
}

/// Liveness probing for static backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Must be strictly shorter than `interval`
    pub timeout: Duration,
    /// Consecutive failures before a backend is marked unreachable
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("health check interval must be positive".into());
        }
        if self.timeout >= self.interval {
            return Err(format!(
                "health check timeout ({:?}) must be shorter than its interval ({:?})",
                self.timeout, self.interval
            ));
        }
        if self.failure_threshold == 0 {
            return Err("health check failure threshold must be at least 1".into());
        }
        Ok(())
    }
}

/// Static discovery settings
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StaticDiscoveryConfig {
    pub backends: Vec<StaticBackendConfig>,
    pub health: HealthCheckConfig,
}

// ============================================================================
// Failure Tracking
// ============================================================================

/// Consecutive-failure bookkeeping for liveness
///
/// `threshold` failures in a row mark a backend unreachable; a single
/// success reinstates it.
#[derive(Debug)]
pub struct FailureTracker {
    threshold: u32,
    failures: HashMap<EndpointId, u32>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: HashMap::new(),
        }
    }

    /// Record a probe result and return the liveness it implies
    pub fn record(&mut self, id: &EndpointId, success: bool) -> bool {
        if success {
            self.failures.remove(id);
            return true;
        }
        let count = self.failures.entry(id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count < self.threshold
    }

    pub fn consecutive_failures(&self, id: &EndpointId) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    /// Forget backends that are no longer registered
    pub fn retain(&mut self, keep: impl Fn(&EndpointId) -> bool) {
        self.failures.retain(|id, _| keep(id));
    }
}

// ============================================================================
// Static Discovery
// ============================================================================

/// Fixed backend list, optionally re-validated by health probes
pub struct StaticDiscovery {
    config: StaticDiscoveryConfig,
    registry: Arc<BackendRegistry>,
    probe: Arc<dyn BackendProbe>,
    worker: WorkerHandle,
}

impl StaticDiscovery {
    pub fn new(
        config: StaticDiscoveryConfig,
        registry: Arc<BackendRegistry>,
        probe: Arc<dyn BackendProbe>,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            worker: WorkerHandle::new("static-liveness"),
        }
    }

    /// Seed the registry and start liveness probing if enabled
    pub fn start(&self) -> Result<(), LifecycleError> {
        for backend in &self.config.backends {
            let endpoint = backend.to_endpoint();
            // Keep liveness learned before a restart
            let live = self.registry.get(&endpoint.id).map_or(true, |e| e.live);
            self.registry.upsert(BackendEndpoint { live, ..endpoint });
        }
        tracing::info!(
            backends = self.config.backends.len(),
            health_checks = self.config.health.enabled,
            "Static discovery started"
        );

        if !self.config.health.enabled {
            return Ok(());
        }

        let health = self.config.health.clone();
        let registry = Arc::clone(&self.registry);
        let probe = Arc::clone(&self.probe);
        self.worker.start(move |mut shutdown| async move {
            let mut tracker = FailureTracker::new(health.failure_threshold);
            let mut ticker = tokio::time::interval(health.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        probe_cycle(&registry, probe.as_ref(), &mut tracker, health.timeout).await;
                    }
                }
            }
        })
    }

    /// Run one liveness cycle immediately
    pub async fn probe_once(&self, tracker: &mut FailureTracker) {
        probe_cycle(&self.registry, self.probe.as_ref(), tracker, self.config.health.timeout).await;
    }

    pub async fn close(&self) {
        self.worker.close().await;
    }
}

async fn probe_cycle(
    registry: &BackendRegistry,
    probe: &dyn BackendProbe,
    tracker: &mut FailureTracker,
    timeout: Duration,
) {
    let snapshot = registry.snapshot();
    let checks = snapshot.iter().map(|endpoint| async move {
        let result = tokio::time::timeout(timeout, probe.health_check(&endpoint.id, timeout)).await;
        let ok = match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(backend = %endpoint.id, error = %e, "Health check failed");
                false
            }
            Err(_) => {
                tracing::debug!(backend = %endpoint.id, "Health check timed out");
                false
            }
        };
        (endpoint.id.clone(), ok)
    });

    for (id, ok) in join_all(checks).await {
        let live = tracker.record(&id, ok);
        if registry.set_liveness(&id, live) {
            if live {
                tracing::info!(backend = %id, "Backend reachable again");
            } else {
                tracing::warn!(
                    backend = %id,
                    failures = tracker.consecutive_failures(&id),
                    "Backend marked unreachable"
                );
            }
        }
    }

    tracker.retain(|id| snapshot.contains(id));
}
