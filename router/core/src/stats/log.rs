//! Periodic stats summary in the log

use std::sync::Arc;
use std::time::Duration;

use super::engine::EngineStatsStore;
use super::request::RequestStatsMonitor;
use crate::lifecycle::{LifecycleError, WorkerHandle};
use crate::registry::{BackendRegistry, EndpointId};

/// Logs one line per backend on a fixed interval
pub struct StatsLogger {
    interval: Duration,
    registry: Arc<BackendRegistry>,
    engine_stats: Arc<EngineStatsStore>,
    request_stats: Arc<RequestStatsMonitor>,
    worker: WorkerHandle,
}

impl StatsLogger {
    pub fn new(
        interval: Duration,
        registry: Arc<BackendRegistry>,
        engine_stats: Arc<EngineStatsStore>,
        request_stats: Arc<RequestStatsMonitor>,
    ) -> Self {
        Self {
            interval,
            registry,
            engine_stats,
            request_stats,
            worker: WorkerHandle::new("stats-logger"),
        }
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        let interval = self.interval;
        let registry = Arc::clone(&self.registry);
        let engine_stats = Arc::clone(&self.engine_stats);
        let request_stats = Arc::clone(&self.request_stats);

        self.worker.start(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately and there is nothing to report yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        log_summary(&registry, &engine_stats, &request_stats);
                    }
                }
            }
        })
    }

    pub async fn close(&self) {
        self.worker.close().await;
    }
}

/// One backend's line in the summary
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSummary {
    pub backend: EndpointId,
    pub live: bool,
    pub load: Option<f64>,
    pub pending: Option<u64>,
    /// True when the engine snapshot is stale or was never scraped
    pub stale: bool,
    pub qps: f64,
    pub mean_latency: Duration,
    pub errors: usize,
}

/// Emit the summary once and return the per-backend rows
pub fn log_summary(
    registry: &BackendRegistry,
    engine_stats: &EngineStatsStore,
    request_stats: &RequestStatsMonitor,
) -> Vec<BackendSummary> {
    let snapshot = registry.snapshot();
    tracing::info!(
        backends = snapshot.len(),
        live = snapshot.live_count(),
        revision = snapshot.revision(),
        "Router stats"
    );

    let mut rows = Vec::with_capacity(snapshot.len());
    for endpoint in snapshot.iter() {
        let engine = engine_stats.status(&endpoint.id);
        let requests = request_stats.recent_backend(&endpoint.id);
        let row = BackendSummary {
            backend: endpoint.id.clone(),
            live: endpoint.live,
            load: engine.and_then(|s| s.snapshot).map(|s| s.load),
            pending: engine.and_then(|s| s.snapshot).map(|s| s.pending),
            stale: engine.map_or(true, |s| s.stale),
            qps: requests.rate,
            mean_latency: requests.mean_latency,
            errors: requests.errors,
        };

        tracing::info!(
            backend = %row.backend,
            role = endpoint.role.as_deref().unwrap_or("-"),
            live = row.live,
            load = ?row.load,
            pending = ?row.pending,
            stale = row.stale,
            qps = row.qps,
            mean_latency_ms = row.mean_latency.as_millis() as u64,
            errors = row.errors,
            "Backend stats"
        );
        rows.push(row);
    }
    rows
}
