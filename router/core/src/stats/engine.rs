//! Engine Stats Scraper
//!
//! Polls every registered backend for engine-internal load on a fixed
//! interval and keeps the latest snapshot per backend. A failed scrape keeps
//! the previous snapshot and bumps a miss counter; once the counter exceeds
//! the staleness threshold the snapshot stops counting for load decisions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;

use crate::lifecycle::{LifecycleError, WorkerHandle};
use crate::probe::{BackendProbe, EngineLoad};
use crate::registry::{BackendRegistry, EndpointId};
use crate::routing::RouterMetrics;
use crate::stats::RequestStatsMonitor;

// ============================================================================
// Configuration
// ============================================================================

/// Scraper settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScraperConfig {
    pub interval: Duration,
    /// Per-backend request timeout, strictly shorter than `interval`
    pub timeout: Duration,
    /// Consecutive missed scrapes tolerated before a snapshot is stale
    pub staleness_threshold: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            staleness_threshold: 3,
        }
    }
}

impl ScraperConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("engine stats interval must be positive".into());
        }
        if self.timeout >= self.interval {
            return Err(format!(
                "engine stats timeout ({:?}) must be shorter than the interval ({:?})",
                self.timeout, self.interval
            ));
        }
        if self.staleness_threshold == 0 {
            return Err("staleness threshold must be at least 1".into());
        }
        Ok(())
    }

    /// Change the interval. A timeout that no longer fits is derived from
    /// the new interval: half of it, capped at the default timeout.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
        if self.timeout >= interval {
            self.timeout = (interval / 2).min(Self::default().timeout);
        }
    }

    /// Age past which a snapshot is stale even without recorded misses
    /// (e.g. after the scraper was stopped). One interval of slack past the
    /// miss cut so the counter decides while the scraper runs.
    fn max_age(&self) -> Duration {
        self.interval
            .saturating_mul(self.staleness_threshold.saturating_add(2))
    }
}

// ============================================================================
// Snapshot Store
// ============================================================================

/// Latest engine load of one backend
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineStatSnapshot {
    pub scraped_at: Instant,
    /// KV-cache occupancy in [0, 1]
    pub load: f64,
    /// Waiting requests
    pub pending: u64,
    pub running: u64,
    pub prefix_cache_hit_rate: Option<f64>,
}

impl EngineStatSnapshot {
    pub fn new(load: f64, pending: u64) -> Self {
        Self {
            scraped_at: Instant::now(),
            load,
            pending,
            running: 0,
            prefix_cache_hit_rate: None,
        }
    }

    pub fn from_load(load: EngineLoad, scraped_at: Instant) -> Self {
        Self {
            scraped_at,
            load: load.kv_cache_usage,
            pending: load.waiting_requests,
            running: load.running_requests,
            prefix_cache_hit_rate: load.prefix_cache_hit_rate,
        }
    }

    pub fn age(&self) -> Duration {
        self.scraped_at.elapsed()
    }
}

#[derive(Clone, Copy, Debug)]
struct StatEntry {
    snapshot: Option<EngineStatSnapshot>,
    misses: u32,
}

/// Observability view of one backend's stats
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineStatus {
    pub snapshot: Option<EngineStatSnapshot>,
    pub consecutive_misses: u32,
    pub stale: bool,
}

/// Per-backend engine snapshots, written by the scraper and read lock-free
/// per shard by the routing engine
#[derive(Debug)]
pub struct EngineStatsStore {
    entries: DashMap<EndpointId, StatEntry>,
    staleness_threshold: u32,
    max_age: Duration,
}

impl Default for EngineStatsStore {
    fn default() -> Self {
        Self::new(&ScraperConfig::default())
    }
}

impl EngineStatsStore {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            entries: DashMap::new(),
            staleness_threshold: config.staleness_threshold.max(1),
            max_age: config.max_age(),
        }
    }

    /// Replace the snapshot and reset the miss counter
    pub fn record_success(&self, id: &EndpointId, snapshot: EngineStatSnapshot) {
        self.entries.insert(
            id.clone(),
            StatEntry {
                snapshot: Some(snapshot),
                misses: 0,
            },
        );
    }

    /// Keep the previous snapshot and count a miss. Returns the miss count.
    pub fn record_miss(&self, id: &EndpointId) -> u32 {
        let mut entry = self.entries.entry(id.clone()).or_insert(StatEntry {
            snapshot: None,
            misses: 0,
        });
        entry.misses = entry.misses.saturating_add(1);
        entry.misses
    }

    fn is_stale(&self, entry: &StatEntry) -> bool {
        match entry.snapshot {
            None => true,
            Some(snapshot) => {
                entry.misses > self.staleness_threshold || snapshot.age() > self.max_age
            }
        }
    }

    /// Snapshot usable for load decisions, `None` if absent or stale
    pub fn fresh(&self, id: &EndpointId) -> Option<EngineStatSnapshot> {
        let entry = *self.entries.get(id)?;
        if self.is_stale(&entry) {
            None
        } else {
            entry.snapshot
        }
    }

    pub fn status(&self, id: &EndpointId) -> Option<EngineStatus> {
        let entry = *self.entries.get(id)?;
        Some(EngineStatus {
            snapshot: entry.snapshot,
            consecutive_misses: entry.misses,
            stale: self.is_stale(&entry),
        })
    }

    /// Every tracked backend, ordered by identity
    pub fn all(&self) -> Vec<(EndpointId, EngineStatus)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|entry| {
                let value = *entry.value();
                (
                    entry.key().clone(),
                    EngineStatus {
                        snapshot: value.snapshot,
                        consecutive_misses: value.misses,
                        stale: self.is_stale(&value),
                    },
                )
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop entries for backends no longer registered
    pub fn retain(&self, keep: impl Fn(&EndpointId) -> bool) {
        self.entries.retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Scraper
// ============================================================================

#[derive(Clone)]
struct ScrapeCycle {
    config: ScraperConfig,
    registry: Arc<BackendRegistry>,
    probe: Arc<dyn BackendProbe>,
    store: Arc<EngineStatsStore>,
    metrics: Option<Arc<RouterMetrics>>,
    request_stats: Option<Arc<RequestStatsMonitor>>,
}

impl ScrapeCycle {
    async fn run(&self) -> ScrapeReport {
        let snapshot = self.registry.snapshot();
        let timeout = self.config.timeout;
        let probe = self.probe.as_ref();

        let scrapes = snapshot.iter().map(|endpoint| async move {
            let result = tokio::time::timeout(timeout, probe.fetch_load(&endpoint.id, timeout)).await;
            (&endpoint.id, result)
        });

        let mut report = ScrapeReport::default();
        for (id, result) in join_all(scrapes).await {
            match result {
                Ok(Ok(load)) => {
                    self.store
                        .record_success(id, EngineStatSnapshot::from_load(load, Instant::now()));
                    report.succeeded += 1;
                }
                Ok(Err(e)) => {
                    let misses = self.store.record_miss(id);
                    tracing::debug!(backend = %id, misses, error = %e, "Engine stats scrape failed");
                    report.failed += 1;
                }
                Err(_) => {
                    let misses = self.store.record_miss(id);
                    tracing::debug!(backend = %id, misses, "Engine stats scrape timed out");
                    report.failed += 1;
                }
            }
        }

        self.store.retain(|id| snapshot.contains(id));
        if let Some(request_stats) = &self.request_stats {
            let dropped = request_stats.prune(|id| snapshot.contains(id));
            if dropped > 0 {
                tracing::debug!(dropped, "Pruned idle request stats windows");
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.scrape_failures.add(report.failed as u64);
        }
        report
    }
}

/// Outcome of one scrape cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Periodic engine stats poller
pub struct EngineStatsScraper {
    cycle: ScrapeCycle,
    worker: WorkerHandle,
}

impl EngineStatsScraper {
    pub fn new(
        config: ScraperConfig,
        registry: Arc<BackendRegistry>,
        probe: Arc<dyn BackendProbe>,
        store: Arc<EngineStatsStore>,
    ) -> Self {
        Self {
            cycle: ScrapeCycle {
                config,
                registry,
                probe,
                store,
                metrics: None,
                request_stats: None,
            },
            worker: WorkerHandle::new("engine-stats-scraper"),
        }
    }

    /// Count failed scrapes in the router metrics
    pub fn with_metrics(mut self, metrics: Arc<RouterMetrics>) -> Self {
        self.cycle.metrics = Some(metrics);
        self
    }

    /// Prune request stats windows once per cycle
    pub fn with_request_stats(mut self, request_stats: Arc<RequestStatsMonitor>) -> Self {
        self.cycle.request_stats = Some(request_stats);
        self
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        let cycle = self.cycle.clone();
        tracing::info!(
            interval_secs = cycle.config.interval.as_secs_f64(),
            timeout_secs = cycle.config.timeout.as_secs_f64(),
            "Starting engine stats scraper"
        );

        self.worker.start(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(cycle.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        let report = cycle.run().await;
                        if report.failed > 0 {
                            tracing::debug!(
                                succeeded = report.succeeded,
                                failed = report.failed,
                                "Engine stats cycle finished with failures"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Run one scrape cycle now
    pub async fn scrape_once(&self) -> ScrapeReport {
        self.cycle.run().await
    }

    pub fn store(&self) -> &Arc<EngineStatsStore> {
        &self.cycle.store
    }

    pub async fn close(&self) {
        self.worker.close().await;
    }
}
