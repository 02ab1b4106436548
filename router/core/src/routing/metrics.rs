//! Router Metrics
//!
//! Observability for the control plane including:
//! - Routing decisions by reason and strategy
//! - Decision latency
//! - Requests with no eligible backend
//! - Policy reloads and rejections
//! - Engine stats scrape failures
//! - Registry size
//!
//! Everything is pull-based; [`RouterMetrics::to_prometheus`] renders the
//! current values in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::engine::RoutingReason;
use super::policy::StrategyKind;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket boundaries (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Total count
    total_count: AtomicU64,
    /// Sum of all values, as `f64` bits so sub-unit values still add up
    sum: AtomicU64,
    /// Minimum value seen (`f64` bits)
    min: AtomicU64,
    /// Maximum value seen (`f64` bits)
    max: AtomicU64,
}

/// Apply `f` to an `f64` stored as bits in an `AtomicU64`
fn update_f64(cell: &AtomicU64, f: impl Fn(f64) -> f64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some(f(f64::from_bits(bits)).to_bits())
    });
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0.0f64.to_bits()),
            min: AtomicU64::new(f64::INFINITY.to_bits()),
            max: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    /// Buckets for routing decisions (in microseconds)
    pub fn decision_default() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        update_f64(&self.sum, |sum| sum + value);

        // Min/max are updated independently; good enough for metrics
        update_f64(&self.min, |min| min.min(value));
        update_f64(&self.max, |max| max.max(value));
    }

    /// Get histogram snapshot
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = f64::from_bits(self.sum.load(Ordering::Relaxed));
        let min = f64::from_bits(self.min.load(Ordering::Relaxed));
        let max = f64::from_bits(self.max.load(Ordering::Relaxed));

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min.is_finite() { min } else { 0.0 },
            max,
            mean: if total > 0 {
                sum / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Get percentile value (upper bound of the bucket holding it)
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Gauge
// ============================================================================

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Centralized metrics for the control plane
#[derive(Debug)]
pub struct RouterMetrics {
    /// Successful selections
    pub selections: Counter,
    /// Selections decided by session affinity
    pub affinity_hits: Counter,
    /// Session owners skipped for being over the load threshold
    pub affinity_overflows: Counter,
    /// Strategy selections, one counter per strategy
    pub round_robin: Counter,
    pub least_load: Counter,
    pub disaggregated: Counter,
    /// Requests with no eligible backend
    pub no_eligible: Counter,

    /// Routing decision time in microseconds
    pub decision_time: Histogram,

    /// Dynamic policy installs and rejections
    pub policy_reloads: Counter,
    pub policy_rejections: Counter,

    /// Engine stats scrapes that failed or timed out
    pub scrape_failures: Counter,

    /// Registry size, refreshed on render
    pub backends_registered: Gauge,
    pub backends_live: Gauge,

    started_at: Instant,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            selections: Counter::new(),
            affinity_hits: Counter::new(),
            affinity_overflows: Counter::new(),
            round_robin: Counter::new(),
            least_load: Counter::new(),
            disaggregated: Counter::new(),
            no_eligible: Counter::new(),
            decision_time: Histogram::decision_default(),
            policy_reloads: Counter::new(),
            policy_rejections: Counter::new(),
            scrape_failures: Counter::new(),
            backends_registered: Gauge::new(),
            backends_live: Gauge::new(),
            started_at: Instant::now(),
        }
    }

    fn strategy_counter(&self, kind: StrategyKind) -> &Counter {
        match kind {
            StrategyKind::RoundRobin => &self.round_robin,
            StrategyKind::LeastLoad => &self.least_load,
            StrategyKind::Disaggregated => &self.disaggregated,
        }
    }

    /// Record a successful selection
    pub fn record_decision(&self, reason: RoutingReason, elapsed: Duration) {
        self.selections.inc();
        match reason {
            RoutingReason::SessionAffinity => self.affinity_hits.inc(),
            RoutingReason::Strategy(kind) => self.strategy_counter(kind).inc(),
            RoutingReason::AffinityOverflow(kind) => {
                self.affinity_overflows.inc();
                self.strategy_counter(kind).inc();
            }
        }
        self.decision_time.record(elapsed.as_secs_f64() * 1_000_000.0);
    }

    pub fn record_no_eligible(&self) {
        self.no_eligible.inc();
    }

    pub fn update_backends(&self, registered: usize, live: usize) {
        self.backends_registered.set(registered as u64);
        self.backends_live.set(live as u64);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Export as Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "# HELP router_selections_total Routing decisions that chose a backend\n\
             # TYPE router_selections_total counter\n\
             router_selections_total {}\n\n",
            self.selections.get()
        ));

        output.push_str(&format!(
            "# HELP router_selections_by_reason_total Routing decisions by reason\n\
             # TYPE router_selections_by_reason_total counter\n\
             router_selections_by_reason_total{{reason=\"session_affinity\"}} {}\n\
             router_selections_by_reason_total{{reason=\"round_robin\"}} {}\n\
             router_selections_by_reason_total{{reason=\"least_load\"}} {}\n\
             router_selections_by_reason_total{{reason=\"disaggregated\"}} {}\n\n",
            self.affinity_hits.get(),
            self.round_robin.get(),
            self.least_load.get(),
            self.disaggregated.get()
        ));

        output.push_str(&format!(
            "# HELP router_affinity_overflows_total Session owners skipped for load\n\
             # TYPE router_affinity_overflows_total counter\n\
             router_affinity_overflows_total {}\n\n",
            self.affinity_overflows.get()
        ));

        output.push_str(&format!(
            "# HELP router_no_eligible_backend_total Requests with no eligible backend\n\
             # TYPE router_no_eligible_backend_total counter\n\
             router_no_eligible_backend_total {}\n\n",
            self.no_eligible.get()
        ));

        let decision = self.decision_time.snapshot();
        output.push_str(&format!(
            "# HELP router_decision_time_us Routing decision latency in microseconds\n\
             # TYPE router_decision_time_us summary\n\
             router_decision_time_us{{quantile=\"0.5\"}} {}\n\
             router_decision_time_us{{quantile=\"0.99\"}} {}\n\
             router_decision_time_us_sum {}\n\
             router_decision_time_us_count {}\n\n",
            decision.p50(),
            decision.p99(),
            decision.sum,
            decision.total
        ));

        output.push_str(&format!(
            "# HELP router_policy_reloads_total Routing policies installed at runtime\n\
             # TYPE router_policy_reloads_total counter\n\
             router_policy_reloads_total {}\n\n\
             # HELP router_policy_rejections_total Rejected dynamic policy documents\n\
             # TYPE router_policy_rejections_total counter\n\
             router_policy_rejections_total {}\n\n",
            self.policy_reloads.get(),
            self.policy_rejections.get()
        ));

        output.push_str(&format!(
            "# HELP router_scrape_failures_total Failed engine stats scrapes\n\
             # TYPE router_scrape_failures_total counter\n\
             router_scrape_failures_total {}\n\n",
            self.scrape_failures.get()
        ));

        output.push_str(&format!(
            "# HELP router_backends Backends in the registry\n\
             # TYPE router_backends gauge\n\
             router_backends{{state=\"registered\"}} {}\n\
             router_backends{{state=\"live\"}} {}\n\n",
            self.backends_registered.get(),
            self.backends_live.get()
        ));

        output.push_str(&format!(
            "# HELP router_uptime_seconds Time since the router started\n\
             # TYPE router_uptime_seconds gauge\n\
             router_uptime_seconds {}\n",
            self.uptime().as_secs()
        ));

        output
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}
