//! Request Stats Monitor
//!
//! Rolling per-(backend, model) windows of completed requests. Each key has
//! its own mutex, so recording against one key never contends with another,
//! and a record followed by a read of the same key always sees the record.
//! Eviction is lazy: old samples are dropped when the window is touched.
//! Windows that have emptied out, or whose backend left, are dropped by
//! [`RequestStatsMonitor::prune`], which the engine stats scraper runs once
//! per cycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::registry::EndpointId;

/// Monitor settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestStatsConfig {
    /// Window length
    pub window: Duration,
    /// Hard cap on samples kept per key
    pub max_samples: usize,
}

impl Default for RequestStatsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_samples: 10_000,
        }
    }
}

impl RequestStatsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.window.is_zero() {
            return Err("request stats window must be positive".into());
        }
        if self.max_samples == 0 {
            return Err("request stats sample cap must be at least 1".into());
        }
        Ok(())
    }
}

/// Aggregates over a window
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RequestStats {
    pub count: usize,
    pub errors: usize,
    pub mean_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Requests per second over the window
    pub rate: f64,
}

impl RequestStats {
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.errors as f64 / self.count as f64
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    latency: Duration,
    success: bool,
}

/// Time-ordered samples for one key
#[derive(Debug)]
pub struct RequestStatWindow {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
}

impl RequestStatWindow {
    pub fn new(config: &RequestStatsConfig) -> Self {
        Self {
            samples: VecDeque::new(),
            window: config.window,
            max_samples: config.max_samples.max(1),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, sample: Sample, now: Instant) {
        // Completions can be reported slightly out of order
        match self.samples.back() {
            Some(last) if sample.at < last.at => {
                let pos = self.samples.partition_point(|s| s.at <= sample.at);
                self.samples.insert(pos, sample);
            }
            _ => self.samples.push_back(sample),
        }
        self.evict(now);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn aggregate(&mut self, now: Instant) -> RequestStats {
        self.evict(now);
        summarize(self.samples.iter(), self.window)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn summarize<'a>(samples: impl Iterator<Item = &'a Sample>, window: Duration) -> RequestStats {
    let mut stats = RequestStats::default();
    let mut total = Duration::ZERO;

    for sample in samples {
        if stats.count == 0 || sample.latency < stats.min_latency {
            stats.min_latency = sample.latency;
        }
        stats.max_latency = stats.max_latency.max(sample.latency);
        total += sample.latency;
        stats.count += 1;
        if !sample.success {
            stats.errors += 1;
        }
    }

    if stats.count > 0 {
        stats.mean_latency = total / stats.count as u32;
        stats.rate = stats.count as f64 / window.as_secs_f64();
    }
    stats
}

/// Key of one window
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatKey {
    pub backend: EndpointId,
    pub model: String,
}

/// Rolling request statistics per (backend, model)
#[derive(Debug, Default)]
pub struct RequestStatsMonitor {
    windows: DashMap<StatKey, Arc<Mutex<RequestStatWindow>>>,
    config: RequestStatsConfig,
}

impl RequestStatsMonitor {
    pub fn new(config: RequestStatsConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RequestStatsConfig {
        &self.config
    }

    /// Record a successful completion
    pub fn record(&self, backend: &EndpointId, model: &str, latency: Duration, timestamp: Instant) {
        self.record_outcome(backend, model, latency, timestamp, true);
    }

    /// Record a completion, flagging failures
    pub fn record_outcome(
        &self,
        backend: &EndpointId,
        model: &str,
        latency: Duration,
        timestamp: Instant,
        success: bool,
    ) {
        let key = StatKey {
            backend: backend.clone(),
            model: model.to_string(),
        };
        let sample = Sample {
            at: timestamp,
            latency,
            success,
        };

        // The map guard is held across the push so `prune` cannot drop the
        // window between lookup and insert
        if let Some(window) = self.windows.get(&key) {
            window.lock().push(sample, Instant::now());
            return;
        }
        let window = self
            .windows
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(RequestStatWindow::new(&self.config))));
        window.lock().push(sample, Instant::now());
    }

    /// Aggregates for one (backend, model)
    pub fn recent(&self, backend: &EndpointId, model: &str) -> RequestStats {
        let key = StatKey {
            backend: backend.clone(),
            model: model.to_string(),
        };
        let Some(window) = self.windows.get(&key).map(|w| Arc::clone(&w)) else {
            return RequestStats::default();
        };
        let stats = window.lock().aggregate(Instant::now());
        stats
    }

    fn merged(&self, filter: impl Fn(&StatKey) -> bool) -> RequestStats {
        let now = Instant::now();
        let windows: Vec<_> = self
            .windows
            .iter()
            .filter(|entry| filter(entry.key()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut samples = Vec::new();
        for window in windows {
            let mut window = window.lock();
            window.evict(now);
            samples.extend(window.samples.iter().copied());
        }
        summarize(samples.iter(), self.config.window)
    }

    /// Aggregates across every model on a backend
    pub fn recent_backend(&self, backend: &EndpointId) -> RequestStats {
        self.merged(|key| &key.backend == backend)
    }

    /// Aggregates across every backend serving a model
    pub fn recent_model(&self, model: &str) -> RequestStats {
        self.merged(|key| key.model == model)
    }

    /// Every non-empty window, ordered by key
    pub fn all(&self) -> Vec<(StatKey, RequestStats)> {
        let now = Instant::now();
        let windows: Vec<_> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut all: Vec<_> = windows
            .into_iter()
            .map(|(key, window)| {
                let stats = window.lock().aggregate(now);
                (key, stats)
            })
            .filter(|(_, stats)| stats.count > 0)
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop windows that have emptied out or whose backend is no longer
    /// kept. Returns the number of windows dropped.
    pub fn prune(&self, keep: impl Fn(&EndpointId) -> bool) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|key, window| {
            if !keep(&key.backend) {
                return false;
            }
            let mut window = window.lock();
            window.evict(now);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of allocated windows, empty ones included
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
