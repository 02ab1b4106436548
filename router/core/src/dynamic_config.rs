//! Dynamic Config Watcher
//!
//! Polls a JSON policy file and swaps the routing policy when its content
//! changes. A document that fails to parse or validate leaves the current
//! policy in place and is reported once; the same bad content is not
//! re-reported on later polls.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::lifecycle::{LifecycleError, WorkerHandle};
use crate::routing::{PolicyHandle, RouterMetrics, RoutingPolicy};

/// Watcher settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicConfigSettings {
    pub path: PathBuf,
    pub poll_interval: Duration,
}

impl DynamicConfigSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("dynamic config poll interval must be positive".into());
        }
        if self.path.as_os_str().is_empty() {
            return Err("dynamic config path must not be empty".into());
        }
        Ok(())
    }
}

/// Result of one poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Content identical to the last poll, or equal to the active policy
    Unchanged,
    /// New policy installed under this revision
    Applied(u64),
    /// New content failed to parse or validate
    Rejected,
    /// File does not exist
    Missing,
}

#[derive(Debug, PartialEq, Eq)]
enum LastSeen {
    Nothing,
    Missing,
    ReadError(String),
    Content(String),
}

#[derive(Clone)]
struct Poller {
    settings: DynamicConfigSettings,
    policy: Arc<PolicyHandle>,
    metrics: Arc<RouterMetrics>,
    last_seen: Arc<Mutex<LastSeen>>,
}

impl Poller {
    async fn poll(&self) -> PollOutcome {
        let path = &self.settings.path;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut last = self.last_seen.lock();
                if *last != LastSeen::Missing {
                    tracing::warn!(path = %path.display(), "Dynamic config file not found, keeping current policy");
                    *last = LastSeen::Missing;
                }
                return PollOutcome::Missing;
            }
            Err(e) => {
                let message = e.to_string();
                let mut last = self.last_seen.lock();
                if *last != LastSeen::ReadError(message.clone()) {
                    tracing::warn!(path = %path.display(), error = %message, "Failed to read dynamic config");
                    *last = LastSeen::ReadError(message);
                }
                return PollOutcome::Rejected;
            }
        };

        {
            let mut last = self.last_seen.lock();
            if matches!(&*last, LastSeen::Content(seen) if *seen == content) {
                return PollOutcome::Unchanged;
            }
            *last = LastSeen::Content(content.clone());
        }

        let policy = match RoutingPolicy::from_json(&content) {
            Ok(policy) => policy,
            Err(e) => {
                self.metrics.policy_rejections.inc();
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    revision = self.policy.revision(),
                    "Rejected dynamic config, keeping current policy"
                );
                return PollOutcome::Rejected;
            }
        };

        if self.policy.load().policy == policy {
            tracing::debug!(path = %path.display(), "Dynamic config matches active policy");
            return PollOutcome::Unchanged;
        }

        let revision = self.policy.install(policy);
        self.metrics.policy_reloads.inc();
        PollOutcome::Applied(revision)
    }
}

/// Background poller that installs routing policies from a file
pub struct DynamicConfigWatcher {
    poller: Poller,
    worker: WorkerHandle,
}

impl DynamicConfigWatcher {
    pub fn new(
        settings: DynamicConfigSettings,
        policy: Arc<PolicyHandle>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            poller: Poller {
                settings,
                policy,
                metrics,
                last_seen: Arc::new(Mutex::new(LastSeen::Nothing)),
            },
            worker: WorkerHandle::new("dynamic-config-watcher"),
        }
    }

    pub fn settings(&self) -> &DynamicConfigSettings {
        &self.poller.settings
    }

    /// Start polling. The first poll runs immediately.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let poller = self.poller.clone();
        tracing::info!(
            path = %poller.settings.path.display(),
            interval_secs = poller.settings.poll_interval.as_secs_f64(),
            "Starting dynamic config watcher"
        );

        self.worker.start(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(poller.settings.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        poller.poll().await;
                    }
                }
            }
        })
    }

    /// Poll once now, independent of the background loop
    pub async fn poll_once(&self) -> PollOutcome {
        self.poller.poll().await
    }

    /// Stop polling. The active policy stays as it is.
    pub async fn close(&self) {
        self.worker.close().await;
    }
}
