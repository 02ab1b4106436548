//! Service Discovery
//!
//! Feeds the [`BackendRegistry`] from one of two sources:
//!
//! - [`StaticDiscovery`]: a fixed backend list from configuration, with
//!   optional periodic liveness probing
//! - [`ClusterDiscovery`]: a long-lived membership subscription (the
//!   Kubernetes pod watch in production) applied with last-event-wins
//!
//! Both own a background worker and expose `start`/`close`.
//!
//! [`BackendRegistry`]: crate::registry::BackendRegistry

mod cluster;
mod kubernetes;
mod static_list;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::LifecycleError;
use crate::probe::BackendProbe;
use crate::registry::{BackendEndpoint, BackendRegistry, EndpointId};

pub use cluster::{ClusterDiscovery, EventStream, MembershipFeed};
pub use kubernetes::{ClusterDiscoveryConfig, KubernetesPodFeed};
pub use static_list::{
    FailureTracker, HealthCheckConfig, StaticBackendConfig, StaticDiscovery, StaticDiscoveryConfig,
};

// ============================================================================
// Errors
// ============================================================================

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The very first subscription attempt failed
    #[error("initial membership subscription failed: {0}")]
    InitialSync(#[source] Box<DiscoveryError>),

    /// Request to the membership source failed
    #[error("membership request to {url} failed: {message}")]
    Http { url: String, message: String },

    /// The membership stream reported an error or broke
    #[error("membership stream error: {0}")]
    Stream(String),

    /// A membership payload could not be decoded
    #[error("failed to decode membership payload: {0}")]
    Decode(String),

    /// Discovery is misconfigured
    #[error("discovery configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

// ============================================================================
// Membership Events
// ============================================================================

/// A change in backend membership, already resolved to registry terms
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipEvent {
    /// Backend appeared or its metadata changed
    Upsert(BackendEndpoint),
    /// Backend left
    Remove(EndpointId),
    /// Authoritative full membership; anything not listed is gone
    Resync(Vec<BackendEndpoint>),
}

impl MembershipEvent {
    /// Apply the event to the registry
    pub fn apply(self, registry: &BackendRegistry) {
        match self {
            Self::Upsert(endpoint) => {
                let id = endpoint.id.clone();
                let change = registry.upsert(endpoint);
                tracing::debug!(backend = %id, ?change, "Membership upsert");
            }
            Self::Remove(id) => {
                if registry.remove(&id) {
                    tracing::info!(backend = %id, "Backend left");
                }
            }
            Self::Resync(endpoints) => {
                let count = endpoints.len();
                for stale in registry.replace_all(endpoints) {
                    tracing::info!(backend = %stale, "Backend missing from resync, removed");
                }
                tracing::debug!(count, "Membership resynced");
            }
        }
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Reconnect backoff for membership subscriptions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt N (0-indexed), capped at `max`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(attempt.min(63) as i32);
        let capped = base.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Discovery mode selected by configuration
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryConfig {
    Static(StaticDiscoveryConfig),
    Cluster(ClusterDiscoveryConfig),
}

impl DiscoveryConfig {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::Cluster(_) => "cluster",
        }
    }
}

/// The running discovery source
pub enum Discovery {
    Static(StaticDiscovery),
    Cluster(ClusterDiscovery),
}

impl Discovery {
    /// Build the discovery source for a configuration
    pub fn from_config(
        config: &DiscoveryConfig,
        registry: Arc<BackendRegistry>,
        probe: Arc<dyn BackendProbe>,
    ) -> Result<Self, DiscoveryError> {
        Ok(match config {
            DiscoveryConfig::Static(cfg) => {
                Self::Static(StaticDiscovery::new(cfg.clone(), registry, probe))
            }
            DiscoveryConfig::Cluster(cfg) => {
                let feed = KubernetesPodFeed::new(cfg.clone(), probe)?;
                Self::Cluster(ClusterDiscovery::new(
                    Arc::new(feed),
                    registry,
                    cfg.backoff.clone(),
                ))
            }
        })
    }

    pub async fn start(&self) -> Result<(), DiscoveryError> {
        match self {
            Self::Static(d) => Ok(d.start()?),
            Self::Cluster(d) => d.start().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Static(d) => d.close().await,
            Self::Cluster(d) => d.close().await,
        }
    }
}
