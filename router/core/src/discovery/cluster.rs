//! Cluster-watch discovery
//!
//! A [`MembershipFeed`] yields a stream of membership events. The first
//! subscription happens inside `start` and its failure is fatal. After that,
//! a broken stream is re-established with capped exponential backoff while
//! the registry keeps its last known-good contents.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{BackoffConfig, DiscoveryError, MembershipEvent};
use crate::lifecycle::{LifecycleError, ShutdownSignal, WorkerHandle};
use crate::registry::BackendRegistry;

/// Stream of membership events from one subscription
pub type EventStream = BoxStream<'static, Result<MembershipEvent, DiscoveryError>>;

/// Source of membership events
#[async_trait]
pub trait MembershipFeed: Send + Sync {
    /// Feed name for logs
    fn name(&self) -> &str;

    /// Open a new subscription. Implementations should start the stream
    /// with a [`MembershipEvent::Resync`] when they can list the full set.
    async fn subscribe(&self) -> Result<EventStream, DiscoveryError>;
}

/// Applies a membership feed to the registry
pub struct ClusterDiscovery {
    feed: Arc<dyn MembershipFeed>,
    registry: Arc<BackendRegistry>,
    backoff: BackoffConfig,
    worker: WorkerHandle,
}

impl ClusterDiscovery {
    pub fn new(
        feed: Arc<dyn MembershipFeed>,
        registry: Arc<BackendRegistry>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            feed,
            registry,
            backoff,
            worker: WorkerHandle::new("cluster-discovery"),
        }
    }

    /// Subscribe and start applying events. Fails if the first subscription
    /// cannot be established.
    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if self.worker.is_running() {
            return Err(LifecycleError::AlreadyRunning(self.worker.name()).into());
        }

        let stream = self
            .feed
            .subscribe()
            .await
            .map_err(|e| DiscoveryError::InitialSync(Box::new(e)))?;
        tracing::info!(feed = self.feed.name(), "Cluster discovery subscribed");

        let feed = Arc::clone(&self.feed);
        let registry = Arc::clone(&self.registry);
        let backoff = self.backoff.clone();
        self.worker.start(move |shutdown| {
            run_watch(feed, registry, backoff, stream, shutdown)
        })?;
        Ok(())
    }

    pub async fn close(&self) {
        self.worker.close().await;
    }
}

async fn run_watch(
    feed: Arc<dyn MembershipFeed>,
    registry: Arc<BackendRegistry>,
    backoff: BackoffConfig,
    mut stream: EventStream,
    mut shutdown: ShutdownSignal,
) {
    loop {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                next = stream.next() => match next {
                    Some(Ok(event)) => event.apply(&registry),
                    Some(Err(e)) => {
                        tracing::warn!(feed = feed.name(), error = %e, "Membership stream failed, reconnecting");
                        break;
                    }
                    None => {
                        tracing::warn!(feed = feed.name(), "Membership stream ended, reconnecting");
                        break;
                    }
                }
            }
        }

        let mut attempt = 0u32;
        stream = loop {
            let delay = backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = shutdown.wait() => return,
                result = feed.subscribe() => result,
            };
            match result {
                Ok(stream) => {
                    tracing::info!(feed = feed.name(), attempt, "Membership stream re-established");
                    break stream;
                }
                Err(e) => {
                    tracing::warn!(
                        feed = feed.name(),
                        attempt,
                        retry_in_ms = backoff.delay_for_attempt(attempt + 1).as_millis() as u64,
                        error = %e,
                        "Membership resubscribe failed"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        };
    }
}
