//! Router Core - Control Plane for Routing Inference Requests
//!
//! This crate decides, per incoming request, which backend instance of an
//! inference fleet should serve it. It keeps a live model of backend
//! membership, health and load, and picks a target without blocking on
//! network I/O. Routing policy can be replaced at runtime without dropping
//! in-flight traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Router                                  │
//! │                                                                   │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌─────────────────┐  │
//! │  │  Discovery  │───▶│ BackendRegistry  │◀───│  Liveness probe │  │
//! │  │static/watch │    │ (ArcSwap<map>)   │    │  (static mode)  │  │
//! │  └─────────────┘    └────────┬─────────┘    └─────────────────┘  │
//! │                              │ snapshot()                         │
//! │          ┌───────────────────┼─────────────────────┐              │
//! │          ▼                   ▼                     ▼              │
//! │  ┌───────────────┐  ┌─────────────────┐  ┌──────────────────┐    │
//! │  │ EngineStats   │  │  RoutingEngine  │  │  RequestStats    │    │
//! │  │ Scraper       │─▶│  select(ctx)    │◀─│  Monitor         │    │
//! │  └───────────────┘  └────────▲────────┘  └──────────────────┘    │
//! │                              │ PolicyHandle (ArcSwap)             │
//! │                     ┌────────┴─────────┐                          │
//! │                     │ DynamicConfig    │                          │
//! │                     │ Watcher          │                          │
//! │                     └──────────────────┘                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: Owns every component and their lifecycles
//! - [`BackendRegistry`]: Current set of backends, read through snapshots
//! - [`RoutingEngine`]: The per-request decision
//! - [`RoutingPolicy`]: The active decision configuration
//! - [`RouterConfig`]: Layered configuration (defaults, file, env, CLI)
//!
//! # Quick Start
//!
//! ```ignore
//! use router_core::{Router, RouterConfig, RoutingDecisionContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RouterConfig::load()?;
//!     let router = Router::new(config)?;
//!     router.start().await?;
//!
//!     let ctx = RoutingDecisionContext::new("llama-3-8b").with_session("user-42");
//!     let decision = router.select(&ctx)?;
//!     println!("route to {}", decision.endpoint.id);
//!
//!     router.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod dynamic_config;
pub mod lifecycle;
pub mod probe;
pub mod registry;
pub mod router;
pub mod routing;
pub mod stats;

// Re-exports for convenience
pub use config::{ConfigError, ConfigOverrides, ConfigSource, DiscoveryMode, RouterConfig};
pub use discovery::{DiscoveryError, MembershipEvent};
pub use dynamic_config::{DynamicConfigWatcher, PollOutcome};
pub use lifecycle::LifecycleError;
pub use probe::{BackendProbe, EngineLoad, HttpProbe, ProbeError};
pub use registry::{BackendEndpoint, BackendRegistry, EndpointId, RegistrySnapshot};
pub use router::{Router, RouterError};
pub use routing::{
    NoEligibleBackend, Phase, PolicyError, PolicyHandle, RouterMetrics, RoutingDecision,
    RoutingDecisionContext, RoutingEngine, RoutingPolicy, RoutingReason, StrategyKind,
};
pub use stats::{
    EngineStatSnapshot, EngineStatsScraper, EngineStatsStore, RequestStats, RequestStatsMonitor,
};
