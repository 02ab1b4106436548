//! Request Routing
//!
//! The per-request decision and everything it reads:
//!
//! - [`policy`]: the active decision configuration and its atomic handle
//! - [`affinity`]: rendezvous hashing of session keys
//! - [`strategy`]: round-robin, least-load and disaggregated ranking
//! - [`engine`]: candidate filtering and the decision itself
//! - [`metrics`]: decision counters and latency
//!
//! Nothing in this module performs I/O or awaits.

pub mod affinity;
pub mod engine;
pub mod metrics;
pub mod policy;
pub mod strategy;

pub use engine::{
    NoEligibleBackend, RoutingDecision, RoutingDecisionContext, RoutingEngine, RoutingReason,
};
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot, RouterMetrics};
pub use policy::{ActivePolicy, Phase, PolicyError, PolicyHandle, RoutingPolicy, StrategyKind};
pub use strategy::Candidate;
