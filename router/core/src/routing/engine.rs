//! Routing Engine
//!
//! Picks exactly one backend per request, or fails with
//! [`NoEligibleBackend`].
//!
//! # Decision Flow
//!
//! ```text
//! 1. Filter the registry snapshot: live, serves the model, has the role
//! 2. Session key + affinity on: rendezvous-hash the key over the filtered
//!    set; keep that backend unless its fresh load is at/over the threshold
//! 3. Otherwise rank by the policy strategy
//!    (round-robin | least-load | disaggregated)
//! ```
//!
//! `select` never awaits and never touches the network. It reads one
//! `ArcSwap` for the policy, one for the registry, and a `DashMap` shard per
//! candidate for engine stats.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::affinity::rendezvous_pick;
use super::metrics::RouterMetrics;
use super::policy::{ActivePolicy, Phase, PolicyHandle, StrategyKind};
use super::strategy::{disaggregated, least_loaded, Candidate, RoundRobin};
use crate::registry::{BackendEndpoint, BackendRegistry};
use crate::stats::{EngineStatsStore, RequestStatsMonitor};

// ============================================================================
// Request Context
// ============================================================================

/// Per-request routing inputs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingDecisionContext {
    /// Correlation id for logs
    pub request_id: String,
    pub model: String,
    /// Value of the session attribute named by the policy's session key
    pub session_key: Option<String>,
    /// Required role label
    pub role: Option<String>,
    pub phase: Option<Phase>,
}

impl RoutingDecisionContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            session_key: None,
            role: None,
            phase: None,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_key = Some(session.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Why a backend was chosen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingReason {
    /// Session owner under the load threshold (or without fresh stats)
    SessionAffinity,
    /// Ranked by the strategy, no session involved
    Strategy(StrategyKind),
    /// Session owner was over the threshold; ranked by the strategy instead
    AffinityOverflow(StrategyKind),
}

/// The chosen backend
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub endpoint: BackendEndpoint,
    pub reason: RoutingReason,
    /// Revision of the policy the decision was made under
    pub policy_revision: u64,
    /// Fresh load of the chosen backend, if known
    pub load: Option<f64>,
}

/// No live backend serves the model (with the required role)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no eligible backend for model '{model}' (role: {})", .role.as_deref().unwrap_or("any"))]
pub struct NoEligibleBackend {
    pub model: String,
    pub role: Option<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// Stateless-per-request backend selector
pub struct RoutingEngine {
    registry: Arc<BackendRegistry>,
    engine_stats: Arc<EngineStatsStore>,
    request_stats: Arc<RequestStatsMonitor>,
    policy: Arc<PolicyHandle>,
    round_robin: RoundRobin,
    metrics: Arc<RouterMetrics>,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        engine_stats: Arc<EngineStatsStore>,
        request_stats: Arc<RequestStatsMonitor>,
        policy: Arc<PolicyHandle>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            registry,
            engine_stats,
            request_stats,
            policy,
            round_robin: RoundRobin::new(),
            metrics,
        }
    }

    pub fn policy(&self) -> Arc<ActivePolicy> {
        self.policy.load()
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    /// Choose a backend for the request
    pub fn select(&self, ctx: &RoutingDecisionContext) -> Result<RoutingDecision, NoEligibleBackend> {
        let started = Instant::now();
        let active = self.policy.load();
        let snapshot = self.registry.snapshot();

        let candidates: Vec<Candidate<'_>> = snapshot
            .iter()
            .filter(|e| e.live && e.serves(&ctx.model))
            .filter(|e| ctx.role.as_deref().map_or(true, |role| e.has_role(role)))
            .map(|endpoint| {
                let stats = self.engine_stats.fresh(&endpoint.id);
                let recent_rate = match stats {
                    Some(_) => 0.0,
                    None => self.request_stats.recent(&endpoint.id, &ctx.model).rate,
                };
                Candidate {
                    endpoint,
                    stats,
                    recent_rate,
                }
            })
            .collect();

        if candidates.is_empty() {
            self.metrics.record_no_eligible();
            tracing::debug!(
                request_id = %ctx.request_id,
                model = %ctx.model,
                role = ctx.role.as_deref().unwrap_or("-"),
                "No eligible backend"
            );
            return Err(NoEligibleBackend {
                model: ctx.model.clone(),
                role: ctx.role.clone(),
            });
        }

        let policy = &active.policy;
        let mut overflowed = false;

        if let (Some(session), true) = (ctx.session_key.as_deref(), policy.affinity_enabled()) {
            if let Some(owner) = rendezvous_pick(session, &candidates, |c| &c.endpoint.id) {
                match owner.load() {
                    Some(load) if load >= policy.kv_aware_threshold => {
                        overflowed = true;
                        tracing::debug!(
                            request_id = %ctx.request_id,
                            backend = %owner.endpoint.id,
                            load,
                            threshold = policy.kv_aware_threshold,
                            "Session owner over threshold, falling through"
                        );
                    }
                    _ => {
                        return Ok(self.decide(ctx, owner, RoutingReason::SessionAffinity, &active, started));
                    }
                }
            }
        }

        let chosen = match policy.strategy {
            StrategyKind::RoundRobin => self.round_robin.pick(&ctx.model, &candidates),
            StrategyKind::LeastLoad => least_loaded(&candidates),
            StrategyKind::Disaggregated => disaggregated(&candidates, policy, ctx.phase),
        };
        // Candidates are non-empty, so every strategy yields one
        let chosen = chosen.unwrap_or(&candidates[0]);

        let reason = if overflowed {
            RoutingReason::AffinityOverflow(policy.strategy)
        } else {
            RoutingReason::Strategy(policy.strategy)
        };
        Ok(self.decide(ctx, chosen, reason, &active, started))
    }

    fn decide(
        &self,
        ctx: &RoutingDecisionContext,
        chosen: &Candidate<'_>,
        reason: RoutingReason,
        active: &ActivePolicy,
        started: Instant,
    ) -> RoutingDecision {
        self.metrics.record_decision(reason, started.elapsed());
        tracing::trace!(
            request_id = %ctx.request_id,
            model = %ctx.model,
            backend = %chosen.endpoint.id,
            ?reason,
            revision = active.revision,
            "Routing decision"
        );
        RoutingDecision {
            endpoint: chosen.endpoint.clone(),
            reason,
            policy_revision: active.revision,
            load: chosen.load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointId;
    use crate::routing::policy::RoutingPolicy;
    use crate::stats::{EngineStatSnapshot, ScraperConfig};

    struct Fixture {
        registry: Arc<BackendRegistry>,
        stats: Arc<EngineStatsStore>,
        policy: Arc<PolicyHandle>,
        engine: RoutingEngine,
    }

    fn fixture(endpoints: Vec<BackendEndpoint>, policy: RoutingPolicy) -> Fixture {
        let registry = Arc::new(BackendRegistry::with_endpoints(endpoints));
        let stats = Arc::new(EngineStatsStore::new(&ScraperConfig::default()));
        let policy = Arc::new(PolicyHandle::new(policy));
        let engine = RoutingEngine::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::new(RequestStatsMonitor::default()),
            Arc::clone(&policy),
            Arc::new(RouterMetrics::new()),
        );
        Fixture {
            registry,
            stats,
            policy,
            engine,
        }
    }

    fn set_load(stats: &EngineStatsStore, url: &str, load: f64, pending: u64) {
        stats.record_success(&EndpointId::new(url), EngineStatSnapshot::new(load, pending));
    }

    #[test]
    fn test_no_eligible_backend() {
        let f = fixture(
            vec![BackendEndpoint::new("http://a").with_model("llama")],
            RoutingPolicy::default(),
        );
        let err = f.engine.select(&RoutingDecisionContext::new("mistral")).unwrap_err();
        assert_eq!(err.model, "mistral");
        assert_eq!(f.engine.metrics().no_eligible.get(), 1);
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_role_filter() {
        let f = fixture(
            vec![
                BackendEndpoint::new("http://a").with_model("m").with_role("prefill"),
                BackendEndpoint::new("http://b").with_model("m").with_role("decode"),
            ],
            RoutingPolicy::default(),
        );
        let decision = f
            .engine
            .select(&RoutingDecisionContext::new("m").with_role("decode"))
            .unwrap();
        assert_eq!(decision.endpoint.id.as_str(), "http://b");

        let err = f
            .engine
            .select(&RoutingDecisionContext::new("m").with_role("encode"))
            .unwrap_err();
        assert_eq!(err.role.as_deref(), Some("encode"));
    }

    #[test]
    fn test_unreachable_backends_are_skipped() {
        let f = fixture(
            vec![
                BackendEndpoint::new("http://a").with_model("m"),
                BackendEndpoint::new("http://b").with_model("m"),
            ],
            RoutingPolicy::default(),
        );
        f.registry.set_liveness(&EndpointId::new("http://a"), false);
        for _ in 0..5 {
            let decision = f.engine.select(&RoutingDecisionContext::new("m")).unwrap();
            assert_eq!(decision.endpoint.id.as_str(), "http://b");
        }
    }

    #[test]
    fn test_alias_matches() {
        let f = fixture(
            vec![BackendEndpoint::new("http://a").with_model("m").with_alias("default")],
            RoutingPolicy::default(),
        );
        assert!(f.engine.select(&RoutingDecisionContext::new("default")).is_ok());
    }

    #[test]
    fn test_affinity_overflow_falls_back_to_least_load() {
        let f = fixture(
            vec![
                BackendEndpoint::new("http://a").with_model("m"),
                BackendEndpoint::new("http://b").with_model("m"),
            ],
            RoutingPolicy::default().with_session_key("x-user").with_threshold(0.5),
        );
        let ctx = RoutingDecisionContext::new("m").with_session("user-1");
        let owner = f.engine.select(&ctx).unwrap();
        assert_eq!(owner.reason, RoutingReason::SessionAffinity);

        let other = if owner.endpoint.id.as_str() == "http://a" { "http://b" } else { "http://a" };
        set_load(&f.stats, owner.endpoint.id.as_str(), 0.9, 0);
        set_load(&f.stats, other, 0.1, 0);

        let decision = f.engine.select(&ctx).unwrap();
        assert_eq!(decision.endpoint.id.as_str(), other);
        assert_eq!(decision.reason, RoutingReason::AffinityOverflow(StrategyKind::LeastLoad));
    }

    #[test]
    fn test_everything_over_threshold_still_routes() {
        let f = fixture(
            vec![
                BackendEndpoint::new("http://a").with_model("m"),
                BackendEndpoint::new("http://b").with_model("m"),
            ],
            RoutingPolicy::default().with_session_key("x-user").with_threshold(0.5),
        );
        set_load(&f.stats, "http://a", 0.95, 0);
        set_load(&f.stats, "http://b", 0.7, 0);

        let decision = f
            .engine
            .select(&RoutingDecisionContext::new("m").with_session("anyone"))
            .unwrap();
        assert_eq!(decision.endpoint.id.as_str(), "http://b");
        assert_eq!(decision.load, Some(0.7));
    }

    #[test]
    fn test_affinity_ignored_when_policy_has_no_session_key() {
        let f = fixture(
            vec![
                BackendEndpoint::new("http://a").with_model("m"),
                BackendEndpoint::new("http://b").with_model("m"),
            ],
            RoutingPolicy::new(StrategyKind::RoundRobin),
        );
        let ctx = RoutingDecisionContext::new("m").with_session("user-1");
        let first = f.engine.select(&ctx).unwrap();
        let second = f.engine.select(&ctx).unwrap();
        assert_ne!(first.endpoint.id, second.endpoint.id);
        assert_eq!(first.reason, RoutingReason::Strategy(StrategyKind::RoundRobin));
    }

    #[test]
    fn test_decision_reports_policy_revision() {
        let f = fixture(
            vec![BackendEndpoint::new("http://a").with_model("m")],
            RoutingPolicy::default(),
        );
        assert_eq!(f.engine.select(&RoutingDecisionContext::new("m")).unwrap().policy_revision, 1);
        f.policy.install(RoutingPolicy::new(StrategyKind::RoundRobin));
        let decision = f.engine.select(&RoutingDecisionContext::new("m")).unwrap();
        assert_eq!(decision.policy_revision, 2);
        assert_eq!(decision.reason, RoutingReason::Strategy(StrategyKind::RoundRobin));
    }
}
