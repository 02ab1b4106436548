//! Ranking strategies
//!
//! All strategies work on a non-empty, registry-ordered slice of
//! [`Candidate`]s that already passed the model/role/liveness filter.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use super::policy::{Phase, RoutingPolicy};
use crate::registry::BackendEndpoint;
use crate::stats::EngineStatSnapshot;

/// An eligible backend with the stats visible at decision time
#[derive(Clone, Copy, Debug)]
pub struct Candidate<'a> {
    pub endpoint: &'a BackendEndpoint,
    /// Fresh engine stats, `None` when absent or stale
    pub stats: Option<EngineStatSnapshot>,
    /// Recent requests/second to this backend for the model
    pub recent_rate: f64,
}

impl Candidate<'_> {
    pub fn load(&self) -> Option<f64> {
        self.stats.map(|s| s.load)
    }
}

// ============================================================================
// Round Robin
// ============================================================================

/// Per-model cursors over the candidate list
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick<'c, 'a>(&self, model: &str, candidates: &'c [Candidate<'a>]) -> Option<&'c Candidate<'a>> {
        if candidates.is_empty() {
            return None;
        }
        let ticket = match self.cursors.get(model) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(model.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        candidates.get(ticket % candidates.len())
    }
}

// ============================================================================
// Least Load
// ============================================================================

/// Total order used by least-load: fresh stats before stale/absent; among
/// fresh, lowest load then lowest pending; among stale, lowest recent rate;
/// identity breaks the remaining ties.
pub fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> CmpOrdering {
    let by_stats = match (a.stats, b.stats) {
        (Some(x), Some(y)) => x.load.total_cmp(&y.load).then(x.pending.cmp(&y.pending)),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => a.recent_rate.total_cmp(&b.recent_rate),
    };
    by_stats.then_with(|| a.endpoint.id.cmp(&b.endpoint.id))
}

pub fn least_loaded<'c, 'a: 'c, I>(candidates: I) -> Option<&'c Candidate<'a>>
where
    I: IntoIterator<Item = &'c Candidate<'a>>,
{
    candidates.into_iter().min_by(|a, b| rank(a, b))
}

// ============================================================================
// Disaggregated
// ============================================================================

/// Least-load within the role group for `phase`, or across all candidates
/// when the group is empty, disaggregation is off, or no phase is given
pub fn disaggregated<'c, 'a: 'c>(
    candidates: &'c [Candidate<'a>],
    policy: &RoutingPolicy,
    phase: Option<Phase>,
) -> Option<&'c Candidate<'a>> {
    if let (true, Some(phase)) = (policy.disaggregation_enabled(), phase) {
        let labels = policy.labels_for(phase);
        let group = candidates.iter().filter(|c| {
            c.endpoint
                .role
                .as_ref()
                .is_some_and(|role| labels.contains(role))
        });
        if let Some(best) = least_loaded(group) {
            return Some(best);
        }
        tracing::debug!(?phase, "No backend in phase role group, using all candidates");
    }
    least_loaded(candidates)
}
