//! Routing Policy
//!
//! The active decision configuration and the handle that swaps it. A policy
//! is immutable once installed; changing behavior means installing a new
//! one. Readers load an `Arc` and see either the old or the new policy in
//! full.
//!
//! # JSON Shape
//!
//! ```json
//! {
//!   "routing_logic": "least_load",
//!   "session_key": "x-user-id",
//!   "kv_aware_threshold": 0.8,
//!   "prefill_model_labels": ["prefill"],
//!   "decode_model_labels": ["decode"]
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Strategy
// ============================================================================

/// How candidates are ranked when affinity does not decide
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cycle through candidates in registry order
    #[serde(alias = "roundrobin", alias = "round-robin")]
    RoundRobin,
    /// Lowest KV-cache load first
    #[default]
    #[serde(alias = "least-load", alias = "kvaware", alias = "session")]
    LeastLoad,
    /// Prefill/decode role groups, least-load within the group
    #[serde(alias = "disaggregated_prefill")]
    Disaggregated,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoad => "least_load",
            Self::Disaggregated => "disaggregated",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_load" | "kvaware" | "session" => Ok(Self::LeastLoad),
            "disaggregated" | "disaggregated_prefill" => Ok(Self::Disaggregated),
            other => Err(PolicyError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Stage of a disaggregated request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prefill,
    Decode,
}

// ============================================================================
// Errors
// ============================================================================

/// Policy parse and validation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("failed to parse routing policy: {0}")]
    Parse(String),

    #[error("unknown routing strategy '{0}'")]
    UnknownStrategy(String),

    #[error("kv_aware_threshold must be within [0, 1], got {0}")]
    ThresholdOutOfRange(f64),

    #[error("session key must not be blank")]
    BlankSessionKey,

    #[error("role label '{0}' is listed for both prefill and decode")]
    OverlappingRoles(String),
}

// ============================================================================
// Policy
// ============================================================================

fn default_threshold() -> f64 {
    0.8
}

/// Active decision configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(rename = "routing_logic", alias = "strategy", default)]
    pub strategy: StrategyKind,

    /// Request attribute carrying the session id; affinity is on iff set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,

    /// Affinity candidates at or above this load fall through to the strategy
    #[serde(default = "default_threshold")]
    pub kv_aware_threshold: f64,

    #[serde(rename = "prefill_model_labels", alias = "prefill_labels", default)]
    pub prefill_labels: Vec<String>,

    #[serde(rename = "decode_model_labels", alias = "decode_labels", default)]
    pub decode_labels: Vec<String>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            session_key: None,
            kv_aware_threshold: default_threshold(),
            prefill_labels: Vec::new(),
            decode_labels: Vec::new(),
        }
    }
}

impl RoutingPolicy {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.kv_aware_threshold = threshold;
        self
    }

    pub fn with_roles<P, D>(mut self, prefill: P, decode: D) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        self.prefill_labels = prefill.into_iter().map(Into::into).collect();
        self.decode_labels = decode.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON policy document
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(json).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.kv_aware_threshold.is_finite() || !(0.0..=1.0).contains(&self.kv_aware_threshold) {
            return Err(PolicyError::ThresholdOutOfRange(self.kv_aware_threshold));
        }
        if self.session_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            return Err(PolicyError::BlankSessionKey);
        }
        if let Some(label) = self.prefill_labels.iter().find(|l| self.decode_labels.contains(l)) {
            return Err(PolicyError::OverlappingRoles(label.clone()));
        }
        Ok(())
    }

    pub fn affinity_enabled(&self) -> bool {
        self.session_key.is_some()
    }

    /// Both role groups configured
    pub fn disaggregation_enabled(&self) -> bool {
        !self.prefill_labels.is_empty() && !self.decode_labels.is_empty()
    }

    pub fn labels_for(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Prefill => &self.prefill_labels,
            Phase::Decode => &self.decode_labels,
        }
    }
}

// ============================================================================
// Policy Handle
// ============================================================================

/// An installed policy and its revision
#[derive(Debug)]
pub struct ActivePolicy {
    pub revision: u64,
    pub policy: RoutingPolicy,
}

/// Atomic holder of the active policy
#[derive(Debug)]
pub struct PolicyHandle {
    current: ArcSwap<ActivePolicy>,
}

impl PolicyHandle {
    /// Install the initial policy as revision 1
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(ActivePolicy {
                revision: 1,
                policy,
            }),
        }
    }

    /// Current policy. Never blocks writers or other readers.
    pub fn load(&self) -> Arc<ActivePolicy> {
        self.current.load_full()
    }

    /// Swap in a new policy with a single pointer store. Returns its revision.
    pub fn install(&self, policy: RoutingPolicy) -> u64 {
        let previous = self.current.rcu(|current| ActivePolicy {
            revision: current.revision + 1,
            policy: policy.clone(),
        });
        let revision = previous.revision + 1;
        tracing::info!(
            revision,
            strategy = %policy.strategy,
            session_key = policy.session_key.as_deref().unwrap_or("-"),
            threshold = policy.kv_aware_threshold,
            "Routing policy installed"
        );
        revision
    }

    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(RoutingPolicy::default())
    }
}
