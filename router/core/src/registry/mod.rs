//! Backend Registry
//!
//! The registry is the single owner of the known backend set. Writers
//! (discovery and liveness probing) replace an immutable ordered map through
//! an `ArcSwap`; readers take a point-in-time [`RegistrySnapshot`] that is
//! never affected by later mutation.
//!
//! # Ordering
//!
//! Endpoints are keyed by their normalized base URL. The map is a `BTreeMap`,
//! so iteration order is identity order. Everything that talks about
//! "registry order" (round-robin, tie-breaks) means this order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Endpoint Identity
// ============================================================================

/// Identity of a backend: its base URL without a trailing slash
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Build an identity from a URL, normalizing surrounding whitespace and
    /// trailing slashes so `http://a:8000/` and `http://a:8000` collide.
    pub fn new(url: impl AsRef<str>) -> Self {
        Self(url.as_ref().trim().trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join a path onto the base URL
    pub fn join(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// Backend Endpoint
// ============================================================================

/// A backend instance and its static metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    /// Normalized base URL
    pub id: EndpointId,
    /// Models this backend serves
    pub models: BTreeSet<String>,
    /// Alternative model names routed to this backend
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Role label, e.g. "prefill" or "decode"
    #[serde(default)]
    pub role: Option<String>,
    /// Arbitrary labels (pod labels in cluster mode)
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// False once liveness probing has marked the backend unreachable
    #[serde(default = "default_live")]
    pub live: bool,
}

fn default_live() -> bool {
    true
}

impl BackendEndpoint {
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            id: EndpointId::new(url),
            models: BTreeSet::new(),
            aliases: BTreeSet::new(),
            role: None,
            labels: BTreeMap::new(),
            live: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.models.insert(model.into());
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.insert(alias.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether this backend serves `model` by name or alias
    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model) || self.aliases.contains(model)
    }

    /// Whether this backend carries exactly the given role label
    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    endpoints: BTreeMap<EndpointId, BackendEndpoint>,
    revision: u64,
}

/// Point-in-time view of the registry
///
/// Cloning is an `Arc` bump. The contents never change after creation.
#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    state: Arc<RegistryState>,
}

impl RegistrySnapshot {
    /// Endpoints in registry order
    pub fn iter(&self) -> impl Iterator<Item = &BackendEndpoint> {
        self.state.endpoints.values()
    }

    pub fn get(&self, id: &EndpointId) -> Option<&BackendEndpoint> {
        self.state.endpoints.get(id)
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.state.endpoints.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.endpoints.is_empty()
    }

    /// Number of endpoints currently marked live
    pub fn live_count(&self) -> usize {
        self.iter().filter(|e| e.live).count()
    }

    /// Revision of the registry when this snapshot was taken
    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    pub fn to_vec(&self) -> Vec<BackendEndpoint> {
        self.iter().cloned().collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Outcome of an upsert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    Added,
    Updated,
    Unchanged,
}

/// Copy-on-write set of backend endpoints
#[derive(Debug, Default)]
pub struct BackendRegistry {
    state: ArcSwap<RegistryState>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry with an initial set of endpoints
    pub fn with_endpoints(endpoints: impl IntoIterator<Item = BackendEndpoint>) -> Self {
        let registry = Self::new();
        for endpoint in endpoints {
            registry.upsert(endpoint);
        }
        registry
    }

    /// Insert or replace an endpoint. The last upsert for an identity wins.
    pub fn upsert(&self, endpoint: BackendEndpoint) -> RegistryChange {
        if self.state.load().endpoints.get(&endpoint.id) == Some(&endpoint) {
            return RegistryChange::Unchanged;
        }

        let previous = self.state.rcu(|current| {
            let mut endpoints = current.endpoints.clone();
            endpoints.insert(endpoint.id.clone(), endpoint.clone());
            RegistryState {
                endpoints,
                revision: current.revision + 1,
            }
        });

        let change = if previous.endpoints.contains_key(&endpoint.id) {
            RegistryChange::Updated
        } else {
            RegistryChange::Added
        };
        tracing::debug!(backend = %endpoint.id, ?change, "Registry upsert");
        change
    }

    /// Remove an endpoint. Returns false if it was not registered.
    pub fn remove(&self, id: &EndpointId) -> bool {
        if !self.state.load().endpoints.contains_key(id) {
            return false;
        }

        let previous = self.state.rcu(|current| {
            let mut endpoints = current.endpoints.clone();
            let revision = if endpoints.remove(id).is_some() {
                current.revision + 1
            } else {
                current.revision
            };
            RegistryState {
                endpoints,
                revision,
            }
        });

        let removed = previous.endpoints.contains_key(id);
        if removed {
            tracing::debug!(backend = %id, "Registry remove");
        }
        removed
    }

    /// Replace the whole set in one swap. Readers see either the old set or
    /// the new one, never a mix. Returns the identities that were dropped.
    pub fn replace_all(
        &self,
        endpoints: impl IntoIterator<Item = BackendEndpoint>,
    ) -> Vec<EndpointId> {
        let replacement: BTreeMap<EndpointId, BackendEndpoint> = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.id.clone(), endpoint))
            .collect();

        let previous = self.state.rcu(|current| {
            let revision = if current.endpoints == replacement {
                current.revision
            } else {
                current.revision + 1
            };
            RegistryState {
                endpoints: replacement.clone(),
                revision,
            }
        });

        previous
            .endpoints
            .keys()
            .filter(|id| !replacement.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Flip the liveness flag. Returns true if the flag changed.
    pub fn set_liveness(&self, id: &EndpointId, live: bool) -> bool {
        match self.state.load().endpoints.get(id) {
            Some(endpoint) if endpoint.live != live => {}
            _ => return false,
        }

        let previous = self.state.rcu(|current| {
            let mut endpoints = current.endpoints.clone();
            let mut revision = current.revision;
            if let Some(endpoint) = endpoints.get_mut(id) {
                if endpoint.live != live {
                    endpoint.live = live;
                    revision += 1;
                }
            }
            RegistryState {
                endpoints,
                revision,
            }
        });

        previous
            .endpoints
            .get(id)
            .is_some_and(|endpoint| endpoint.live != live)
    }

    /// Point-in-time copy of the registry. Never blocks on I/O.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            state: self.state.load_full(),
        }
    }

    pub fn get(&self, id: &EndpointId) -> Option<BackendEndpoint> {
        self.state.load().endpoints.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.load().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic counter bumped on every effective mutation
    pub fn revision(&self) -> u64 {
        self.state.load().revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str, model: &str) -> BackendEndpoint {
        BackendEndpoint::new(url).with_model(model)
    }

    #[test]
    fn test_endpoint_id_normalization() {
        assert_eq!(EndpointId::new("http://a:8000/"), EndpointId::new(" http://a:8000"));
        assert_eq!(EndpointId::new("http://a:8000/").join("/health"), "http://a:8000/health");
    }

    #[test]
    fn test_serves_name_or_alias() {
        let ep = endpoint("http://a", "llama").with_alias("llama-latest");
        assert!(ep.serves("llama"));
        assert!(ep.serves("llama-latest"));
        assert!(!ep.serves("mistral"));
    }

    #[test]
    fn test_upsert_and_remove() {
        let registry = BackendRegistry::new();
        assert_eq!(registry.upsert(endpoint("http://a", "m")), RegistryChange::Added);
        assert_eq!(registry.upsert(endpoint("http://a", "m")), RegistryChange::Unchanged);
        assert_eq!(registry.upsert(endpoint("http://a", "n")), RegistryChange::Updated);
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&EndpointId::new("http://a")));
        assert!(!registry.remove(&EndpointId::new("http://a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_mutation() {
        let registry = BackendRegistry::new();
        registry.upsert(endpoint("http://a", "m"));
        let before = registry.snapshot();

        registry.upsert(endpoint("http://b", "m"));
        registry.remove(&EndpointId::new("http://a"));

        assert_eq!(before.len(), 1);
        assert!(before.contains(&EndpointId::new("http://a")));
        let after = registry.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.contains(&EndpointId::new("http://b")));
    }

    #[test]
    fn test_snapshot_is_identity_ordered() {
        let registry = BackendRegistry::with_endpoints([
            endpoint("http://c", "m"),
            endpoint("http://a", "m"),
            endpoint("http://b", "m"),
        ]);
        let ids: Vec<_> = registry.snapshot().iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["http://a", "http://b", "http://c"]);
    }

    #[test]
    fn test_last_event_wins_per_identity() {
        let registry = BackendRegistry::new();
        let id = EndpointId::new("http://a");
        let events: Vec<Option<&str>> = vec![Some("m1"), None, Some("m2"), Some("m3"), None, Some("m4")];

        for event in &events {
            match event {
                Some(model) => {
                    registry.upsert(endpoint("http://a", model));
                }
                None => {
                    registry.remove(&id);
                }
            }
        }

        let current = registry.get(&id).map(|e| e.models.into_iter().collect::<Vec<_>>());
        assert_eq!(current, Some(vec!["m4".to_string()]));
    }

    #[test]
    fn test_replace_all_is_one_revision() {
        let registry = BackendRegistry::with_endpoints([
            endpoint("http://a", "m"),
            endpoint("http://b", "m"),
        ]);
        let rev = registry.revision();
        let held = registry.snapshot();

        let removed = registry.replace_all([endpoint("http://b", "m"), endpoint("http://c", "m")]);
        assert_eq!(removed, vec![EndpointId::new("http://a")]);
        assert_eq!(registry.revision(), rev + 1);
        let ids: Vec<_> = registry.snapshot().iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["http://b", "http://c"]);
        assert_eq!(held.len(), 2);

        // Same content is not a change
        assert!(registry
            .replace_all([endpoint("http://b", "m"), endpoint("http://c", "m")])
            .is_empty());
        assert_eq!(registry.revision(), rev + 1);
    }

    #[test]
    fn test_resync_never_shows_a_partial_set() {
        let registry = Arc::new(BackendRegistry::with_endpoints([
            endpoint("http://a", "m"),
            endpoint("http://b", "m"),
        ]));
        let left = vec![endpoint("http://a", "m"), endpoint("http://b", "m")];
        let right = vec![endpoint("http://c", "m"), endpoint("http://d", "m")];

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..500 {
                    let next = if i % 2 == 0 { right.clone() } else { left.clone() };
                    registry.replace_all(next);
                }
            })
        };

        for _ in 0..500 {
            let ids: Vec<_> = registry.snapshot().iter().map(|e| e.id.to_string()).collect();
            assert!(
                ids == ["http://a", "http://b"] || ids == ["http://c", "http://d"],
                "partial set observed: {:?}",
                ids
            );
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_set_liveness() {
        let registry = BackendRegistry::with_endpoints([endpoint("http://a", "m")]);
        let id = EndpointId::new("http://a");
        let rev = registry.revision();

        assert!(registry.set_liveness(&id, false));
        assert!(!registry.set_liveness(&id, false));
        assert_eq!(registry.revision(), rev + 1);
        assert_eq!(registry.snapshot().live_count(), 0);

        assert!(registry.set_liveness(&id, true));
        assert!(!registry.set_liveness(&EndpointId::new("http://missing"), false));
    }

    #[test]
    fn test_concurrent_readers_see_whole_states() {
        let registry = Arc::new(BackendRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    registry.upsert(endpoint(&format!("http://n{}", i % 10), "m"));
                    if i % 3 == 0 {
                        registry.remove(&EndpointId::new(format!("http://n{}", (i + 5) % 10)));
                    }
                }
            })
        };

        for _ in 0..200 {
            let snap = registry.snapshot();
            let counted = snap.iter().count();
            assert_eq!(counted, snap.len());
        }
        writer.join().unwrap();
    }
}
