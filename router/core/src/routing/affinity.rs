//! Session affinity via rendezvous (highest-random-weight) hashing
//!
//! Each candidate gets a weight `hash(session_key, identity)`; the highest
//! weight wins. A key only moves when its current owner leaves the eligible
//! set, and adding a backend only steals the keys it now wins.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::registry::EndpointId;

fn weight(session_key: &str, id: &EndpointId) -> u64 {
    let mut hasher = DefaultHasher::new();
    session_key.hash(&mut hasher);
    id.as_str().hash(&mut hasher);
    hasher.finish()
}

/// Pick the owner of `session_key` among `candidates`
pub fn rendezvous_pick<'a, T, F>(session_key: &str, candidates: &'a [T], id_of: F) -> Option<&'a T>
where
    F: Fn(&T) -> &EndpointId,
{
    candidates.iter().max_by(|a, b| {
        let (ia, ib) = (id_of(a), id_of(b));
        weight(session_key, ia)
            .cmp(&weight(session_key, ib))
            // Equal weights are practically impossible; keep the result total anyway
            .then_with(|| ib.cmp(ia))
    })
}
