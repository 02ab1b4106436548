//! Integration Test: Routing Decision Path Has No I/O
//!
//! **Policy**: `select` reads in-memory state only. Nothing under
//! `router/core/src/routing` may await, touch the network or filesystem,
//! or sleep. Background workers own all I/O.

use architectural_enforcement::{report, scan};

#[test]
fn test_routing_module_performs_no_io() {
    let violations = scan(
        &["router/core/src/routing"],
        &[
            (".await", "Await on the decision path"),
            ("async fn", "Async function on the decision path"),
            ("reqwest", "HTTP client on the decision path"),
            ("tokio::net", "Network I/O on the decision path"),
            ("tokio::fs", "Filesystem I/O on the decision path"),
            ("std::fs", "Filesystem I/O on the decision path"),
            ("std::net", "Network I/O on the decision path"),
            ("sleep(", "Sleep on the decision path"),
            ("tokio::sync::Mutex", "Async lock on the decision path"),
        ],
        |_| false,
    );

    report(
        "CRITICAL: I/O or awaits found in the routing decision path!",
        &violations,
    );
}
