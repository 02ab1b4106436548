//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in the router MUST NOT use blocking I/O or
//! block a runtime thread.
//! **Required**: Use `tokio::fs`, `tokio::time::sleep` and async `reqwest`.
//!
//! Acceptable: files read once at construction, before the router starts
//! serving (the configuration loader and the cluster CA certificate), and
//! test code.

use std::path::Path;

use architectural_enforcement::{report, scan};

const PRODUCTION_DIRS: &[&str] = &["router/core/src", "router/daemon/src"];

/// Read once at construction, never on a worker loop
const CONSTRUCTION_TIME_READS: &[&str] = &["config/mod.rs", "discovery/kubernetes.rs"];

fn is_construction_time(path: &Path) -> bool {
    CONSTRUCTION_TIME_READS
        .iter()
        .any(|allowed| path.ends_with(allowed))
}

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = scan(
        PRODUCTION_DIRS,
        &[
            ("std::fs", "Blocking file I/O"),
            ("std::net::TcpStream", "Blocking network I/O"),
            ("std::process::Command", "Blocking process I/O"),
            ("reqwest::blocking", "Blocking HTTP client"),
        ],
        is_construction_time,
    );

    report(
        "CRITICAL: Blocking I/O calls found in production code!",
        &violations,
    );
}

#[test]
fn test_no_thread_sleep_in_production_code() {
    let violations = scan(
        PRODUCTION_DIRS,
        &[
            ("std::thread::sleep", "Thread sleep"),
            ("thread::sleep(", "Thread sleep"),
        ],
        |_| false,
    );

    report("CRITICAL: Thread sleeps found in production code!", &violations);
}

#[test]
fn test_no_unwrap_in_library_code() {
    let violations = scan(
        &["router/core/src"],
        &[
            (".unwrap()", "unwrap() in library code"),
            (".expect(", "expect() in library code"),
        ],
        |_| false,
    );

    report(
        "Library code must propagate errors instead of panicking!",
        &violations,
    );
}
