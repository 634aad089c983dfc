//! Integration Test: Source Hygiene
//!
//! **Policy**: production code in `router-core` must not block a runtime
//! thread with `std::thread::sleep` and must not print to stdout. Waiting
//! goes through tokio timers; output goes through `tracing`.
//!
//! **Exceptions**: test modules (`#[cfg(test)]` and below).

use architectural_enforcement::{find_violations, rust_sources};

const CORE_SRC: &str = "router/core/src";

fn report(title: &str, violations: &[architectural_enforcement::Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{title}");
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!("Found {} violation(s); fix these before merging", violations.len());
}

#[test]
fn test_sources_are_found() {
    assert!(
        !rust_sources(CORE_SRC).is_empty(),
        "no sources found under {CORE_SRC}"
    );
}

#[test]
fn test_no_blocking_sleep_in_core() {
    let violations = find_violations(CORE_SRC, &["std::thread::sleep", "thread::sleep("]);
    report("Blocking sleep in production code (use tokio::time):", &violations);
}

#[test]
fn test_no_stdout_printing_in_core() {
    let violations = find_violations(CORE_SRC, &["println!", "print!("]);
    report("Printing in production code (use tracing):", &violations);
}
