//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Scheduler production code MUST NOT sleep. Deadlines are
//! `timeout_at`, waiting for work is a queue handoff, waiting for completion
//! is a `Notify`.
//! **Exceptions**: test code and the scripted mock engine.

use architectural_enforcement::{is_test_support, production_lines, rust_files, scheduler_src};

#[test]
fn test_no_sleep_in_production_code() {
    let src = scheduler_src();
    assert!(src.exists(), "scheduler sources not found at {}", src.display());

    let violations: Vec<String> = rust_files(&src)
        .iter()
        .filter(|path| !is_test_support(path))
        .flat_map(|path| production_lines(path))
        .filter(|line| line.code.contains("::sleep(") || line.code.contains(".sleep("))
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in scheduler production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait on something instead:");
        eprintln!("  - tokio::time::timeout_at for deadlines");
        eprintln!("  - tokio::sync::Notify for completion");
        eprintln!("  - CancellationToken for cancellation");

        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}

#[test]
fn test_no_polling_intervals() {
    let violations: Vec<String> = rust_files(&scheduler_src())
        .iter()
        .flat_map(|path| production_lines(path))
        .filter(|line| line.code.contains("tokio::time::interval"))
        .map(|line| line.to_string())
        .collect();

    assert!(
        violations.is_empty(),
        "Periodic polling found; dispatch is event driven:\n{}",
        violations.join("\n")
    );
}
