//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Scheduler production code MUST NOT block a runtime worker.
//! Engine I/O goes through the async `EngineTransport`; the only blocking
//! file access is the configuration loader, which runs before requests are
//! served.

use std::path::Path;

use architectural_enforcement::{production_lines, rust_files, scheduler_src, CodeLine};

fn is_config_loader(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "config")
}

fn violation(line: &CodeLine) -> Option<&'static str> {
    let code = line.code.as_str();
    if (code.contains("std::fs") || code.contains("File::open")) && !is_config_loader(&line.path) {
        return Some("Blocking file I/O");
    }
    if code.contains("std::net") {
        return Some("Blocking network I/O");
    }
    if code.contains("std::process::Command") {
        return Some("Blocking process I/O");
    }
    if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
        return Some("Blocking terminal I/O");
    }
    if code.contains("std::thread::sleep") || code.contains(".join()") {
        return Some("Blocking wait");
    }
    None
}

#[test]
fn test_no_blocking_io_in_production_code() {
    let src = scheduler_src();
    assert!(src.exists(), "scheduler sources not found at {}", src.display());

    let violations: Vec<String> = rust_files(&src)
        .iter()
        .flat_map(|path| production_lines(path))
        .filter_map(|line| violation(&line).map(|kind| format!("{kind}: {line}")))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in scheduler production code:\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use the async equivalents:");
        eprintln!("  - EngineTransport for engine calls");
        eprintln!("  - tokio::fs, tokio::net, tokio::process");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_detector_flags_blocking_calls() {
    let line = |path: &str, code: &str| CodeLine {
        path: path.into(),
        number: 1,
        code: code.to_string(),
    };

    assert!(violation(&line("src/routing/scheduler.rs", "let s = std::net::TcpStream::connect(a);")).is_some());
    assert!(violation(&line("src/routing/scheduler.rs", "std::fs::read_to_string(p)")).is_some());
    assert!(violation(&line("src/config/mod.rs", "std::fs::read_to_string(p)")).is_none());
    assert!(violation(&line("src/routing/queue.rs", "self.queue.pop()")).is_none());
}
