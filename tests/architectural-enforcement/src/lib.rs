//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`. They enforce rules that
//! keep the scheduler non-blocking:
//! - No sleeping in production code; waiting is done on I/O, timers or notifies
//! - No blocking network or process I/O
//! - Blocking file I/O only in the configuration loader, before the runtime
//!   serves requests

use std::fs;
use std::path::{Path, PathBuf};

/// Production sources of the scheduler crate
#[must_use]
pub fn scheduler_src() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scheduler/core/src")
}

/// A production line of code with its location
#[derive(Debug, Clone)]
pub struct CodeLine {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: String,
}

impl std::fmt::Display for CodeLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Every `.rs` file below `dir`, sorted
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Lines of `path` that belong to production code
///
/// Scanning stops at the first `#[cfg(test)]`, which by convention opens the
/// file's trailing test module. Comment-only lines are skipped.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<CodeLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    production_lines_of(path, &content)
}

/// [`production_lines`] over already loaded text
#[must_use]
pub fn production_lines_of(path: &Path, content: &str) -> Vec<CodeLine> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter_map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            if code.trim().is_empty() {
                return None;
            }
            Some(CodeLine {
                path: path.to_path_buf(),
                number: idx + 1,
                code: code.to_string(),
            })
        })
        .collect()
}

/// Whether `path` is test support compiled only for tests
#[must_use]
pub fn is_test_support(path: &Path) -> bool {
    path.ends_with("engine/mock.rs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanning_stops_at_test_module() {
        let source = "fn run() {\n    work();\n}\n\n#[cfg(test)]\nmod tests {\n    sleep();\n}\n";
        let lines = production_lines_of(Path::new("x.rs"), source);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| !l.code.contains("sleep")));
    }

    #[test]
    fn test_comments_are_ignored() {
        let source = "// std::thread::sleep(d)\nlet x = 1; // std::net::TcpStream\n";
        let lines = production_lines_of(Path::new("x.rs"), source);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 2);
        assert!(!lines[0].code.contains("std::net"));
    }

    #[test]
    fn test_scheduler_sources_found() {
        let files = rust_files(&scheduler_src());
        assert!(files.iter().any(|f| f.ends_with("routing/scheduler.rs")));
    }
}
