//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - The routing decision path performs no I/O and never awaits
//! - No blocking I/O or thread sleeps in production code
//! - No `unwrap()`/`expect()` in production code
//!
//! These tests are designed to catch violations early in the development cycle.
//! The helpers here read source files and hand back only production lines:
//! comments are stripped and everything from the first `#[cfg(test)]` on is
//! dropped, since test modules sit at the bottom of each file.

use std::fs;
use std::path::{Path, PathBuf};

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
    pub rule: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under a workspace-relative directory
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Production lines of a file as `(line_number, code)`, comments removed
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let mut lines = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }
        let code = line.split("//").next().unwrap_or(line);
        if !code.trim().is_empty() {
            lines.push((idx + 1, code.to_string()));
        }
    }
    lines
}

/// Scan directories for production lines matching any forbidden pattern
pub fn scan(
    dirs: &[&str],
    patterns: &[(&str, &'static str)],
    allow: impl Fn(&Path) -> bool,
) -> Vec<Violation> {
    let mut violations = Vec::new();
    for dir in dirs {
        for path in rust_files(dir) {
            if allow(&path) {
                continue;
            }
            for (line, code) in production_lines(&path) {
                for (pattern, rule) in patterns {
                    if code.contains(pattern) {
                        violations.push(Violation {
                            path: path.clone(),
                            line,
                            text: code.trim().to_string(),
                            rule,
                        });
                    }
                }
            }
        }
    }
    violations
}

/// Print violations and fail with a summary
pub fn report(title: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {}\n", title);
    for violation in violations {
        eprintln!("  ❌ {}", violation);
    }
    panic!(
        "\nFound {} violation(s).\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_production_lines_skip_comments_and_tests() {
        let dir = std::env::temp_dir().join("arch-enforcement-selftest");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.rs");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "// header\nfn a() {{}} // trailing\n\n#[cfg(test)]\nmod tests {{ fn b() {{}} }}"
        )
        .unwrap();

        let lines = production_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 2);
        assert_eq!(lines[0].1.trim(), "fn a() {}");
    }

    #[test]
    fn test_workspace_root_contains_router() {
        assert!(workspace_root().join("router").join("core").exists());
    }
}
