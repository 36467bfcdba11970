//! Architectural Enforcement Integration Tests
//!
//! Source-scanning checks that keep the tandem crates honest:
//! - No sleep() calls in production code
//! - No blocking I/O inside async code
//!
//! The session's event loop is cooperative; one blocking call stalls every
//! stream it is reconciling.

use std::path::{Path, PathBuf};

/// Production source trees, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["tandem/core/src", "tandem/cli/src"];

/// Absolute path of the workspace root
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Every `.rs` file under the production trees
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .map(walkdir::DirEntry::into_path)
        })
        .collect()
}

/// Line index where the `#[cfg(test)]` module starts, if any
///
/// Everything from there to the end of the file is test code.
pub fn test_module_start(lines: &[&str]) -> Option<usize> {
    lines
        .iter()
        .position(|line| line.trim_start().starts_with("#[cfg(test)]"))
}

/// Code portion of a line, without a trailing `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Strip leading visibility so `pub fn` and `pub(crate) async fn` read like `fn`
pub fn strip_visibility(line: &str) -> &str {
    let line = line.trim();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return rest;
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_root_contains_core() {
        assert!(workspace_root().join("tandem/core/Cargo.toml").exists());
    }

    #[test]
    fn test_strip_visibility() {
        assert_eq!(strip_visibility("    pub async fn load()"), "async fn load()");
        assert_eq!(strip_visibility("pub(crate) fn helper()"), "fn helper()");
        assert_eq!(strip_visibility("fn plain()"), "fn plain()");
    }

    #[test]
    fn test_test_module_start() {
        let lines = ["fn a() {}", "", "#[cfg(test)]", "mod tests {"];
        assert_eq!(test_module_start(&lines), Some(2));
    }
}
