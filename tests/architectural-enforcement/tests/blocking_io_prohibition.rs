//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async production code in tandem-core and tandem-cli MUST NOT
//! use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::io`, `tokio::net`, async `reqwest`.
//! **Acceptable**: Non-async functions (before the runtime starts), test code.

use std::fs;
use std::path::Path;

use architectural_enforcement::{
    code_part, production_files, strip_visibility, test_module_start,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<String> = production_files()
        .iter()
        .flat_map(|path| check_file(path))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::read(), std::fs::write(), std::fs::File");
        eprintln!("  - std::net::TcpStream");
        eprintln!("  - std::io::stdin() inside async code");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read_to_string().await");
        eprintln!("  - tokio::io::BufReader::new(tokio::io::stdin()).lines()");
        eprintln!("  - reqwest::Client::post().send().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn check_file(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let end = test_module_start(&lines).unwrap_or(lines.len());

    find_blocking(&lines[..end])
        .into_iter()
        .map(|(idx, kind)| {
            format!("{}:{} - {kind}: {}", path.display(), idx + 1, lines[idx].trim())
        })
        .collect()
}

/// Indices and kinds of blocking calls made from async code
fn find_blocking(lines: &[&str]) -> Vec<(usize, &'static str)> {
    let mut found = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        let kind = if code.contains("std::fs::") || code.contains("use std::fs") {
            "Blocking file I/O"
        } else if code.contains("std::net::") || code.contains("use std::net") {
            "Blocking network I/O"
        } else if code.contains("reqwest::blocking") {
            "Blocking HTTP client"
        } else if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
            "Blocking stdin/stdout"
        } else {
            continue;
        };

        // Imports count everywhere; calls only inside async functions
        let is_import = code.trim_start().starts_with("use ");
        if is_import || enclosing_fn_is_async(lines, idx) {
            found.push((idx, kind));
        }
    }
    found
}

/// Whether the closest enclosing function is async
fn enclosing_fn_is_async(lines: &[&str], current_idx: usize) -> bool {
    for line in lines[..current_idx].iter().rev() {
        let line = strip_visibility(line);
        if line.starts_with("async fn ") {
            return true;
        }
        if line.starts_with("fn ") {
            return false;
        }
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[test]
fn test_blocking_io_in_async_detected() {
    let code = [
        "pub async fn load() {",
        "    let contents = std::fs::read_to_string(\"client.toml\")?;",
        "}",
    ];
    assert_eq!(find_blocking(&code), vec![(1, "Blocking file I/O")]);
}

#[test]
fn test_blocking_io_in_sync_fn_allowed() {
    let code = [
        "fn main() {",
        "    let contents = std::fs::read_to_string(\"client.toml\")?;",
        "}",
    ];
    assert!(find_blocking(&code).is_empty());
}

#[test]
fn test_blocking_import_detected() {
    let code = ["use std::net::TcpStream;"];
    assert_eq!(find_blocking(&code), vec![(0, "Blocking network I/O")]);
}
