//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in tandem-core and tandem-cli MUST NOT call
//! sleep methods. Waiting happens on I/O: the next stream fragment, the next
//! channel message, the next line of input.
//! **Exceptions**: Exponential backoff in retry logic, test code.

use std::fs;
use std::path::Path;

use architectural_enforcement::{code_part, production_files, test_module_start};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = production_files()
        .iter()
        .flat_map(|path| check_file(path))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Test code (#[cfg(test)] modules)");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops (await the channel instead)");
        eprintln!("  - Sleep to 'wait' for a stream to finish");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
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

    find_sleeps(&lines[..end])
        .into_iter()
        .map(|idx| format!("{}:{} - {}", path.display(), idx + 1, lines[idx].trim()))
        .collect()
}

/// Indices of lines that sleep outside a backoff context
fn find_sleeps(lines: &[&str]) -> Vec<usize> {
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| {
            let code = code_part(line);
            code.contains("::sleep(") || code.contains(".sleep(")
        })
        .filter(|(idx, _)| !is_backoff_context(lines, *idx))
        .map(|(idx, _)| idx)
        .collect()
}

/// Check if sleep is used for exponential backoff (acceptable for retry logic)
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context = &lines[current_idx.saturating_sub(15)..(current_idx + 5).min(lines.len())];

    let has_backoff_calc = context.iter().any(|line| {
        let line = line.to_lowercase();
        line.contains("<<") || line.contains("pow") || line.contains("* 2")
    });
    let has_retry_context = context.iter().any(|line| {
        let line = line.to_lowercase();
        line.contains("retry") || line.contains("backoff") || line.contains("attempt")
    });

    has_backoff_calc && has_retry_context
}

#[test]
fn test_sleep_detection() {
    let code = [
        "async fn wait_for_stream() {",
        "    tokio::time::sleep(Duration::from_millis(10)).await;",
        "}",
    ];
    assert_eq!(find_sleeps(&code), vec![1]);
}

#[test]
fn test_backoff_detection() {
    let code = [
        "async fn reconnect() {",
        "    let delay = base_delay * (1 << attempt);",
        "    tracing::warn!(attempt, \"Retrying\");",
        "    tokio::time::sleep(Duration::from_millis(delay)).await;",
        "}",
    ];
    assert!(is_backoff_context(&code, 3));
    assert!(find_sleeps(&code).is_empty());
}

#[test]
fn test_commented_sleep_ignored() {
    let code = ["let x = 1; // never tokio::time::sleep(d) here"];
    assert!(find_sleeps(&code).is_empty());
}
