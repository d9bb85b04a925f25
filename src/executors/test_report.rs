//! Extraction of structured artifacts from captured CLI output.
//!
//! The Dev executor parses familiar test-runner summaries (Jest, Vitest,
//! istanbul coverage tables); agents that emit structured reports wrap them
//! in a fenced ```json block which [`parse_json_block`] extracts.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Test-run summary. Never null: when nothing can be parsed the caller
/// falls back to [`TestResults::zeroed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub coverage_percent: Option<f64>,
}

impl TestResults {
    pub fn zeroed() -> Self {
        Self {
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            coverage_percent: None,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total > 0
    }
}

// Jest: `Tests:       3 failed, 2 skipped, 12 passed, 17 total`
static JEST_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests?:\s*(.+?)\s*(\d+)\s+total").expect("valid regex"));
static JEST_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(passed|failed|skipped|todo)").expect("valid regex"));

// Vitest: `Tests  2 failed | 10 passed (12)`
static VITEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests?\s+(?:(\d+)\s+failed\s*\|\s*)?(\d+)\s+passed(?:\s*\|\s*(\d+)\s+failed)?\s*\((\d+)\)")
        .expect("valid regex")
});

// istanbul text table: `All files      |   85.71 |   72.00 | ...`
static ALL_FILES_COVERAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"All files\s*\|\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"));

// istanbul summary: `Statements   : 85.71% ( 120/140 )`
static STATEMENTS_COVERAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Statements\s*:\s*([0-9]+(?:\.[0-9]+)?)%").expect("valid regex")
});

/// Parse a coverage percentage from output, if any runner printed one.
pub fn parse_coverage(lines: &[String]) -> Option<f64> {
    for line in lines {
        if let Some(caps) = ALL_FILES_COVERAGE.captures(line) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Some(value);
            }
        }
        if let Some(caps) = STATEMENTS_COVERAGE.captures(line) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Some(value);
            }
        }
    }
    None
}

/// Parse a test-runner summary out of raw output lines. Later summaries win
/// (a re-run overwrites an earlier failed run's numbers).
pub fn parse_test_summary(lines: &[String]) -> Option<TestResults> {
    let mut result: Option<TestResults> = None;

    for line in lines {
        if let Some(caps) = JEST_SUMMARY.captures(line) {
            let total: u32 = caps[2].parse().ok()?;
            let mut passed = 0;
            let mut failed = 0;
            let mut skipped = 0;
            for segment in JEST_SEGMENT.captures_iter(&caps[1]) {
                let count: u32 = segment[1].parse().unwrap_or(0);
                match &segment[2] {
                    "passed" => passed = count,
                    "failed" => failed = count,
                    "skipped" | "todo" => skipped += count,
                    _ => {}
                }
            }
            result = Some(TestResults {
                total,
                passed,
                failed,
                skipped,
                coverage_percent: None,
            });
            continue;
        }

        if let Some(caps) = VITEST_SUMMARY.captures(line) {
            let failed: u32 = caps
                .get(1)
                .or_else(|| caps.get(3))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let passed: u32 = caps[2].parse().ok()?;
            let total: u32 = caps[4].parse().ok()?;
            result = Some(TestResults {
                total,
                passed,
                failed,
                skipped: total.saturating_sub(passed + failed),
                coverage_percent: None,
            });
        }
    }

    if let Some(results) = result.as_mut() {
        results.coverage_percent = parse_coverage(lines);
    }
    result
}

/// Extract and deserialize the first parseable fenced ```json block.
pub fn parse_json_block<T: DeserializeOwned>(lines: &[String]) -> Option<T> {
    let mut in_block = false;
    let mut block = String::new();
    for line in lines {
        let trimmed = line.trim();
        if !in_block {
            if trimmed.starts_with("```json") {
                in_block = true;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            if let Ok(value) = serde_json::from_str::<T>(&block) {
                return Some(value);
            }
            in_block = false;
            block.clear();
            continue;
        }
        block.push_str(line);
        block.push('\n');
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<String> {
        raw.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn parses_jest_summary_with_failures() {
        let output = lines(
            "Test Suites: 2 failed, 5 passed, 7 total\n\
             Tests:       3 failed, 12 passed, 15 total\n\
             Snapshots:   0 total",
        );
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.total, 15);
        assert_eq!(results.passed, 12);
        assert_eq!(results.failed, 3);
        assert_eq!(results.skipped, 0);
    }

    #[test]
    fn parses_jest_summary_with_skipped_tests() {
        let output = lines("Tests: 1 failed, 2 skipped, 9 passed, 12 total");
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.total, 12);
        assert_eq!(results.passed, 9);
        assert_eq!(results.failed, 1);
        assert_eq!(results.skipped, 2);
    }

    #[test]
    fn parses_vitest_summary() {
        let output = lines(" Tests  2 failed | 10 passed (12)");
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.total, 12);
        assert_eq!(results.passed, 10);
        assert_eq!(results.failed, 2);
    }

    #[test]
    fn parses_vitest_summary_passed_only() {
        let output = lines(" Tests  12 passed (12)");
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.total, 12);
        assert_eq!(results.passed, 12);
        assert_eq!(results.failed, 0);
    }

    #[test]
    fn attaches_coverage_from_all_files_row() {
        let output = lines(
            "Tests: 10 passed, 10 total\n\
             ----------|---------|----------|\n\
             All files |   85.71 |    72.00 |",
        );
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.coverage_percent, Some(85.71));
    }

    #[test]
    fn attaches_coverage_from_statements_row() {
        let output = lines(
            "Tests: 10 passed, 10 total\n\
             Statements   : 91.30% ( 42/46 )",
        );
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.coverage_percent, Some(91.30));
    }

    #[test]
    fn later_summary_wins_over_earlier_one() {
        let output = lines(
            "Tests: 3 failed, 12 passed, 15 total\n\
             (re-run after fix)\n\
             Tests: 15 passed, 15 total",
        );
        let results = parse_test_summary(&output).unwrap();
        assert_eq!(results.failed, 0);
        assert_eq!(results.passed, 15);
    }

    #[test]
    fn unparseable_output_yields_none() {
        let output = lines("Compiling...\nDone in 3.2s");
        assert!(parse_test_summary(&output).is_none());
    }

    #[test]
    fn json_block_round_trips() {
        #[derive(Deserialize)]
        struct Payload {
            value: u32,
        }
        let output = lines("noise\n```json\n{ \"value\": 7 }\n```\n");
        let payload: Payload = parse_json_block(&output).unwrap();
        assert_eq!(payload.value, 7);
    }
}
