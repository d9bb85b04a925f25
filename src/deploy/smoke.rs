//! Smoke-test result extraction.
//!
//! The smoke-test CLI session prints a fenced ```json block containing
//! `{healthCheck, apiChecks[]}`. The run passes only when the health check
//! and every API check passed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub passed: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmokeTestResults {
    pub health_check: HealthCheck,
    #[serde(default)]
    pub api_checks: Vec<ApiCheck>,
}

impl SmokeTestResults {
    pub fn passed(&self) -> bool {
        self.health_check.passed && self.api_checks.iter().all(|check| check.passed)
    }
}

/// Find the first fenced ```json block in the session output and parse it.
pub fn parse_smoke_results(lines: &[String]) -> Option<SmokeTestResults> {
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
            if let Ok(results) = serde_json::from_str::<SmokeTestResults>(&block) {
                return Some(results);
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
    fn parses_passing_smoke_block() {
        let output = lines(
            r#"
running smoke tests against https://app.example
```json
{
  "healthCheck": { "passed": true, "endpoint": "/health", "statusCode": 200 },
  "apiChecks": [
    { "name": "login", "passed": true },
    { "name": "projects", "passed": true }
  ]
}
```
done
"#,
        );
        let results = parse_smoke_results(&output).unwrap();
        assert!(results.passed());
        assert_eq!(results.api_checks.len(), 2);
    }

    #[test]
    fn one_failing_api_check_fails_the_run() {
        let output = lines(
            r#"```json
{
  "healthCheck": { "passed": true },
  "apiChecks": [
    { "name": "login", "passed": true },
    { "name": "projects", "passed": false, "detail": "500" }
  ]
}
```"#,
        );
        let results = parse_smoke_results(&output).unwrap();
        assert!(!results.passed());
    }

    #[test]
    fn failing_health_check_fails_the_run() {
        let output = lines(
            r#"```json
{ "healthCheck": { "passed": false }, "apiChecks": [] }
```"#,
        );
        let results = parse_smoke_results(&output).unwrap();
        assert!(!results.passed());
    }

    #[test]
    fn output_without_json_block_yields_none() {
        let output = lines("no block here\njust logs\n");
        assert!(parse_smoke_results(&output).is_none());
    }

    #[test]
    fn malformed_block_is_skipped_and_later_block_parsed() {
        let output = lines(
            r#"```json
{ not json }
```
```json
{ "healthCheck": { "passed": true }, "apiChecks": [] }
```"#,
        );
        let results = parse_smoke_results(&output).unwrap();
        assert!(results.passed());
    }
}
