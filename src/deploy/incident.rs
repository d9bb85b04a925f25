//! Incident reports for deployment-side failures.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    DeploymentFailed,
    SmokeTestsFailed,
    Timeout,
}

/// Structured post-mortem emitted whenever a deployment fails or its smoke
/// tests do not pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentReport {
    pub story_id: Option<String>,
    pub severity: Severity,
    pub failure_type: FailureType,
    pub root_cause: String,
    pub rollback_performed: bool,
    pub rollback_successful: bool,
    pub resolution: String,
    pub recommendations: Vec<String>,
}

/// Severity rules: a rollback that was attempted but failed is critical;
/// deployment failures and timeouts are high; everything else (smoke-test
/// failures with a clean rollback) is medium.
pub fn derive_severity(
    failure_type: FailureType,
    rollback_performed: bool,
    rollback_successful: bool,
) -> Severity {
    if rollback_performed && !rollback_successful {
        return Severity::Critical;
    }
    match failure_type {
        FailureType::DeploymentFailed | FailureType::Timeout => Severity::High,
        FailureType::SmokeTestsFailed => Severity::Medium,
    }
}
