//! Deployment platform adapters and detection.
//!
//! Railway and Vercel are black boxes behind [`DeployPlatform`]; the
//! orchestrator only triggers deployments, polls status, and asks for
//! rollbacks. Platform detection honours an explicit setting and probes
//! Railway then Vercel when set to `auto`.

mod incident;
mod monitor;
mod railway;
mod smoke;
mod vercel;

pub use incident::{derive_severity, FailureType, IncidentReport, Severity};
pub use monitor::{poll_deployment, MonitorOutcome, MonitorStatus};
pub use railway::RailwayPlatform;
pub use smoke::{parse_smoke_results, ApiCheck, HealthCheck, SmokeTestResults};
pub use vercel::VercelPlatform;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::scrub::scrub;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment platform not configured: {0}")]
    NotConfigured(String),

    #[error("deployment platform API error: {0}")]
    Api(String),

    #[error("unexpected platform response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for DeployError {
    fn from(e: reqwest::Error) -> Self {
        DeployError::Api(scrub(&e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Railway,
    Vercel,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Railway => write!(f, "railway"),
            PlatformKind::Vercel => write!(f, "vercel"),
        }
    }
}

/// Status of a deployment as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Success,
    Failed,
    Crashed,
    Canceled,
    Removed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success
                | DeploymentStatus::Failed
                | DeploymentStatus::Crashed
                | DeploymentStatus::Canceled
                | DeploymentStatus::Removed
        )
    }

    /// Parse the status strings the platforms use.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "queued" | "initializing" | "waiting" => Some(DeploymentStatus::Queued),
            "building" => Some(DeploymentStatus::Building),
            "deploying" | "ready_to_deploy" => Some(DeploymentStatus::Deploying),
            "success" | "ready" => Some(DeploymentStatus::Success),
            "failed" | "error" => Some(DeploymentStatus::Failed),
            "crashed" => Some(DeploymentStatus::Crashed),
            "canceled" | "cancelled" => Some(DeploymentStatus::Canceled),
            "removed" | "deleted" => Some(DeploymentStatus::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Crashed => "crashed",
            DeploymentStatus::Canceled => "canceled",
            DeploymentStatus::Removed => "removed",
        };
        write!(f, "{name}")
    }
}

/// A triggered deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredDeployment {
    pub deployment_id: String,
    pub deployment_url: String,
}

/// One status poll result.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: DeploymentStatus,
    pub logs: Option<String>,
}

#[async_trait]
pub trait DeployPlatform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Whether this platform has a usable connection (token configured and
    /// the API answers).
    async fn probe(&self) -> bool;

    async fn run_migrations(&self, project_id: &str) -> Result<(), DeployError>;

    async fn trigger_deployment(
        &self,
        project_id: &str,
    ) -> Result<TriggeredDeployment, DeployError>;

    async fn deployment_status(&self, deployment_id: &str) -> Result<StatusReport, DeployError>;

    async fn rollback(&self, deployment_id: &str) -> Result<(), DeployError>;
}

/// Pick the platform to deploy to. An explicit setting is honoured;
/// `auto` probes the candidates in order (Railway first). `None` means no
/// platform is available and the deployment must fail terminally.
pub async fn detect_platform(
    setting: &str,
    candidates: &[std::sync::Arc<dyn DeployPlatform>],
) -> Option<std::sync::Arc<dyn DeployPlatform>> {
    match setting {
        "railway" => candidates
            .iter()
            .find(|p| p.kind() == PlatformKind::Railway)
            .cloned(),
        "vercel" => candidates
            .iter()
            .find(|p| p.kind() == PlatformKind::Vercel)
            .cloned(),
        _ => {
            for platform in candidates {
                if platform.probe().await {
                    info!(platform = %platform.kind(), "Detected deployment platform");
                    return Some(platform.clone());
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_match_platform_contract() {
        for status in [
            DeploymentStatus::Success,
            DeploymentStatus::Failed,
            DeploymentStatus::Crashed,
            DeploymentStatus::Canceled,
            DeploymentStatus::Removed,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            DeploymentStatus::Queued,
            DeploymentStatus::Building,
            DeploymentStatus::Deploying,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn parses_platform_status_strings() {
        assert_eq!(
            DeploymentStatus::parse("SUCCESS"),
            Some(DeploymentStatus::Success)
        );
        assert_eq!(
            DeploymentStatus::parse("ready"),
            Some(DeploymentStatus::Success)
        );
        assert_eq!(
            DeploymentStatus::parse("CRASHED"),
            Some(DeploymentStatus::Crashed)
        );
        assert_eq!(DeploymentStatus::parse("who-knows"), None);
    }
}
