//! Deployment monitor: poll until a terminal status or the time ceiling.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DeployPlatform, DeploymentStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStatus {
    Succeeded,
    Failed(DeploymentStatus),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub status: MonitorStatus,
    pub build_logs: Option<String>,
}

/// Poll `deployment_status` every `interval` until the deployment reaches a
/// terminal status, or report `TimedOut` once `ceiling` has elapsed.
/// Transient status errors do not abort the poll; the ceiling bounds them.
pub async fn poll_deployment(
    platform: &dyn DeployPlatform,
    deployment_id: &str,
    interval: Duration,
    ceiling: Duration,
) -> MonitorOutcome {
    let started = Instant::now();
    loop {
        match platform.deployment_status(deployment_id).await {
            Ok(report) => {
                debug!(
                    deployment_id = %deployment_id,
                    status = %report.status,
                    "Deployment status poll"
                );
                if report.status.is_terminal() {
                    let status = if report.status == DeploymentStatus::Success {
                        MonitorStatus::Succeeded
                    } else {
                        MonitorStatus::Failed(report.status)
                    };
                    return MonitorOutcome {
                        status,
                        build_logs: report.logs,
                    };
                }
            }
            Err(e) => {
                warn!(
                    deployment_id = %deployment_id,
                    error = %e,
                    "Deployment status poll failed, will retry"
                );
            }
        }

        if started.elapsed() + interval > ceiling {
            return MonitorOutcome {
                status: MonitorStatus::TimedOut,
                build_logs: None,
            };
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DeployError, PlatformKind, StatusReport, TriggeredDeployment};
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedPlatform {
        statuses: Vec<DeploymentStatus>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl DeployPlatform for ScriptedPlatform {
        fn kind(&self) -> PlatformKind {
            PlatformKind::Railway
        }

        async fn probe(&self) -> bool {
            true
        }

        async fn run_migrations(&self, _project_id: &str) -> Result<(), DeployError> {
            Ok(())
        }

        async fn trigger_deployment(
            &self,
            _project_id: &str,
        ) -> Result<TriggeredDeployment, DeployError> {
            Ok(TriggeredDeployment {
                deployment_id: "dep-1".to_string(),
                deployment_url: "https://app.example".to_string(),
            })
        }

        async fn deployment_status(
            &self,
            _deployment_id: &str,
        ) -> Result<StatusReport, DeployError> {
            let index = self.polls.fetch_add(1, Ordering::SeqCst);
            let status = self
                .statuses
                .get(index)
                .copied()
                .unwrap_or(*self.statuses.last().unwrap());
            Ok(StatusReport {
                status,
                logs: if status == DeploymentStatus::Failed {
                    Some("Build error: missing dependency".to_string())
                } else {
                    None
                },
            })
        }

        async fn rollback(&self, _deployment_id: &str) -> Result<(), DeployError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn polls_until_success() {
        let platform = ScriptedPlatform {
            statuses: vec![
                DeploymentStatus::Queued,
                DeploymentStatus::Building,
                DeploymentStatus::Success,
            ],
            polls: AtomicUsize::new(0),
        };
        let outcome = poll_deployment(
            &platform,
            "dep-1",
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome.status, MonitorStatus::Succeeded);
        assert_eq!(platform.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_deployment_carries_build_logs() {
        let platform = ScriptedPlatform {
            statuses: vec![DeploymentStatus::Building, DeploymentStatus::Failed],
            polls: AtomicUsize::new(0),
        };
        let outcome = poll_deployment(
            &platform,
            "dep-1",
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(
            outcome.status,
            MonitorStatus::Failed(DeploymentStatus::Failed)
        );
        assert_eq!(
            outcome.build_logs.as_deref(),
            Some("Build error: missing dependency")
        );
    }

    #[tokio::test]
    async fn never_terminal_times_out_at_the_ceiling() {
        let platform = ScriptedPlatform {
            statuses: vec![DeploymentStatus::Building],
            polls: AtomicUsize::new(0),
        };
        let outcome = poll_deployment(
            &platform,
            "dep-1",
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(outcome.status, MonitorStatus::TimedOut);
    }
}
