//! DevOps executor: merge the approved PR, deploy, watch the deployment,
//! smoke-test it, and roll back with an incident report when anything on
//! the deployment side goes wrong.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{
    await_session, AgentArtifacts, AgentExecutor, AgentResult, DevOpsArtifacts, ExecutorDeps,
    FailureKind, ProgressReporter, Verdict,
};
use crate::deploy::{
    derive_severity, detect_platform, parse_smoke_results, poll_deployment, DeployPlatform,
    FailureType, IncidentReport, MonitorStatus, SmokeTestResults, TriggeredDeployment,
};
use crate::github::{GitHubGatewayError, MergeStrategy};
use crate::pipeline::PipelineState;
use crate::queue::Job;
use crate::supervisor::{AgentType, SessionExit, SpawnParams};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevOpsPayload {
    story_id: String,
    pr_number: u64,
    verdict: Verdict,
    git_repo_url: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

/// What went wrong on the deployment side, before the incident report is
/// assembled.
enum DeployFailure {
    Deployment { root_cause: String },
    SmokeTests { root_cause: String },
    Timeout,
}

pub struct DevOpsExecutor {
    deps: Arc<ExecutorDeps>,
}

impl DevOpsExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    fn smoke_prompt(deployment_url: &str) -> String {
        format!(
            "Run smoke tests against the deployment at {deployment_url}: check the health \
             endpoint and the core API routes. Print the results as a fenced json block \
             with fields healthCheck {{passed, endpoint, statusCode}} and apiChecks \
             [{{name, passed, detail}}].\n"
        )
    }
}

#[async_trait]
impl AgentExecutor for DevOpsExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Devops
    }

    async fn execute(&self, job: &Job) -> AgentResult {
        let started = Instant::now();
        let deps = &self.deps;

        let payload: DevOpsPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return AgentResult::failure(
                    FailureKind::Fatal,
                    format!("invalid devops job payload: {e}"),
                    None,
                    started.elapsed().as_millis() as u64,
                )
            }
        };

        // Deployments require a clean QA verdict; anything else is refused
        // before any side effect.
        if payload.verdict != Verdict::Pass {
            return AgentResult::failure(
                FailureKind::Fatal,
                format!("Deployment skipped: QA verdict is {}", payload.verdict),
                None,
                started.elapsed().as_millis() as u64,
            );
        }

        let agent_id = payload
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("devops-{}", payload.story_id));

        let mut progress = ProgressReporter::new(
            deps.events.clone(),
            AgentType::Devops,
            &job.workspace_id,
            Some(&payload.story_id),
        );

        if let Err((kind, reason)) = super::claim_pipeline(
            deps,
            &job.project_id,
            &job.workspace_id,
            AgentType::Devops,
            &agent_id,
            Some(&payload.story_id),
            Some((PipelineState::Deploying, "devops job started")),
        )
        .await
        {
            return AgentResult::failure(
                kind,
                reason,
                None,
                started.elapsed().as_millis() as u64,
            );
        }

        let result = self.run(job, &payload, &agent_id, &mut progress, started).await;
        super::release_pipeline(deps, &job.project_id).await;
        result
    }
}

impl DevOpsExecutor {
    async fn run(
        &self,
        job: &Job,
        payload: &DevOpsPayload,
        agent_id: &str,
        progress: &mut ProgressReporter,
        started: Instant,
    ) -> AgentResult {
        let deps = &self.deps;
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        // Merge the approved PR. Conflicts and branch protection are
        // terminal here: nothing was deployed, nothing to roll back.
        progress.started("merging-pr", 10);
        let github = match deps.github.for_repo(&payload.git_repo_url) {
            Ok(github) => github,
            Err(e) => {
                progress.failed("merging-pr", 10, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    None,
                    elapsed(started),
                );
            }
        };
        let merge_commit_hash = match github
            .merge_pr(payload.pr_number, MergeStrategy::Squash)
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                progress.failed("merging-pr", 10, &e.to_string());
                let kind = match &e {
                    GitHubGatewayError::MergeConflict(_)
                    | GitHubGatewayError::BranchProtectionViolation(_) => FailureKind::Fatal,
                    _ => FailureKind::Transient,
                };
                return AgentResult::failure(kind, e.to_string(), None, elapsed(started));
            }
        };
        progress.completed("merging-pr", 10);

        progress.started("detecting-platform", 20);
        let setting = payload
            .platform
            .clone()
            .unwrap_or_else(|| deps.config.deploy_platform.clone());
        let platform = match detect_platform(&setting, &deps.platforms).await {
            Some(platform) => platform,
            None => {
                progress.failed("detecting-platform", 20, "no deployment platform available");
                return AgentResult::failure(
                    FailureKind::Fatal,
                    "NoDeploymentPlatform: no configured platform responded",
                    None,
                    elapsed(started),
                );
            }
        };
        progress.completed("detecting-platform", 20);

        progress.started("running-migrations", 30);
        if let Err(e) = platform.run_migrations(&job.project_id).await {
            progress.failed("running-migrations", 30, &e.to_string());
            return self
                .fail_with_incident(
                    payload,
                    progress,
                    platform.as_ref(),
                    None,
                    Some(merge_commit_hash),
                    None,
                    DeployFailure::Deployment {
                        root_cause: format!("migrations failed: {e}"),
                    },
                    false,
                    started,
                )
                .await;
        }
        progress.completed("running-migrations", 30);

        progress.started("triggering-deployment", 40);
        let deployment = match platform.trigger_deployment(&job.project_id).await {
            Ok(deployment) => deployment,
            Err(e) => {
                progress.failed("triggering-deployment", 40, &e.to_string());
                return self
                    .fail_with_incident(
                        payload,
                        progress,
                        platform.as_ref(),
                        None,
                        Some(merge_commit_hash),
                        None,
                        DeployFailure::Deployment {
                            root_cause: format!("deployment trigger failed: {e}"),
                        },
                        false,
                        started,
                    )
                    .await;
            }
        };
        progress.completed("triggering-deployment", 40);
        info!(
            story_id = %payload.story_id,
            deployment_id = %deployment.deployment_id,
            platform = %platform.kind(),
            "Deployment triggered"
        );

        progress.started("monitoring-deployment", 60);
        let monitor = poll_deployment(
            platform.as_ref(),
            &deployment.deployment_id,
            Duration::from_secs(deps.config.deploy_monitor_interval_seconds),
            Duration::from_secs(deps.config.deploy_monitor_timeout_seconds),
        )
        .await;
        match &monitor.status {
            MonitorStatus::Succeeded => {
                progress.completed("monitoring-deployment", 60);
            }
            MonitorStatus::Failed(status) => {
                let root_cause = monitor
                    .build_logs
                    .clone()
                    .unwrap_or_else(|| format!("deployment reached status {status}"));
                progress.failed("monitoring-deployment", 60, &root_cause);
                return self
                    .fail_with_incident(
                        payload,
                        progress,
                        platform.as_ref(),
                        Some(&deployment),
                        Some(merge_commit_hash),
                        None,
                        DeployFailure::Deployment { root_cause },
                        true,
                        started,
                    )
                    .await;
            }
            MonitorStatus::TimedOut => {
                progress.failed(
                    "monitoring-deployment",
                    60,
                    "deployment did not reach a terminal status in time",
                );
                return self
                    .fail_with_incident(
                        payload,
                        progress,
                        platform.as_ref(),
                        Some(&deployment),
                        Some(merge_commit_hash),
                        None,
                        DeployFailure::Timeout,
                        true,
                        started,
                    )
                    .await;
            }
        }

        progress.started("running-smoke-tests", 80);
        let smoke = self
            .run_smoke_tests(job, payload, agent_id, &deployment, progress)
            .await;
        match smoke {
            Ok(results) if results.passed() => {
                progress.completed("running-smoke-tests", 80);

                progress.started("updating-status", 100);
                let result = AgentResult::success(
                    AgentArtifacts::Devops(DevOpsArtifacts {
                        merge_commit_hash: Some(merge_commit_hash),
                        deployment_id: Some(deployment.deployment_id.clone()),
                        deployment_url: Some(deployment.deployment_url.clone()),
                        platform: Some(platform.kind()),
                        smoke_test_results: Some(results),
                        rollback_performed: false,
                        incident_report: None,
                    }),
                    None,
                    elapsed(started),
                );
                progress.completed("updating-status", 100);
                result
            }
            Ok(results) => {
                progress.failed("running-smoke-tests", 80, "smoke tests did not pass");
                self.fail_with_incident(
                    payload,
                    progress,
                    platform.as_ref(),
                    Some(&deployment),
                    Some(merge_commit_hash),
                    Some(results),
                    DeployFailure::SmokeTests {
                        root_cause: "smoke tests reported failures".to_string(),
                    },
                    true,
                    started,
                )
                .await
            }
            Err(reason) => {
                progress.failed("running-smoke-tests", 80, &reason);
                self.fail_with_incident(
                    payload,
                    progress,
                    platform.as_ref(),
                    Some(&deployment),
                    Some(merge_commit_hash),
                    None,
                    DeployFailure::SmokeTests { root_cause: reason },
                    true,
                    started,
                )
                .await
            }
        }
    }

    /// Smoke tests run as a bounded CLI session against the deployment URL.
    async fn run_smoke_tests(
        &self,
        job: &Job,
        payload: &DevOpsPayload,
        agent_id: &str,
        deployment: &TriggeredDeployment,
        progress: &mut ProgressReporter,
    ) -> Result<SmokeTestResults, String> {
        let deps = &self.deps;
        let ticket = deps
            .supervisor
            .clone()
            .spawn(SpawnParams {
                workspace_id: job.workspace_id.clone(),
                project_id: job.project_id.clone(),
                agent_id: agent_id.to_string(),
                agent_type: AgentType::Devops,
                prompt: Self::smoke_prompt(&deployment.deployment_url),
                story_id: Some(payload.story_id.clone()),
                git_repo_url: payload.git_repo_url.clone(),
                pipeline_snapshot: serde_json::json!({
                    "deploymentUrl": deployment.deployment_url,
                    "deploymentId": deployment.deployment_id,
                }),
            })
            .await
            .map_err(|e| format!("smoke test session spawn failed: {e}"))?;
        progress.set_session(&ticket.session_id);
        deps.queue.register_session(&job.id, &ticket.session_id);
        let session_id = ticket.session_id.clone();

        let budget = Duration::from_secs(deps.config.smoke_test_timeout_seconds);
        let run = tokio::time::timeout(
            budget,
            await_session(
                &deps.supervisor,
                ticket,
                Duration::from_secs(deps.config.session_stall_seconds),
            ),
        )
        .await;

        let run = match run {
            Ok(run) => run,
            Err(_) => {
                let _ = deps
                    .supervisor
                    .terminate(&session_id, "smoke test ceiling exceeded")
                    .await;
                return Err(format!(
                    "smoke tests exceeded their {}s ceiling",
                    budget.as_secs()
                ));
            }
        };

        if let SessionExit::Failed { reason, .. } = &run.exit {
            return Err(format!("smoke test session failed: {reason}"));
        }

        let output = deps
            .supervisor
            .buffers()
            .get_buffered_output(&run.session_id)
            .await
            .unwrap_or_default();
        parse_smoke_results(&output)
            .ok_or_else(|| "smoke test session produced no results block".to_string())
    }

    /// Rollback (when something was deployed) and assemble the incident
    /// report. Always returns a failed result carrying the report.
    #[allow(clippy::too_many_arguments)]
    async fn fail_with_incident(
        &self,
        payload: &DevOpsPayload,
        progress: &mut ProgressReporter,
        platform: &dyn DeployPlatform,
        deployment: Option<&TriggeredDeployment>,
        merge_commit_hash: Option<String>,
        smoke_results: Option<SmokeTestResults>,
        failure: DeployFailure,
        attempt_rollback: bool,
        started: Instant,
    ) -> AgentResult {
        let elapsed = started.elapsed().as_millis() as u64;

        let (mut rollback_performed, mut rollback_successful) = (false, false);
        if attempt_rollback {
            if let Some(deployment) = deployment {
                progress.started("handling-rollback", 90);
                rollback_performed = true;
                match platform.rollback(&deployment.deployment_id).await {
                    Ok(()) => {
                        rollback_successful = true;
                        progress.completed("handling-rollback", 90);
                    }
                    Err(e) => {
                        warn!(
                            deployment_id = %deployment.deployment_id,
                            error = %e,
                            "Rollback failed"
                        );
                        progress.failed("handling-rollback", 90, &e.to_string());
                    }
                }
            }
        }

        progress.started("creating-incident-report", 95);
        let (failure_type, root_cause) = match failure {
            DeployFailure::Deployment { root_cause } => {
                (FailureType::DeploymentFailed, root_cause)
            }
            DeployFailure::SmokeTests { root_cause } => (FailureType::SmokeTestsFailed, root_cause),
            DeployFailure::Timeout => (
                FailureType::Timeout,
                "deployment monitor hit its ceiling without a terminal status".to_string(),
            ),
        };
        let severity = derive_severity(failure_type, rollback_performed, rollback_successful);
        let resolution = if rollback_successful {
            "previous revision restored by platform rollback".to_string()
        } else if rollback_performed {
            "rollback attempted and failed; manual intervention required".to_string()
        } else {
            "no rollback performed".to_string()
        };
        let report = IncidentReport {
            story_id: Some(payload.story_id.clone()),
            severity,
            failure_type,
            root_cause: crate::scrub::scrub(&root_cause),
            rollback_performed,
            rollback_successful,
            resolution,
            recommendations: vec![
                "inspect the build and deployment logs".to_string(),
                "re-run the story once the root cause is addressed".to_string(),
            ],
        };
        progress.completed("creating-incident-report", 95);

        let error = format!(
            "deployment failed ({failure_type:?}): {}",
            report.root_cause
        );
        AgentResult {
            success: false,
            session_id: None,
            duration_ms: elapsed,
            error: Some(error),
            failure_kind: Some(FailureKind::Fatal),
            artifacts: Some(AgentArtifacts::Devops(DevOpsArtifacts {
                merge_commit_hash,
                deployment_id: deployment.map(|d| d.deployment_id.clone()),
                deployment_url: deployment.map(|d| d.deployment_url.clone()),
                platform: Some(platform.kind()),
                smoke_test_results: smoke_results,
                rollback_performed,
                incident_report: Some(report),
            })),
        }
    }
}
