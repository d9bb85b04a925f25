//! Agent executors: bounded workflows that compose the supervisor, the Git
//! and GitHub gateways, and the deploy adapters into one agent run.
//!
//! Executors never propagate errors to callers: every failure is converted
//! into an [`AgentResult`] with `success == false` and a failure kind that
//! tells the dispatcher whether the job should be retried. Cleanup (stop
//! monitoring, stop streaming, release the pipeline claim) runs on every
//! exit path inside the supervisor and the executor template.

mod dev;
mod devops;
mod planner;
mod qa;
pub mod test_report;

pub use dev::DevExecutor;
pub use devops::DevOpsExecutor;
pub use planner::{
    update_sprint_status, PlannedStory, PlannerExecutor, SprintStatus, StoryEntry,
    SPRINT_STATUS_PATH,
};
pub use qa::{CriterionResult, FindingSeverity, QaExecutor, QaReport, SecurityFinding};
pub use test_report::TestResults;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::deploy::{DeployPlatform, IncidentReport, PlatformKind, SmokeTestResults};
use crate::events::{Event, EventBus, ProgressEvent, StepStatus};
use crate::github::{GitHubGateway, GitHubGatewayError, GitHubOps};
use crate::gitops::GitGateway;
use crate::pipeline::PipelineStateMachine;
use crate::queue::{Job, JobQueue};
use crate::supervisor::{AgentType, ProcessSupervisor, SessionExit, SessionTicket};

/// QA's terminal classification of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "NEEDS_CHANGES")]
    NeedsChanges,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::NeedsChanges => "NEEDS_CHANGES",
        };
        write!(f, "{name}")
    }
}

/// How a failed run should be treated by the queue and the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// CLI exit/stall/timeout: retried within the job's attempt budget.
    Cli,
    /// External I/O failure: retried within the attempt budget.
    Transient,
    /// Broken invariant: never retried, pipeline fails.
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevArtifacts {
    pub branch: String,
    pub commit_hash: String,
    pub pr_url: String,
    pub pr_number: u64,
    pub test_results: TestResults,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaArtifacts {
    pub verdict: Verdict,
    pub report: QaReport,
    pub additional_tests_written: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerArtifacts {
    pub documents_generated: Vec<String>,
    pub stories_created: Vec<String>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevOpsArtifacts {
    pub merge_commit_hash: Option<String>,
    pub deployment_id: Option<String>,
    pub deployment_url: Option<String>,
    pub platform: Option<PlatformKind>,
    pub smoke_test_results: Option<SmokeTestResults>,
    pub rollback_performed: bool,
    pub incident_report: Option<IncidentReport>,
}

/// Agent-specific result payload, tagged by agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "agentType", rename_all = "lowercase")]
pub enum AgentArtifacts {
    Planner(PlannerArtifacts),
    Dev(DevArtifacts),
    Qa(QaArtifacts),
    Devops(DevOpsArtifacts),
}

/// The one result shape every executor returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub success: bool,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub artifacts: Option<AgentArtifacts>,
}

impl AgentResult {
    pub fn failure(
        kind: FailureKind,
        error: impl Into<String>,
        session_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            session_id,
            duration_ms,
            error: Some(crate::scrub::scrub(&error.into())),
            failure_kind: Some(kind),
            artifacts: None,
        }
    }

    pub fn success(
        artifacts: AgentArtifacts,
        session_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: true,
            session_id,
            duration_ms,
            error: None,
            failure_kind: None,
            artifacts: Some(artifacts),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Builds a GitHub gateway for a project's repository. A trait so tests can
/// substitute mocks.
pub trait GitHubFactory: Send + Sync {
    fn for_repo(&self, repo_url: &str) -> Result<Arc<dyn GitHubOps>, GitHubGatewayError>;
}

pub struct TokenGitHubFactory;

impl GitHubFactory for TokenGitHubFactory {
    fn for_repo(&self, repo_url: &str) -> Result<Arc<dyn GitHubOps>, GitHubGatewayError> {
        let token = std::env::var("GIT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GitHubGatewayError::Api("GIT_TOKEN is not set in the environment".to_string())
            })?;
        Ok(Arc::new(GitHubGateway::from_repo_url(token, repo_url)?))
    }
}

/// Shared dependencies handed to every executor by the composition root.
pub struct ExecutorDeps {
    pub config: Arc<OrchestratorConfig>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub git: GitGateway,
    pub github: Arc<dyn GitHubFactory>,
    pub platforms: Vec<Arc<dyn DeployPlatform>>,
    pub pipeline: Arc<PipelineStateMachine>,
    pub queue: Arc<JobQueue>,
    pub events: EventBus,
}

/// Emits `<agent>-agent:progress` events. Each workflow step is announced
/// exactly once as started and exactly once as completed or failed.
pub struct ProgressReporter {
    events: EventBus,
    agent_type: AgentType,
    workspace_id: String,
    story_id: Option<String>,
    session_id: Option<String>,
}

impl ProgressReporter {
    pub fn new(
        events: EventBus,
        agent_type: AgentType,
        workspace_id: &str,
        story_id: Option<&str>,
    ) -> Self {
        Self {
            events,
            agent_type,
            workspace_id: workspace_id.to_string(),
            story_id: story_id.map(|s| s.to_string()),
            session_id: None,
        }
    }

    pub fn set_session(&mut self, session_id: &str) {
        self.session_id = Some(session_id.to_string());
    }

    fn emit(&self, step: &str, status: StepStatus, percentage: u8, details: Option<String>) {
        self.events.publish(Event::Progress(ProgressEvent {
            agent_type: self.agent_type,
            session_id: self.session_id.clone(),
            story_id: self.story_id.clone(),
            workspace_id: self.workspace_id.clone(),
            step: step.to_string(),
            status,
            details,
            percentage,
            timestamp: Utc::now(),
        }));
    }

    pub fn started(&self, step: &str, percentage: u8) {
        self.emit(step, StepStatus::Started, percentage, None);
    }

    pub fn completed(&self, step: &str, percentage: u8) {
        self.emit(step, StepStatus::Completed, percentage, None);
    }

    pub fn failed(&self, step: &str, percentage: u8, details: &str) {
        self.emit(
            step,
            StepStatus::Failed,
            percentage,
            Some(crate::scrub::scrub(details)),
        );
    }
}

/// Outcome of awaiting a CLI session with stall handling.
pub struct SessionRun {
    pub session_id: String,
    pub exit: SessionExit,
    pub stalled: bool,
}

/// Await a spawned session: resolves on the session outcome, terminating
/// the session first if the health monitor flags a stall.
pub async fn await_session(
    supervisor: &Arc<ProcessSupervisor>,
    ticket: SessionTicket,
    stall_threshold: Duration,
) -> SessionRun {
    let SessionTicket {
        session_id,
        mut outcome,
        mut stalled,
        ..
    } = ticket;

    let mut was_stalled = false;
    let mut watch_open = true;
    loop {
        tokio::select! {
            exit = &mut outcome => {
                let exit = exit.unwrap_or(SessionExit::Failed {
                    exit_code: None,
                    reason: "session outcome channel dropped".to_string(),
                    output_line_count: 0,
                });
                return SessionRun { session_id, exit, stalled: was_stalled };
            }
            changed = stalled.changed(), if !was_stalled && watch_open => {
                if changed.is_err() {
                    // Monitor stopped; keep waiting for the outcome.
                    watch_open = false;
                    continue;
                }
                if *stalled.borrow() {
                    was_stalled = true;
                    let reason = format!(
                        "stalled after {} minutes",
                        stall_threshold.as_secs() / 60
                    );
                    let _ = supervisor.terminate(&session_id, &reason).await;
                }
            }
        }
    }
}

/// An agent executor: runs one job end to end and reports a typed result.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn agent_type(&self) -> AgentType;

    /// Never returns an error: all failures are encoded in the result.
    async fn execute(&self, job: &Job) -> AgentResult;
}

/// Claim the pipeline for this agent and, when the run opens a new phase,
/// apply the "job started" transition. A busy context refuses the start; a
/// run resumed after a retry finds the pipeline already in the target state
/// and skips the transition.
pub(crate) async fn claim_pipeline(
    deps: &ExecutorDeps,
    project_id: &str,
    workspace_id: &str,
    agent_type: AgentType,
    agent_id: &str,
    story_id: Option<&str>,
    enter: Option<(crate::pipeline::PipelineState, &str)>,
) -> Result<(), (FailureKind, String)> {
    let workflow_id = format!("bmad-{project_id}");
    deps.pipeline
        .ensure_context(project_id, workspace_id, &workflow_id)
        .await
        .map_err(|e| (FailureKind::Transient, e.to_string()))?;

    deps.pipeline
        .begin_agent(project_id, agent_type, agent_id, story_id)
        .await
        .map_err(|e| match e {
            crate::pipeline::PipelineError::Busy { .. } => {
                (FailureKind::Transient, e.to_string())
            }
            other => (FailureKind::Fatal, other.to_string()),
        })?;

    if let Some((target, trigger)) = enter {
        let current = deps
            .pipeline
            .get(project_id)
            .await
            .map_err(|e| (FailureKind::Transient, e.to_string()))?
            .map(|ctx| ctx.current_state);
        if current != Some(target) {
            deps.pipeline
                .transition(project_id, target, trigger, serde_json::json!({}))
                .await
                .map_err(|e| match e {
                    crate::pipeline::PipelineError::Store(inner) => {
                        (FailureKind::Transient, inner.to_string())
                    }
                    other => (FailureKind::Fatal, other.to_string()),
                })?;
        }
    }
    Ok(())
}

/// Release the active-agent claim. Runs on every executor exit path.
pub(crate) async fn release_pipeline(deps: &ExecutorDeps, project_id: &str) {
    let _ = deps.pipeline.clear_agent(project_id).await;
}
