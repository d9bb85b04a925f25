//! DevOps executor scenarios with a mocked platform and GitHub seam: the
//! QA-verdict precondition, deployment failure with rollback and incident
//! report, and a full deploy with passing smoke tests.

#![cfg(unix)]

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devos_orchestrator::config::OrchestratorConfig;
use devos_orchestrator::deploy::{
    DeployError, DeployPlatform, DeploymentStatus, FailureType, PlatformKind, Severity,
    StatusReport, TriggeredDeployment,
};
use devos_orchestrator::events::EventBus;
use devos_orchestrator::executors::{
    AgentArtifacts, AgentExecutor, DevOpsExecutor, ExecutorDeps, GitHubFactory,
};
use devos_orchestrator::github::{
    GitHubGatewayError, GitHubOps, MergeStrategy, PrInfo, ReviewEvent,
};
use devos_orchestrator::gitops::GitGateway;
use devos_orchestrator::pipeline::{PipelineState, PipelineStateMachine};
use devos_orchestrator::queue::{Job, JobQueue, JobType, NewJob, QueueConfig};
use devos_orchestrator::store::{EphemeralStore, FileJobStore, FilePipelineStore};
use devos_orchestrator::supervisor::{
    OutputBufferRegistry, ProcessSupervisor, SessionHealthMonitor, SupervisorConfig,
    WorkspaceManager,
};
use tokio::sync::mpsc;

struct MockGitHub {
    merge_called: AtomicBool,
}

#[async_trait]
impl GitHubOps for MockGitHub {
    async fn create_pr_idempotent(
        &self,
        _head_branch: &str,
        _base_branch: &str,
        _title: &str,
        _body: &str,
    ) -> Result<PrInfo, GitHubGatewayError> {
        unreachable!("devops never creates PRs")
    }

    async fn find_open_pr_for_branch(
        &self,
        _head_branch: &str,
    ) -> Result<Option<PrInfo>, GitHubGatewayError> {
        Ok(None)
    }

    async fn add_labels(&self, _pr_number: u64, _labels: &[String]) {}

    async fn merge_pr(
        &self,
        _pr_number: u64,
        strategy: MergeStrategy,
    ) -> Result<String, GitHubGatewayError> {
        assert_eq!(strategy, MergeStrategy::Squash);
        self.merge_called.store(true, Ordering::SeqCst);
        Ok("merge-abc".to_string())
    }

    async fn submit_review(
        &self,
        _pr_number: u64,
        _event: ReviewEvent,
        _body: &str,
    ) -> Result<(), GitHubGatewayError> {
        Ok(())
    }
}

struct MockGitHubFactory {
    github: Arc<MockGitHub>,
}

impl GitHubFactory for MockGitHubFactory {
    fn for_repo(&self, _repo_url: &str) -> Result<Arc<dyn GitHubOps>, GitHubGatewayError> {
        Ok(self.github.clone())
    }
}

struct MockPlatform {
    final_status: DeploymentStatus,
    rollback_called: AtomicBool,
}

#[async_trait]
impl DeployPlatform for MockPlatform {
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

    async fn deployment_status(&self, _deployment_id: &str) -> Result<StatusReport, DeployError> {
        Ok(StatusReport {
            status: self.final_status,
            logs: if self.final_status == DeploymentStatus::Failed {
                Some("Build error: missing dependency".to_string())
            } else {
                None
            },
        })
    }

    async fn rollback(&self, _deployment_id: &str) -> Result<(), DeployError> {
        self.rollback_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    executor: DevOpsExecutor,
    github: Arc<MockGitHub>,
    platform: Arc<MockPlatform>,
    pipeline: Arc<PipelineStateMachine>,
    origin_url: String,
    _root: tempfile::TempDir,
}

/// Build an executor whose CLI is a script printing the given smoke output.
fn fixture(final_status: DeploymentStatus, smoke_script: &str) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let origin = common::init_origin_repo(root.path());
    let cli_path = common::write_cli_script(&root.path().join("agent-cli.sh"), smoke_script);

    let mut config = OrchestratorConfig::default();
    config.workspace_root = root.path().join("workspaces");
    config.cli_binary_path = cli_path;
    config.job_queue_backend_url = root.path().join("jobs").display().to_string();
    config.pipeline_state_backend_url = root.path().join("pipeline").display().to_string();
    config.output_buffer_backend_url = root.path().join("output").display().to_string();
    config.deploy_monitor_interval_seconds = 0;
    config.deploy_monitor_timeout_seconds = 5;
    config.smoke_test_timeout_seconds = 30;
    let config = Arc::new(config);

    let events = EventBus::default();
    let pipeline = Arc::new(PipelineStateMachine::new(
        Arc::new(FilePipelineStore::new(root.path().join("pipeline"))),
        events.clone(),
        3,
    ));
    let queue = Arc::new(JobQueue::new(
        Arc::new(FileJobStore::new(root.path().join("jobs"))),
        QueueConfig {
            workers: 0,
            ..QueueConfig::default()
        },
    ));

    let git = GitGateway::new(
        "DevOS Agent".to_string(),
        "agent@devos.ai".to_string(),
        "main".to_string(),
        None,
        Duration::from_secs(120),
        Duration::from_secs(30),
    );
    let ephemeral = Arc::new(EphemeralStore::new(
        root.path().join("output"),
        Duration::from_secs(3600),
    ));
    let buffers = Arc::new(OutputBufferRegistry::new(ephemeral.clone(), 10_000));
    let (terminate_tx, terminate_rx) = mpsc::channel(8);
    let health = Arc::new(SessionHealthMonitor::new(
        Duration::from_secs(60),
        Duration::from_secs(120),
        Duration::from_millis(50),
        events.clone(),
        terminate_tx,
    ));
    let supervisor = Arc::new(ProcessSupervisor::new(
        SupervisorConfig {
            cli_binary_path: config.cli_binary_path.clone(),
            hard_timeout: Duration::from_secs(120),
            terminate_grace: Duration::from_millis(200),
            git_author_name: "DevOS Agent".to_string(),
            git_author_email: "agent@devos.ai".to_string(),
        },
        WorkspaceManager::new(config.workspace_root.clone(), git.clone()),
        buffers,
        health.clone(),
        events.clone(),
        ephemeral,
    ));
    tokio::spawn(health.run());
    tokio::spawn(supervisor.clone().run_terminate_loop(terminate_rx));

    let github = Arc::new(MockGitHub {
        merge_called: AtomicBool::new(false),
    });
    let platform = Arc::new(MockPlatform {
        final_status,
        rollback_called: AtomicBool::new(false),
    });

    let deps = Arc::new(ExecutorDeps {
        config,
        supervisor,
        git,
        github: Arc::new(MockGitHubFactory {
            github: github.clone(),
        }),
        platforms: vec![platform.clone() as Arc<dyn DeployPlatform>],
        pipeline: pipeline.clone(),
        queue,
        events,
    });

    Fixture {
        executor: DevOpsExecutor::new(deps),
        github,
        platform,
        pipeline,
        origin_url: origin.display().to_string(),
        _root: root,
    }
}

async fn prepare_ready_for_deploy(pipeline: &PipelineStateMachine) {
    pipeline
        .ensure_context("proj-1", "ws-1", "bmad-proj-1")
        .await
        .unwrap();
    for (state, trigger) in [
        (PipelineState::Planning, "planner job started"),
        (PipelineState::ReadyForDev, "planner result accepted"),
        (PipelineState::Implementing, "dev job started"),
        (PipelineState::InQa, "dev result accepted"),
        (PipelineState::ReadyForDeploy, "QA verdict = PASS"),
    ] {
        pipeline
            .transition("proj-1", state, trigger, serde_json::json!({}))
            .await
            .unwrap();
    }
}

fn devops_job(fixture: &Fixture, verdict: &str) -> Job {
    let mut job = Job::from_request(
        NewJob {
            workspace_id: "ws-1".to_string(),
            project_id: "proj-1".to_string(),
            job_type: JobType::ExecuteTask,
            payload: serde_json::json!({
                "agentType": "devops",
                "storyId": "11-4",
                "prNumber": 42,
                "verdict": verdict,
                "gitRepoUrl": fixture.origin_url,
                "platform": "railway",
            }),
            priority: None,
            max_attempts: None,
        },
        3,
    );
    job.attempts = 1;
    job
}

const PASSING_SMOKE: &str = r#"echo running smoke tests
echo '```json'
echo '{ "healthCheck": { "passed": true, "endpoint": "/health", "statusCode": 200 }, "apiChecks": [ { "name": "login", "passed": true } ] }'
echo '```'"#;

#[tokio::test]
async fn non_pass_verdict_skips_deployment_without_side_effects() {
    let fixture = fixture(DeploymentStatus::Success, PASSING_SMOKE);
    prepare_ready_for_deploy(&fixture.pipeline).await;

    let job = devops_job(&fixture, "NEEDS_CHANGES");
    let result = fixture.executor.execute(&job).await;

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Deployment skipped: QA verdict is NEEDS_CHANGES")
    );
    assert!(!fixture.github.merge_called.load(Ordering::SeqCst));
    assert!(!fixture.platform.rollback_called.load(Ordering::SeqCst));

    // No pipeline movement either: still ready-for-deploy.
    let context = fixture.pipeline.get("proj-1").await.unwrap().unwrap();
    assert_eq!(context.current_state, PipelineState::ReadyForDeploy);
}

#[tokio::test]
async fn failed_deployment_rolls_back_and_emits_an_incident_report() {
    let fixture = fixture(DeploymentStatus::Failed, PASSING_SMOKE);
    prepare_ready_for_deploy(&fixture.pipeline).await;

    let job = devops_job(&fixture, "PASS");
    let result = fixture.executor.execute(&job).await;

    assert!(!result.success);
    assert!(fixture.github.merge_called.load(Ordering::SeqCst));
    assert!(fixture.platform.rollback_called.load(Ordering::SeqCst));

    let Some(AgentArtifacts::Devops(artifacts)) = result.artifacts else {
        panic!("expected devops artifacts");
    };
    assert_eq!(artifacts.merge_commit_hash.as_deref(), Some("merge-abc"));
    assert!(artifacts.rollback_performed);

    let report = artifacts.incident_report.unwrap();
    assert_eq!(report.failure_type, FailureType::DeploymentFailed);
    assert_eq!(report.severity, Severity::High);
    assert!(report.rollback_performed);
    assert!(report.rollback_successful);
    assert!(report.root_cause.contains("Build error: missing dependency"));
    assert_eq!(report.story_id.as_deref(), Some("11-4"));
}

#[tokio::test]
async fn successful_deployment_with_passing_smoke_tests() {
    let fixture = fixture(DeploymentStatus::Success, PASSING_SMOKE);
    prepare_ready_for_deploy(&fixture.pipeline).await;

    let job = devops_job(&fixture, "PASS");
    let result = fixture.executor.execute(&job).await;

    assert!(result.success, "error: {:?}", result.error);
    let Some(AgentArtifacts::Devops(artifacts)) = result.artifacts else {
        panic!("expected devops artifacts");
    };
    assert_eq!(artifacts.deployment_id.as_deref(), Some("dep-1"));
    assert_eq!(
        artifacts.deployment_url.as_deref(),
        Some("https://app.example")
    );
    assert_eq!(artifacts.platform, Some(PlatformKind::Railway));
    assert!(artifacts.smoke_test_results.unwrap().passed());
    assert!(!artifacts.rollback_performed);
    assert!(artifacts.incident_report.is_none());

    // The executor moved the pipeline into deploying when it started.
    let context = fixture.pipeline.get("proj-1").await.unwrap().unwrap();
    assert_eq!(context.current_state, PipelineState::Deploying);
}

#[tokio::test]
async fn failing_smoke_tests_trigger_rollback_with_medium_severity() {
    const FAILING_SMOKE: &str = r#"echo running smoke tests
echo '```json'
echo '{ "healthCheck": { "passed": true }, "apiChecks": [ { "name": "login", "passed": false, "detail": "500" } ] }'
echo '```'"#;
    let fixture = fixture(DeploymentStatus::Success, FAILING_SMOKE);
    prepare_ready_for_deploy(&fixture.pipeline).await;

    let job = devops_job(&fixture, "PASS");
    let result = fixture.executor.execute(&job).await;

    assert!(!result.success);
    assert!(fixture.platform.rollback_called.load(Ordering::SeqCst));
    let Some(AgentArtifacts::Devops(artifacts)) = result.artifacts else {
        panic!("expected devops artifacts");
    };
    let report = artifacts.incident_report.unwrap();
    assert_eq!(report.failure_type, FailureType::SmokeTestsFailed);
    assert_eq!(report.severity, Severity::Medium);
    assert!(report.rollback_successful);
}
