//! End-to-end pipeline scenarios across the queue, the state machine, and
//! the handoff coordinator, with executors simulated by a scripted
//! dispatcher: happy path, QA rework, and retry-budget exhaustion.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devos_orchestrator::events::EventBus;
use devos_orchestrator::executors::{
    AgentArtifacts, AgentResult, DevArtifacts, PlannerArtifacts, QaArtifacts, QaReport,
    TestResults, Verdict,
};
use devos_orchestrator::handoff::HandoffCoordinator;
use devos_orchestrator::pipeline::{PipelineState, PipelineStateMachine};
use devos_orchestrator::queue::{
    AgentDispatcher, Job, JobQueue, JobStatus, JobType, NewJob, QueueConfig,
};
use devos_orchestrator::store::{FileHandoffStore, FileJobStore, FilePipelineStore, HandoffStore};
use devos_orchestrator::supervisor::AgentType;
use devos_orchestrator::OrchestratorError;

/// Plays the four executors: claims the pipeline phase the way the real
/// ones do, fabricates a plausible result, and routes it through the
/// coordinator.
struct SimulatedExecutors {
    pipeline: Arc<PipelineStateMachine>,
    coordinator: Arc<HandoffCoordinator>,
    qa_verdicts: Mutex<VecDeque<Verdict>>,
    runs: Mutex<Vec<String>>,
}

impl SimulatedExecutors {
    fn result_for(&self, agent_type: AgentType, job: &Job) -> AgentResult {
        match agent_type {
            AgentType::Planner => AgentResult::success(
                AgentArtifacts::Planner(PlannerArtifacts {
                    documents_generated: vec!["docs/prd.md".to_string()],
                    stories_created: vec!["11-4".to_string()],
                    commit_hash: Some("d".repeat(40)),
                }),
                Some("sess-planner".to_string()),
                100,
            ),
            AgentType::Dev => AgentResult::success(
                AgentArtifacts::Dev(DevArtifacts {
                    branch: "devos/dev/11-4".to_string(),
                    commit_hash: "abc123".to_string() + &"0".repeat(34),
                    pr_url: "https://github.com/owner/repo/pull/42".to_string(),
                    pr_number: 42,
                    test_results: TestResults {
                        total: 15,
                        passed: 15,
                        failed: 0,
                        skipped: 0,
                        coverage_percent: Some(90.0),
                    },
                    files_created: vec!["src/feature.ts".to_string()],
                    files_modified: vec![],
                }),
                Some("sess-dev".to_string()),
                100,
            ),
            AgentType::Qa => {
                let verdict = self
                    .qa_verdicts
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Verdict::Pass);
                AgentResult::success(
                    AgentArtifacts::Qa(QaArtifacts {
                        verdict,
                        report: QaReport {
                            tests: TestResults {
                                total: 15,
                                passed: if verdict == Verdict::Pass { 15 } else { 12 },
                                failed: if verdict == Verdict::Pass { 0 } else { 3 },
                                skipped: 0,
                                coverage_percent: Some(90.0),
                            },
                            coverage_percent: None,
                            lint_errors: 0,
                            lint_warnings: 0,
                            type_errors: 0,
                            security_findings: vec![],
                            secret_findings: vec![],
                            acceptance_criteria: vec![],
                            change_requests: if verdict == Verdict::Pass {
                                vec![]
                            } else {
                                vec!["fix X".to_string(), "fix Y".to_string()]
                            },
                            additional_tests_written: 0,
                            summary: None,
                        },
                        additional_tests_written: 0,
                    }),
                    Some("sess-qa".to_string()),
                    100,
                )
            }
            AgentType::Devops => AgentResult::success(
                AgentArtifacts::Devops(devos_orchestrator::executors::DevOpsArtifacts {
                    merge_commit_hash: Some("e".repeat(40)),
                    deployment_id: Some("dep-1".to_string()),
                    deployment_url: Some("https://app.example".to_string()),
                    platform: Some(devos_orchestrator::PlatformKind::Railway),
                    smoke_test_results: None,
                    rollback_performed: false,
                    incident_report: None,
                }),
                None,
                100,
            ),
            AgentType::Orchestrator => AgentResult::failure(
                devos_orchestrator::FailureKind::Fatal,
                format!("unexpected orchestrator job {}", job.id),
                None,
                0,
            ),
        }
    }

    /// The phase transition the real executor applies when its job starts.
    async fn enter_phase(&self, agent_type: AgentType, job: &Job) {
        let target = match agent_type {
            AgentType::Planner => Some(PipelineState::Planning),
            AgentType::Dev => Some(PipelineState::Implementing),
            AgentType::Devops => Some(PipelineState::Deploying),
            _ => None,
        };
        self.pipeline
            .ensure_context(&job.project_id, &job.workspace_id, "bmad-proj")
            .await
            .unwrap();
        if let Some(target) = target {
            let current = self
                .pipeline
                .get(&job.project_id)
                .await
                .unwrap()
                .unwrap()
                .current_state;
            if current != target {
                self.pipeline
                    .transition(
                        &job.project_id,
                        target,
                        &format!("{agent_type} job started"),
                        serde_json::json!({}),
                    )
                    .await
                    .unwrap();
            }
        }
    }
}

#[async_trait]
impl AgentDispatcher for SimulatedExecutors {
    async fn dispatch(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        let agent_type: AgentType = job.payload["agentType"].as_str().unwrap().parse().unwrap();
        self.runs.lock().unwrap().push(agent_type.to_string());

        self.enter_phase(agent_type, job).await;
        let result = self.result_for(agent_type, job);
        self.coordinator.on_result(job, agent_type, &result).await?;
        Ok(result.to_value())
    }
}

struct Scenario {
    queue: Arc<JobQueue>,
    pipeline: Arc<PipelineStateMachine>,
    handoff_store: Arc<FileHandoffStore>,
    executors: Arc<SimulatedExecutors>,
    _dir: tempfile::TempDir,
}

fn scenario(qa_verdicts: &[Verdict]) -> Scenario {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(PipelineStateMachine::new(
        Arc::new(FilePipelineStore::new(dir.path().join("pipeline"))),
        EventBus::default(),
        3,
    ));
    let queue = Arc::new(JobQueue::new(
        Arc::new(FileJobStore::new(dir.path().join("jobs"))),
        QueueConfig {
            workers: 2,
            backoff_base: Duration::from_millis(10),
            ..QueueConfig::default()
        },
    ));
    let handoff_store = Arc::new(FileHandoffStore::new(dir.path().join("handoffs")));
    let coordinator = Arc::new(HandoffCoordinator::new(
        pipeline.clone(),
        queue.clone(),
        handoff_store.clone(),
        "railway".to_string(),
    ));
    let executors = Arc::new(SimulatedExecutors {
        pipeline: pipeline.clone(),
        coordinator,
        qa_verdicts: Mutex::new(qa_verdicts.iter().copied().collect()),
        runs: Mutex::new(vec![]),
    });
    queue.set_dispatcher(executors.clone());
    queue.clone().run_workers();
    Scenario {
        queue,
        pipeline,
        handoff_store,
        executors,
        _dir: dir,
    }
}

async fn kick_off(scenario: &Scenario) {
    scenario
        .queue
        .enqueue(NewJob {
            workspace_id: "ws-1".to_string(),
            project_id: "proj-1".to_string(),
            job_type: JobType::ExecuteTask,
            payload: serde_json::json!({
                "agentType": "planner",
                "gitRepoUrl": "https://github.com/owner/repo.git",
                "epicId": "11",
            }),
            priority: None,
            max_attempts: None,
        })
        .await
        .unwrap();
}

async fn wait_for_terminal_state(scenario: &Scenario) -> PipelineState {
    for _ in 0..500 {
        if let Some(context) = scenario.pipeline.get("proj-1").await.unwrap() {
            if context.current_state.is_terminal() {
                return context.current_state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never reached a terminal state");
}

#[tokio::test]
async fn happy_path_runs_the_full_chain_to_completed() {
    let scenario = scenario(&[Verdict::Pass]);
    kick_off(&scenario).await;

    assert_eq!(wait_for_terminal_state(&scenario).await, PipelineState::Completed);

    let runs = scenario.executors.runs.lock().unwrap().clone();
    assert_eq!(runs, vec!["planner", "dev", "qa", "devops"]);

    // Handoff records in chain order.
    let records = scenario
        .handoff_store
        .list_for_project("proj-1")
        .await
        .unwrap();
    let hops: Vec<(AgentType, Option<AgentType>)> = records
        .iter()
        .map(|r| (r.from_agent_type, r.to_agent_type))
        .collect();
    assert_eq!(
        hops,
        vec![
            (AgentType::Planner, Some(AgentType::Dev)),
            (AgentType::Dev, Some(AgentType::Qa)),
            (AgentType::Qa, Some(AgentType::Devops)),
            (AgentType::Devops, None),
        ]
    );

    // The exact state sequence of the happy path.
    let mut history = scenario.pipeline.history("proj-1", 100, 0).await.unwrap();
    history.reverse();
    let states: Vec<PipelineState> = history.iter().map(|row| row.to_state).collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Planning,
            PipelineState::ReadyForDev,
            PipelineState::Implementing,
            PipelineState::InQa,
            PipelineState::ReadyForDeploy,
            PipelineState::Deploying,
            PipelineState::Completed,
        ]
    );

    // Every job in the chain completed.
    let (jobs, total) = scenario
        .queue
        .list_jobs(&devos_orchestrator::queue::JobFilter {
            workspace_id: Some("ws-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 4);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
}

#[tokio::test]
async fn qa_rework_loops_back_to_dev_then_completes() {
    let scenario = scenario(&[Verdict::Fail, Verdict::Pass]);
    kick_off(&scenario).await;

    assert_eq!(wait_for_terminal_state(&scenario).await, PipelineState::Completed);

    let runs = scenario.executors.runs.lock().unwrap().clone();
    assert_eq!(runs, vec!["planner", "dev", "qa", "dev", "qa", "devops"]);

    let context = scenario.pipeline.get("proj-1").await.unwrap().unwrap();
    assert_eq!(context.retry_count, 1);

    // The rework loop shows up in the history as in-qa -> implementing.
    let history = scenario.pipeline.history("proj-1", 100, 0).await.unwrap();
    assert!(history.iter().any(|row| {
        row.from_state == PipelineState::InQa && row.to_state == PipelineState::Implementing
    }));
}

#[tokio::test]
async fn qa_failing_every_iteration_exhausts_the_budget() {
    let scenario = scenario(&[
        Verdict::Fail,
        Verdict::Fail,
        Verdict::Fail,
        Verdict::Fail,
        Verdict::Fail,
    ]);
    kick_off(&scenario).await;

    assert_eq!(wait_for_terminal_state(&scenario).await, PipelineState::Failed);

    let context = scenario.pipeline.get("proj-1").await.unwrap().unwrap();
    assert_eq!(context.retry_count, 3);

    // No DevOps run ever happened.
    let runs = scenario.executors.runs.lock().unwrap().clone();
    assert!(!runs.contains(&"devops".to_string()));
    assert_eq!(runs.iter().filter(|r| r.as_str() == "qa").count(), 4);

    // The terminal transition is in-qa -> failed.
    let history = scenario.pipeline.history("proj-1", 1, 0).await.unwrap();
    assert_eq!(history[0].from_state, PipelineState::InQa);
    assert_eq!(history[0].to_state, PipelineState::Failed);
}
