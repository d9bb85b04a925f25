//! Composition root: builds every subsystem, wires the dispatcher into the
//! job queue, runs startup recovery, and hosts the control plane.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::deploy::{DeployPlatform, RailwayPlatform, VercelPlatform};
use crate::error::OrchestratorError;
use crate::events::EventBus;
use crate::executors::{
    AgentExecutor, AgentResult, DevExecutor, DevOpsExecutor, ExecutorDeps, FailureKind,
    GitHubFactory, PlannerExecutor, QaExecutor, TokenGitHubFactory,
};
use crate::gitops::GitGateway;
use crate::handoff::{HandoffCoordinator, HandoffDecision};
use crate::pipeline::{PipelineStateMachine, ResumeAction};
use crate::queue::{AgentDispatcher, Job, JobQueue, JobType, NewJob, QueueConfig};
use crate::server::{ApiContext, MembershipVerifier, StaticTokenVerifier};
use crate::store::{
    EphemeralStore, FileHandoffStore, FileJobStore, FilePipelineStore,
};
use crate::supervisor::{
    AgentType, OutputBufferRegistry, ProcessSupervisor, SessionHealthMonitor, SpawnParams,
    SupervisorConfig, TerminateRequest, WorkspaceManager,
};
use crate::telemetry::{create_pipeline_span, generate_correlation_id};

fn backend_dir(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub events: EventBus,
    pub queue: Arc<JobQueue>,
    pub pipeline: Arc<PipelineStateMachine>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub handoff: Arc<HandoffCoordinator>,
    pub ephemeral: Arc<EphemeralStore>,
    buffers: Arc<OutputBufferRegistry>,
    health: Arc<SessionHealthMonitor>,
    terminate_rx: std::sync::Mutex<Option<mpsc::Receiver<TerminateRequest>>>,
    _queue_lock: fd_lock::RwLockWriteGuard<'static, std::fs::File>,
}

impl Orchestrator {
    /// Explicit wiring of the whole system. Nothing is constructed lazily;
    /// the dispatcher is injected into the queue at the end to break the
    /// queue-executor cycle.
    pub fn build(config: OrchestratorConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let events = EventBus::default();

        // Single-process claim on the job backend: two orchestrators must
        // not double-process the same job rows.
        let queue_dir = backend_dir(&config.job_queue_backend_url);
        std::fs::create_dir_all(&queue_dir)
            .with_context(|| format!("create {}", queue_dir.display()))?;
        let lock_file = std::fs::File::create(queue_dir.join("queue.lock"))?;
        let lock: &'static mut fd_lock::RwLock<std::fs::File> =
            Box::leak(Box::new(fd_lock::RwLock::new(lock_file)));
        let queue_lock = lock
            .try_write()
            .map_err(|_| anyhow!("another orchestrator already owns this job backend"))?;

        let job_store = Arc::new(FileJobStore::new(queue_dir.clone()));
        let pipeline_store = Arc::new(FilePipelineStore::new(backend_dir(
            &config.pipeline_state_backend_url,
        )));
        let handoff_store = Arc::new(FileHandoffStore::new(backend_dir(
            &config.pipeline_state_backend_url,
        )));
        let ephemeral = Arc::new(EphemeralStore::new(
            backend_dir(&config.output_buffer_backend_url),
            Duration::from_secs(config.output_snapshot_ttl_seconds),
        ));

        let pipeline = Arc::new(PipelineStateMachine::new(
            pipeline_store,
            events.clone(),
            config.pipeline_max_retries,
        ));

        let git = GitGateway::new(
            config.git_author_name.clone(),
            config.git_author_email.clone(),
            config.git_base_branch.clone(),
            config.git_token(),
            Duration::from_secs(config.git_push_timeout_seconds),
            Duration::from_secs(config.git_command_timeout_seconds),
        );

        let buffers = Arc::new(OutputBufferRegistry::new(
            ephemeral.clone(),
            config.output_buffer_max_lines,
        ));
        let (terminate_tx, terminate_rx) = mpsc::channel::<TerminateRequest>(32);
        let health = Arc::new(SessionHealthMonitor::new(
            Duration::from_secs(config.session_stall_seconds),
            Duration::from_secs(config.session_hard_timeout_seconds),
            Duration::from_secs(10),
            events.clone(),
            terminate_tx,
        ));
        let workspaces = WorkspaceManager::new(config.workspace_root.clone(), git.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(
            SupervisorConfig {
                cli_binary_path: config.cli_binary_path.clone(),
                hard_timeout: Duration::from_secs(config.session_hard_timeout_seconds),
                terminate_grace: Duration::from_secs(config.terminate_grace_seconds),
                git_author_name: config.git_author_name.clone(),
                git_author_email: config.git_author_email.clone(),
            },
            workspaces,
            buffers.clone(),
            health.clone(),
            events.clone(),
            ephemeral.clone(),
        ));

        let queue = Arc::new(JobQueue::new(
            job_store,
            QueueConfig {
                workers: config.queue_workers,
                default_max_attempts: config.job_max_attempts,
                backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
                ..QueueConfig::default()
            },
        ));
        queue.set_terminator(supervisor.clone());

        let platforms: Vec<Arc<dyn DeployPlatform>> = vec![
            Arc::new(RailwayPlatform::new(config.railway_api_url.clone())),
            Arc::new(VercelPlatform::new(config.vercel_api_url.clone())),
        ];

        let deps = Arc::new(ExecutorDeps {
            config: config.clone(),
            supervisor: supervisor.clone(),
            git,
            github: Arc::new(TokenGitHubFactory) as Arc<dyn GitHubFactory>,
            platforms,
            pipeline: pipeline.clone(),
            queue: queue.clone(),
            events: events.clone(),
        });

        let handoff = Arc::new(HandoffCoordinator::new(
            pipeline.clone(),
            queue.clone(),
            handoff_store,
            config.deploy_platform.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            deps.clone(),
            handoff.clone(),
            config.max_parallel_agents,
        ));
        queue.set_dispatcher(dispatcher);

        Ok(Arc::new(Self {
            config,
            events,
            queue,
            pipeline,
            supervisor,
            handoff,
            ephemeral,
            buffers,
            health,
            terminate_rx: std::sync::Mutex::new(Some(terminate_rx)),
            _queue_lock: queue_lock,
        }))
    }

    /// Start background machinery: health polling, snapshotting, workers,
    /// retention, and startup recovery.
    pub async fn start(&self) -> Result<Vec<ResumeAction>> {
        tokio::spawn(self.health.clone().run());
        if let Some(terminate_rx) = self.terminate_rx.lock().unwrap().take() {
            tokio::spawn(self.supervisor.clone().run_terminate_loop(terminate_rx));
        }
        tokio::spawn(
            self.buffers
                .clone()
                .run_snapshot_loop(Duration::from_millis(500)),
        );
        tokio::spawn(
            self.queue
                .clone()
                .run_retention_loop(Duration::from_secs(3600)),
        );
        {
            let ephemeral = self.ephemeral.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(600));
                loop {
                    ticker.tick().await;
                    ephemeral.sweep_expired_snapshots().await;
                }
            });
        }

        let actions = self.recover().await?;
        self.queue.clone().run_workers();
        info!("Orchestrator started");
        Ok(actions)
    }

    /// Startup recovery: resume persisted jobs and re-enqueue agents for
    /// every pipeline that was mid-flight when the process stopped.
    pub async fn recover(&self) -> Result<Vec<ResumeAction>> {
        self.queue
            .resume_persisted()
            .await
            .map_err(|e| anyhow!("queue recovery failed: {e}"))?;

        let actions = self
            .pipeline
            .recover()
            .await
            .map_err(|e| anyhow!("pipeline recovery failed: {e}"))?;

        for action in &actions {
            if let ResumeAction::Resume {
                project_id,
                workspace_id,
                agent_type,
                story_id,
            } = action
            {
                let metadata = self
                    .pipeline
                    .get(project_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|ctx| ctx.metadata)
                    .unwrap_or_default();
                match resume_payload(&metadata, *agent_type, story_id.as_deref()) {
                    Some(payload) => {
                        let job = self
                            .queue
                            .enqueue(NewJob {
                                workspace_id: workspace_id.clone(),
                                project_id: project_id.clone(),
                                job_type: JobType::ExecuteTask,
                                payload,
                                priority: None,
                                max_attempts: None,
                            })
                            .await;
                        match job {
                            Ok(job) => info!(
                                project_id = %project_id,
                                agent_type = %agent_type,
                                job_id = %job.id,
                                "Recovery re-enqueued agent job"
                            ),
                            Err(e) => warn!(
                                project_id = %project_id,
                                error = %e,
                                "Recovery failed to enqueue resume job"
                            ),
                        }
                    }
                    None => {
                        warn!(
                            project_id = %project_id,
                            agent_type = %agent_type,
                            "Context lacks the metadata needed to resume; marking failed"
                        );
                        let _ = self
                            .pipeline
                            .transition(
                                project_id,
                                crate::pipeline::PipelineState::Failed,
                                "recovery: missing resume metadata",
                                serde_json::json!({}),
                            )
                            .await;
                    }
                }
            }
        }
        Ok(actions)
    }

    /// Run the orchestrator until SIGINT/SIGTERM, then shut down cleanly:
    /// stop accepting control-plane requests, terminate live sessions, and
    /// give buffers a moment to snapshot.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.start().await?;

        let ctx = Arc::new(ApiContext {
            queue: self.queue.clone(),
            pipeline: self.pipeline.clone(),
            verifier: Arc::new(StaticTokenVerifier::new(
                self.config.control_plane_token.clone(),
            )) as Arc<dyn MembershipVerifier>,
        });

        let shutdown = async {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            info!("Shutdown signal received");
        };

        crate::server::serve(ctx, &self.config.control_plane_addr, shutdown).await?;

        self.supervisor
            .terminate_all("orchestrator shutting down")
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        info!("Orchestrator shutdown complete");
        Ok(())
    }
}

/// Build the payload that resumes an interrupted phase from persisted
/// pipeline metadata. `None` when the metadata is insufficient.
fn resume_payload(
    metadata: &serde_json::Value,
    agent_type: AgentType,
    story_id: Option<&str>,
) -> Option<serde_json::Value> {
    let repo_url = metadata.get("gitRepoUrl")?.as_str()?.to_string();
    match agent_type {
        AgentType::Planner => Some(serde_json::json!({
            "agentType": "planner",
            "gitRepoUrl": repo_url,
            "epicId": metadata.get("epicId"),
        })),
        AgentType::Dev => {
            let story_id = story_id?;
            Some(serde_json::json!({
                "agentType": "dev",
                "storyId": story_id,
                "gitRepoUrl": repo_url,
                "acceptanceCriteria": metadata
                    .get("stories")
                    .and_then(|s| s.get(story_id))
                    .and_then(|s| s.get("acceptanceCriteria"))
                    .cloned()
                    .unwrap_or(serde_json::json!([])),
            }))
        }
        AgentType::Qa => {
            let story_id = story_id?;
            let pr = metadata.get("currentPr")?;
            Some(serde_json::json!({
                "agentType": "qa",
                "storyId": story_id,
                "gitRepoUrl": repo_url,
                "branch": metadata.get("currentBranch")?,
                "prUrl": pr.get("url")?,
                "prNumber": pr.get("number")?,
            }))
        }
        AgentType::Devops => {
            let story_id = story_id?;
            let pr = metadata.get("currentPr")?;
            Some(serde_json::json!({
                "agentType": "devops",
                "storyId": story_id,
                "gitRepoUrl": repo_url,
                "verdict": "PASS",
                "prNumber": pr.get("number")?,
            }))
        }
        AgentType::Orchestrator => None,
    }
}

/// Routes claimed jobs to executors, enforces the global parallel-agent
/// bound, and forwards every result to the handoff coordinator.
pub struct Dispatcher {
    deps: Arc<ExecutorDeps>,
    handoff: Arc<HandoffCoordinator>,
    executors: HashMap<AgentType, Arc<dyn AgentExecutor>>,
    slots: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        deps: Arc<ExecutorDeps>,
        handoff: Arc<HandoffCoordinator>,
        max_parallel_agents: usize,
    ) -> Self {
        let mut executors: HashMap<AgentType, Arc<dyn AgentExecutor>> = HashMap::new();
        executors.insert(
            AgentType::Planner,
            Arc::new(PlannerExecutor::new(deps.clone())),
        );
        executors.insert(AgentType::Dev, Arc::new(DevExecutor::new(deps.clone())));
        executors.insert(AgentType::Qa, Arc::new(QaExecutor::new(deps.clone())));
        executors.insert(
            AgentType::Devops,
            Arc::new(DevOpsExecutor::new(deps.clone())),
        );
        Self {
            deps,
            handoff,
            executors,
            slots: Arc::new(Semaphore::new(max_parallel_agents.max(1))),
        }
    }

    async fn dispatch_agent(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        let agent_type: AgentType = job
            .payload
            .get("agentType")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                OrchestratorError::Validation("job payload is missing agentType".to_string())
            })?
            .parse()
            .map_err(OrchestratorError::Validation)?;

        let executor = self
            .executors
            .get(&agent_type)
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("no executor for agent type {agent_type}"))
            })?
            .clone();

        let story_id = job
            .payload
            .get("storyId")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
        let correlation_id = generate_correlation_id();
        let span = create_pipeline_span(
            "dispatch_agent",
            Some(&job.project_id),
            story_id.as_deref(),
            Some(&correlation_id),
        );

        async move {
            tracing::info!(
                job_id = %job.id,
                agent_type = %agent_type,
                correlation_id = %correlation_id,
                "Dispatching agent job"
            );

            // Record the repository for crash recovery before any work
            // begins.
            if let Some(repo_url) = job.payload.get("gitRepoUrl") {
                let workflow_id = format!("bmad-{}", job.project_id);
                let _ = self
                    .deps
                    .pipeline
                    .ensure_context(&job.project_id, &job.workspace_id, &workflow_id)
                    .await;
                let _ = self
                    .deps
                    .pipeline
                    .merge_metadata(
                        &job.project_id,
                        serde_json::json!({ "gitRepoUrl": repo_url }),
                    )
                    .await;
            }

            // Global parallelism bound: handoffs in excess of the limit wait
            // here until a slot frees.
            let _permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| OrchestratorError::Fatal("agent slots closed".to_string()))?;

            let result = executor.execute(job).await;
            let decision = self.handoff.on_result(job, agent_type, &result).await?;
            result_to_outcome(&result, &decision)
        }
        .instrument(span)
        .await
    }

    /// Re-enqueue the agent that should be driving the project's current
    /// phase, from persisted metadata.
    async fn dispatch_recover(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        let context = self
            .deps
            .pipeline
            .get(&job.project_id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "no pipeline context for project {}",
                    job.project_id
                ))
            })?;

        let Some(agent_type) = context.current_state.driving_agent() else {
            return Ok(serde_json::json!({
                "resumed": false,
                "state": context.current_state,
            }));
        };
        let payload = resume_payload(
            &context.metadata,
            agent_type,
            context.current_story_id.as_deref(),
        )
        .ok_or_else(|| {
            OrchestratorError::Fatal(format!(
                "context for project {} lacks the metadata needed to resume",
                job.project_id
            ))
        })?;
        let next = self.deps.queue.enqueue(NewJob {
            workspace_id: job.workspace_id.clone(),
            project_id: job.project_id.clone(),
            job_type: JobType::ExecuteTask,
            payload,
            priority: Some(job.priority),
            max_attempts: None,
        })
        .await?;
        Ok(serde_json::json!({ "resumed": true, "jobId": next.id }))
    }

    async fn dispatch_terminate(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        let session_id = job
            .payload
            .get("sessionId")
            .and_then(|s| s.as_str())
            .ok_or_else(|| {
                OrchestratorError::Validation("terminate-agent payload needs sessionId".to_string())
            })?;
        let reason = job
            .payload
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("terminated by request");
        match self.deps.supervisor.terminate(session_id, reason).await {
            Ok(()) => Ok(serde_json::json!({ "terminated": session_id })),
            Err(e) => Err(OrchestratorError::NotFound(e.to_string())),
        }
    }

    /// A chat job is a single bounded CLI session whose output becomes the
    /// job result.
    async fn dispatch_chat(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        let message = job
            .payload
            .get("message")
            .and_then(|m| m.as_str())
            .ok_or_else(|| {
                OrchestratorError::Validation("chat payload needs a message".to_string())
            })?;
        let repo_url = job
            .payload
            .get("gitRepoUrl")
            .and_then(|u| u.as_str())
            .unwrap_or_default();

        let correlation_id = generate_correlation_id();
        let span = create_pipeline_span(
            "dispatch_chat",
            Some(&job.project_id),
            None,
            Some(&correlation_id),
        );

        async move {
            tracing::info!(
                job_id = %job.id,
                correlation_id = %correlation_id,
                "Dispatching chat session"
            );

            let ticket = self
                .deps
                .supervisor
                .clone()
                .spawn(SpawnParams {
                    workspace_id: job.workspace_id.clone(),
                    project_id: job.project_id.clone(),
                    agent_id: format!("chat-{}", job.id),
                    agent_type: AgentType::Orchestrator,
                    prompt: message.to_string(),
                    story_id: None,
                    git_repo_url: repo_url.to_string(),
                    pipeline_snapshot: serde_json::json!({}),
                })
                .await
                .map_err(|e| OrchestratorError::Cli(e.to_string()))?;
            self.deps.queue.register_session(&job.id, &ticket.session_id);

            let run = crate::executors::await_session(
                &self.deps.supervisor,
                ticket,
                Duration::from_secs(self.deps.config.session_stall_seconds),
            )
            .await;
            match run.exit {
                crate::supervisor::SessionExit::Completed { .. } => {
                    let output = self
                        .deps
                        .supervisor
                        .buffers()
                        .get_buffered_output(&run.session_id)
                        .await
                        .unwrap_or_default();
                    Ok(serde_json::json!({
                        "sessionId": run.session_id,
                        "reply": output.join("\n"),
                    }))
                }
                crate::supervisor::SessionExit::Failed { reason, .. } => {
                    Err(OrchestratorError::Cli(reason))
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Translate an executor result + handoff decision into the queue's view:
/// successes complete the job, retryable failures become retryable errors,
/// fatal failures dead-letter the job.
fn result_to_outcome(
    result: &AgentResult,
    decision: &HandoffDecision,
) -> Result<serde_json::Value, OrchestratorError> {
    if result.success {
        let mut value = result.to_value();
        if let (Some(object), HandoffDecision::Dispatched { to, job_id }) =
            (value.as_object_mut(), decision)
        {
            object.insert(
                "handoff".to_string(),
                serde_json::json!({ "to": to.to_string(), "jobId": job_id }),
            );
        }
        return Ok(value);
    }
    let message = result
        .error
        .clone()
        .unwrap_or_else(|| "agent failed".to_string());
    match result.failure_kind {
        Some(FailureKind::Cli) => Err(OrchestratorError::Cli(message)),
        Some(FailureKind::Transient) => Err(OrchestratorError::Transient(message)),
        _ => Err(OrchestratorError::Fatal(message)),
    }
}

#[async_trait]
impl AgentDispatcher for Dispatcher {
    async fn dispatch(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError> {
        match job.job_type {
            JobType::SpawnAgent | JobType::ExecuteTask => self.dispatch_agent(job).await,
            JobType::RecoverContext => self.dispatch_recover(job).await,
            JobType::TerminateAgent => self.dispatch_terminate(job).await,
            JobType::Chat => self.dispatch_chat(job).await,
        }
    }
}
