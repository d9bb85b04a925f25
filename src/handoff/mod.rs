//! Handoff coordinator: validates a completing agent's result, assembles
//! the next agent's input context, and schedules the next job.
//!
//! The next job is enqueued only after the handoff record and the pipeline
//! transition are durably persisted. Handoffs for one story serialise on a
//! per-story lock, so a duplicate enqueued handoff observes the advanced
//! pipeline state and is rejected instead of double-dispatching.

pub mod record;
pub mod rules;

pub use record::{HandoffRecord, HandoffStatus};
pub use rules::{evaluate, Rule, RuleContext};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::executors::{
    AgentArtifacts, AgentResult, DevArtifacts, FailureKind, PlannerArtifacts, QaArtifacts,
    Verdict,
};
use crate::pipeline::{PipelineState, PipelineStateMachine};
use crate::queue::{JobQueue, JobType, NewJob};
use crate::store::HandoffStore;
use crate::supervisor::AgentType;

/// What the coordinator decided for a completing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffDecision {
    /// The next agent's job was enqueued.
    Dispatched { to: AgentType, job_id: String },
    /// The story finished the whole chain.
    PipelineCompleted,
    /// The pipeline was transitioned to failed.
    PipelineFailed { reason: String },
    /// A retryable failure: the job queue owns the next attempt.
    AwaitingRetry,
}

pub struct HandoffCoordinator {
    pipeline: Arc<PipelineStateMachine>,
    queue: Arc<JobQueue>,
    store: Arc<dyn HandoffStore>,
    deploy_platform_setting: String,
    story_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HandoffCoordinator {
    pub fn new(
        pipeline: Arc<PipelineStateMachine>,
        queue: Arc<JobQueue>,
        store: Arc<dyn HandoffStore>,
        deploy_platform_setting: String,
    ) -> Self {
        Self {
            pipeline,
            queue,
            store,
            deploy_platform_setting,
            story_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn story_lock(&self, project_id: &str, story_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{project_id}:{story_id}");
        let mut locks = self.story_locks.lock().unwrap();
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Entry point, called by the dispatcher after every executor run.
    pub async fn on_result(
        &self,
        job: &crate::queue::Job,
        from: AgentType,
        result: &AgentResult,
    ) -> Result<HandoffDecision, OrchestratorError> {
        if !result.success {
            return self.on_failure(job, from, result).await;
        }

        let story_id = story_of(job, result);
        let lock = self.story_lock(&job.project_id, story_id.as_deref().unwrap_or("-"));
        let _guard = lock.lock().await;

        let Some(pipeline_ctx) = self
            .pipeline
            .get(&job.project_id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
        else {
            return Err(OrchestratorError::Fatal(format!(
                "no pipeline context for project {}",
                job.project_id
            )));
        };

        let mut record = HandoffRecord::new(
            &job.project_id,
            &job.workspace_id,
            story_id.as_deref(),
            from,
        );

        let rule_ctx = RuleContext {
            from,
            result,
            pipeline: &pipeline_ctx,
        };
        if let Err((rule, reason)) = evaluate(&rule_ctx) {
            let reason = format!("handoff rejected by rule '{rule}': {reason}");
            warn!(
                project_id = %job.project_id,
                story_id = ?story_id,
                rule = rule,
                "Handoff rejected"
            );
            record.status = HandoffStatus::Rejected;
            record.rejection_reason = Some(reason.clone());
            record.completed_at = Some(Utc::now());
            self.store
                .put(&record)
                .await
                .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
            self.fail_pipeline(&job.project_id, &reason).await;
            return Ok(HandoffDecision::PipelineFailed { reason });
        }
        record.status = HandoffStatus::Validated;

        let repo_url = job
            .payload
            .get("gitRepoUrl")
            .and_then(|u| u.as_str())
            .unwrap_or_default()
            .to_string();

        match (&result.artifacts, from) {
            (Some(AgentArtifacts::Planner(planner)), AgentType::Planner) => {
                self.route_planner(job, planner, record, &repo_url).await
            }
            (Some(AgentArtifacts::Dev(dev)), AgentType::Dev) => {
                self.route_dev(job, dev, record, &repo_url, story_id.as_deref())
                    .await
            }
            (Some(AgentArtifacts::Qa(qa)), AgentType::Qa) => {
                self.route_qa(job, qa, record, &repo_url, story_id.as_deref())
                    .await
            }
            (Some(AgentArtifacts::Devops(_)), AgentType::Devops) => {
                self.route_devops(job, record, story_id.as_deref()).await
            }
            _ => Err(OrchestratorError::Fatal(format!(
                "no routing for {from} result"
            ))),
        }
    }

    async fn on_failure(
        &self,
        job: &crate::queue::Job,
        from: AgentType,
        result: &AgentResult,
    ) -> Result<HandoffDecision, OrchestratorError> {
        let retryable = matches!(
            result.failure_kind,
            Some(FailureKind::Cli) | Some(FailureKind::Transient)
        );
        if retryable && job.attempts < job.max_attempts {
            // The queue re-runs this job; the pipeline keeps its state.
            return Ok(HandoffDecision::AwaitingRetry);
        }

        let reason = result
            .error
            .clone()
            .unwrap_or_else(|| format!("{from} agent failed"));
        let mut record = HandoffRecord::new(
            &job.project_id,
            &job.workspace_id,
            story_of(job, result).as_deref(),
            from,
        );
        record.status = HandoffStatus::Rejected;
        record.rejection_reason = Some(reason.clone());
        record.completed_at = Some(Utc::now());
        self.store
            .put(&record)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        self.fail_pipeline(&job.project_id, &reason).await;
        Ok(HandoffDecision::PipelineFailed { reason })
    }

    async fn fail_pipeline(&self, project_id: &str, reason: &str) {
        let result = self
            .pipeline
            .transition(
                project_id,
                PipelineState::Failed,
                &format!("fatal error surfaced by executor: {reason}"),
                serde_json::json!({ "error": reason }),
            )
            .await;
        if let Err(e) = result {
            // Already terminal, or the context is gone; either way the
            // failure is recorded on the job.
            warn!(project_id = %project_id, error = %e, "Could not fail pipeline");
        }
    }

    /// Persist the executed record, then enqueue the next job.
    async fn finish_dispatch(
        &self,
        mut record: HandoffRecord,
        to: AgentType,
        job: &crate::queue::Job,
        payload: serde_json::Value,
    ) -> Result<HandoffDecision, OrchestratorError> {
        record.to_agent_type = Some(to);
        record.context_snapshot = payload.clone();
        record.status = HandoffStatus::Executed;
        record.completed_at = Some(Utc::now());
        self.store
            .put(&record)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        let next = self
            .queue
            .enqueue(NewJob {
                workspace_id: job.workspace_id.clone(),
                project_id: job.project_id.clone(),
                job_type: JobType::ExecuteTask,
                payload,
                priority: Some(job.priority),
                max_attempts: None,
            })
            .await?;
        info!(
            project_id = %job.project_id,
            to = %to,
            next_job_id = %next.id,
            "Handoff dispatched"
        );
        Ok(HandoffDecision::Dispatched {
            to,
            job_id: next.id,
        })
    }

    async fn route_planner(
        &self,
        job: &crate::queue::Job,
        planner: &PlannerArtifacts,
        record: HandoffRecord,
        repo_url: &str,
    ) -> Result<HandoffDecision, OrchestratorError> {
        self.pipeline
            .transition(
                &job.project_id,
                PipelineState::ReadyForDev,
                "planner result accepted",
                serde_json::json!({ "stories": planner.stories_created }),
            )
            .await
            .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;

        let pipeline_ctx = self
            .pipeline
            .get(&job.project_id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Fatal("pipeline context vanished".to_string()))?;
        let payload = projections::planner_to_dev(planner, &pipeline_ctx.metadata, repo_url)
            .ok_or_else(|| {
                OrchestratorError::Fatal("planner result has no dispatchable story".to_string())
            })?;
        self.finish_dispatch(record, AgentType::Dev, job, payload)
            .await
    }

    async fn route_dev(
        &self,
        job: &crate::queue::Job,
        dev: &DevArtifacts,
        record: HandoffRecord,
        repo_url: &str,
        story_id: Option<&str>,
    ) -> Result<HandoffDecision, OrchestratorError> {
        let story_id = story_id
            .map(|s| s.to_string())
            .ok_or_else(|| OrchestratorError::Fatal("dev result has no story id".to_string()))?;

        // The PR facts feed the QA and DevOps phases.
        self.pipeline
            .merge_metadata(
                &job.project_id,
                serde_json::json!({
                    "currentPr": { "number": dev.pr_number, "url": dev.pr_url },
                    "currentBranch": dev.branch,
                }),
            )
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

        self.pipeline
            .transition(
                &job.project_id,
                PipelineState::InQa,
                "dev result accepted",
                serde_json::json!({ "prNumber": dev.pr_number }),
            )
            .await
            .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;

        let pipeline_ctx = self
            .pipeline
            .get(&job.project_id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Fatal("pipeline context vanished".to_string()))?;
        let payload = projections::dev_to_qa(&story_id, dev, &pipeline_ctx.metadata, repo_url);
        self.finish_dispatch(record, AgentType::Qa, job, payload)
            .await
    }

    async fn route_qa(
        &self,
        job: &crate::queue::Job,
        qa: &QaArtifacts,
        record: HandoffRecord,
        repo_url: &str,
        story_id: Option<&str>,
    ) -> Result<HandoffDecision, OrchestratorError> {
        let story_id = story_id
            .map(|s| s.to_string())
            .ok_or_else(|| OrchestratorError::Fatal("qa result has no story id".to_string()))?;
        let pipeline_ctx = self
            .pipeline
            .get(&job.project_id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?
            .ok_or_else(|| OrchestratorError::Fatal("pipeline context vanished".to_string()))?;

        match qa.verdict {
            Verdict::Pass => {
                self.pipeline
                    .transition(
                        &job.project_id,
                        PipelineState::ReadyForDeploy,
                        "QA verdict = PASS",
                        serde_json::json!({ "storyId": story_id }),
                    )
                    .await
                    .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;
                let payload = projections::qa_pass_to_devops(
                    &story_id,
                    qa,
                    &pipeline_ctx.metadata,
                    repo_url,
                    &self.deploy_platform_setting,
                );
                self.finish_dispatch(record, AgentType::Devops, job, payload)
                    .await
            }
            verdict => {
                // Rework loop: the budget was already validated by the
                // rules engine.
                let iteration = self
                    .pipeline
                    .increment_retry(&job.project_id)
                    .await
                    .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
                self.pipeline
                    .transition(
                        &job.project_id,
                        PipelineState::Implementing,
                        &format!("QA verdict = {verdict}"),
                        serde_json::json!({ "iterationCount": iteration }),
                    )
                    .await
                    .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;
                let payload = projections::qa_fail_to_dev(
                    &story_id,
                    qa,
                    iteration,
                    &pipeline_ctx.metadata,
                    repo_url,
                );
                self.finish_dispatch(record, AgentType::Dev, job, payload)
                    .await
            }
        }
    }

    async fn route_devops(
        &self,
        job: &crate::queue::Job,
        mut record: HandoffRecord,
        story_id: Option<&str>,
    ) -> Result<HandoffDecision, OrchestratorError> {
        self.pipeline
            .transition(
                &job.project_id,
                PipelineState::Completed,
                "deployment + smoke tests succeed",
                serde_json::json!({ "storyId": story_id }),
            )
            .await
            .map_err(|e| OrchestratorError::Conflict(e.to_string()))?;

        if let Some(story_id) = story_id {
            let pipeline_ctx = self
                .pipeline
                .get(&job.project_id)
                .await
                .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
            let mut completed: Vec<String> = pipeline_ctx
                .as_ref()
                .and_then(|ctx| ctx.metadata.get("completedStories"))
                .and_then(|c| c.as_array())
                .map(|c| {
                    c.iter()
                        .filter_map(|s| s.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            if !completed.iter().any(|s| s == story_id) {
                completed.push(story_id.to_string());
            }
            let _ = self
                .pipeline
                .merge_metadata(
                    &job.project_id,
                    serde_json::json!({ "completedStories": completed }),
                )
                .await;
        }

        record.status = HandoffStatus::Executed;
        record.completed_at = Some(Utc::now());
        self.store
            .put(&record)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        info!(project_id = %job.project_id, story_id = ?story_id, "Pipeline completed");
        Ok(HandoffDecision::PipelineCompleted)
    }
}

/// The story a result belongs to, from the artifacts or the job payload.
fn story_of(job: &crate::queue::Job, result: &AgentResult) -> Option<String> {
    if let Some(AgentArtifacts::Planner(planner)) = &result.artifacts {
        return planner.stories_created.first().cloned();
    }
    job.payload
        .get("storyId")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string())
}

/// Context projections: the shapes each receiving agent gets.
pub mod projections {
    use super::*;

    fn criteria_for(metadata: &serde_json::Value, story_id: &str) -> serde_json::Value {
        metadata
            .get("stories")
            .and_then(|stories| stories.get(story_id))
            .and_then(|story| story.get("acceptanceCriteria"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]))
    }

    /// Planner -> Dev: story id, acceptance criteria, planning documents.
    pub fn planner_to_dev(
        planner: &PlannerArtifacts,
        metadata: &serde_json::Value,
        repo_url: &str,
    ) -> Option<serde_json::Value> {
        let story_id = planner.stories_created.first()?.clone();
        Some(serde_json::json!({
            "agentType": "dev",
            "storyId": story_id,
            "gitRepoUrl": repo_url,
            "acceptanceCriteria": criteria_for(metadata, &story_id),
            "planningDocuments": planner.documents_generated,
        }))
    }

    /// Dev -> QA: branch, PR, test results, file lists.
    pub fn dev_to_qa(
        story_id: &str,
        dev: &DevArtifacts,
        metadata: &serde_json::Value,
        repo_url: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "agentType": "qa",
            "storyId": story_id,
            "gitRepoUrl": repo_url,
            "branch": dev.branch,
            "prUrl": dev.pr_url,
            "prNumber": dev.pr_number,
            "testResults": dev.test_results,
            "filesCreated": dev.files_created,
            "filesModified": dev.files_modified,
            "acceptanceCriteria": criteria_for(metadata, story_id),
        })
    }

    /// QA PASS -> DevOps: verdict, PR info, platform settings, QA summary.
    pub fn qa_pass_to_devops(
        story_id: &str,
        qa: &QaArtifacts,
        metadata: &serde_json::Value,
        repo_url: &str,
        platform_setting: &str,
    ) -> serde_json::Value {
        let pr = metadata.get("currentPr").cloned().unwrap_or_default();
        serde_json::json!({
            "agentType": "devops",
            "storyId": story_id,
            "gitRepoUrl": repo_url,
            "verdict": qa.verdict,
            "prNumber": pr.get("number").cloned().unwrap_or_default(),
            "prUrl": pr.get("url").cloned().unwrap_or_default(),
            "platform": platform_setting,
            "qaSummary": qa.report.summary,
        })
    }

    /// QA FAIL / NEEDS_CHANGES -> Dev: the rework context.
    pub fn qa_fail_to_dev(
        story_id: &str,
        qa: &QaArtifacts,
        iteration: u32,
        metadata: &serde_json::Value,
        repo_url: &str,
    ) -> serde_json::Value {
        serde_json::json!({
            "agentType": "dev",
            "storyId": story_id,
            "gitRepoUrl": repo_url,
            "iterationCount": iteration,
            "acceptanceCriteria": criteria_for(metadata, story_id),
            "qaFeedback": {
                "verdict": qa.verdict,
                "failedTests": qa.report.tests.failed,
                "lintErrors": qa.report.lint_errors,
                "securityIssues": qa.report.security_findings,
                "changeRequests": qa.report.change_requests,
            },
        })
    }
}
