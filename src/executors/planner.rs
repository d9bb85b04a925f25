//! Planner executor: generate planning documents and stories, update the
//! sprint-status manifest, and publish everything to the repository.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::test_report::parse_json_block;
use super::{
    await_session, AgentArtifacts, AgentExecutor, AgentResult, ExecutorDeps, FailureKind,
    PlannerArtifacts, ProgressReporter,
};
use crate::pipeline::PipelineState;
use crate::queue::Job;
use crate::supervisor::{AgentType, SessionExit, SpawnParams};

static STORY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-\d+$").expect("story id pattern is valid"));

pub const SPRINT_STATUS_PATH: &str = "devos/sprint-status.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerPayload {
    git_repo_url: String,
    #[serde(default)]
    epic_id: Option<String>,
    #[serde(default)]
    project_brief: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

/// A story the planner generated, as reported in its JSON block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStory {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannerOutput {
    #[serde(default)]
    documents_generated: Vec<String>,
    #[serde(default)]
    stories: Vec<PlannedStory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SprintStatus {
    #[serde(default)]
    pub epics: BTreeMap<String, EpicStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EpicStatus {
    #[serde(default)]
    pub stories: BTreeMap<String, StoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryEntry {
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Merge planned stories into the manifest. Existing story ids are skipped;
/// of the newly added ones the first becomes `ready-for-dev` and the rest
/// `backlog`. Returns the ids that were actually added.
pub fn update_sprint_status(
    manifest: &mut SprintStatus,
    epic_id: &str,
    stories: &[PlannedStory],
) -> Vec<String> {
    let epic = manifest.epics.entry(epic_id.to_string()).or_default();
    let mut added = Vec::new();
    let mut has_ready = epic
        .stories
        .values()
        .any(|entry| entry.status == "ready-for-dev");
    for story in stories {
        if epic.stories.contains_key(&story.id) {
            continue;
        }
        let status = if !has_ready {
            has_ready = true;
            "ready-for-dev"
        } else {
            "backlog"
        };
        epic.stories.insert(
            story.id.clone(),
            StoryEntry {
                status: status.to_string(),
                title: story.title.clone(),
                depends_on: story.depends_on.clone(),
            },
        );
        added.push(story.id.clone());
    }
    added
}

pub struct PlannerExecutor {
    deps: Arc<ExecutorDeps>,
}

impl PlannerExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    fn compose_prompt(payload: &PlannerPayload) -> String {
        let mut prompt = String::from(
            "Plan the next increment of this project. Write the planning documents under \
             docs/ and break the work into stories with ids of the form <epic>-<n>. Finish \
             by printing a fenced json block with fields: documentsGenerated (paths) and \
             stories (id, title, dependsOn, acceptanceCriteria).\n",
        );
        if let Some(epic) = &payload.epic_id {
            prompt.push_str(&format!("\nPlan under epic {epic}.\n"));
        }
        if let Some(brief) = &payload.project_brief {
            prompt.push_str(&format!("\nProject brief:\n{brief}\n"));
        }
        prompt
    }

    /// Planning documents must exist and carry the expected template shape:
    /// a top-level title, and an acceptance-criteria section for story docs.
    async fn validate_documents(
        workspace: &Path,
        documents: &[String],
    ) -> Result<(), String> {
        for doc in documents {
            if doc.contains("..") || doc.starts_with('/') {
                return Err(format!("document path '{doc}' escapes the workspace"));
            }
            let path = workspace.join(doc);
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| format!("planning document '{doc}' is unreadable: {e}"))?;
            if !content.trim_start().starts_with("# ") {
                return Err(format!(
                    "planning document '{doc}' does not start with a title heading"
                ));
            }
            if doc.contains("stories/") && !content.contains("## Acceptance Criteria") {
                return Err(format!(
                    "story document '{doc}' is missing the acceptance criteria section"
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentExecutor for PlannerExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Planner
    }

    async fn execute(&self, job: &Job) -> AgentResult {
        let started = Instant::now();
        let deps = &self.deps;

        let payload: PlannerPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return AgentResult::failure(
                    FailureKind::Fatal,
                    format!("invalid planner job payload: {e}"),
                    None,
                    started.elapsed().as_millis() as u64,
                )
            }
        };
        let agent_id = payload
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("planner-{}", job.project_id));

        let mut progress = ProgressReporter::new(
            deps.events.clone(),
            AgentType::Planner,
            &job.workspace_id,
            None,
        );

        if let Err((kind, reason)) = super::claim_pipeline(
            deps,
            &job.project_id,
            &job.workspace_id,
            AgentType::Planner,
            &agent_id,
            None,
            Some((PipelineState::Planning, "planner job started")),
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

impl PlannerExecutor {
    async fn run(
        &self,
        job: &Job,
        payload: &PlannerPayload,
        agent_id: &str,
        progress: &mut ProgressReporter,
        started: Instant,
    ) -> AgentResult {
        let deps = &self.deps;
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        progress.started("reading-project-context", 10);
        let workspace_dir = deps
            .config
            .workspace_dir(&job.workspace_id, &job.project_id);
        if let Err(e) = deps
            .git
            .ensure_clone(workspace_dir.clone(), payload.git_repo_url.clone())
            .await
        {
            progress.failed("reading-project-context", 10, &e.to_string());
            return AgentResult::failure(
                FailureKind::Transient,
                e.to_string(),
                None,
                elapsed(started),
            );
        }
        progress.completed("reading-project-context", 10);

        progress.started("spawning-cli", 20);
        let ticket = deps
            .supervisor
            .clone()
            .spawn(SpawnParams {
                workspace_id: job.workspace_id.clone(),
                project_id: job.project_id.clone(),
                agent_id: agent_id.to_string(),
                agent_type: AgentType::Planner,
                prompt: Self::compose_prompt(payload),
                story_id: None,
                git_repo_url: payload.git_repo_url.clone(),
                pipeline_snapshot: serde_json::json!({
                    "epicId": payload.epic_id,
                }),
            })
            .await;
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(e) => {
                progress.failed("spawning-cli", 20, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Cli,
                    e.to_string(),
                    None,
                    elapsed(started),
                );
            }
        };
        progress.set_session(&ticket.session_id);
        deps.queue.register_session(&job.id, &ticket.session_id);
        progress.completed("spawning-cli", 20);

        progress.started("generating-documents", 30);
        let run = await_session(
            &deps.supervisor,
            ticket,
            Duration::from_secs(deps.config.session_stall_seconds),
        )
        .await;
        let session_id = run.session_id.clone();
        if let SessionExit::Failed { reason, .. } = &run.exit {
            progress.failed("generating-documents", 60, reason);
            return AgentResult::failure(
                FailureKind::Cli,
                reason.clone(),
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("generating-documents", 60);

        progress.started("validating-documents", 70);
        let output = deps
            .supervisor
            .buffers()
            .get_buffered_output(&session_id)
            .await
            .unwrap_or_default();
        let Some(planner_output) = parse_json_block::<PlannerOutput>(&output) else {
            progress.failed("validating-documents", 70, "no planner output block");
            return AgentResult::failure(
                FailureKind::Cli,
                "planner session produced no structured output",
                Some(session_id),
                elapsed(started),
            );
        };
        if planner_output.stories.is_empty() {
            progress.failed("validating-documents", 70, "planner produced no stories");
            return AgentResult::failure(
                FailureKind::Fatal,
                "planner produced no stories",
                Some(session_id),
                elapsed(started),
            );
        }
        for story in &planner_output.stories {
            if !STORY_ID.is_match(&story.id) {
                let message = format!("planner produced invalid story id '{}'", story.id);
                progress.failed("validating-documents", 70, &message);
                return AgentResult::failure(
                    FailureKind::Fatal,
                    message,
                    Some(session_id),
                    elapsed(started),
                );
            }
        }
        if let Err(message) =
            Self::validate_documents(&workspace_dir, &planner_output.documents_generated).await
        {
            progress.failed("validating-documents", 70, &message);
            return AgentResult::failure(
                FailureKind::Fatal,
                message,
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("validating-documents", 70);

        // Sprint-status manifest update, idempotent by story id.
        progress.started("updating-sprint-status", 80);
        let epic_id = payload.epic_id.clone().unwrap_or_else(|| {
            planner_output
                .stories
                .first()
                .and_then(|s| s.id.split('-').next().map(|e| e.to_string()))
                .unwrap_or_else(|| "1".to_string())
        });
        let manifest_path = workspace_dir.join(SPRINT_STATUS_PATH);
        let mut manifest: SprintStatus = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => SprintStatus::default(),
        };
        let added = update_sprint_status(&mut manifest, &epic_id, &planner_output.stories);
        let write = async {
            if let Some(parent) = manifest_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        if let Err(e) = write {
            progress.failed("updating-sprint-status", 80, &e.to_string());
            return AgentResult::failure(
                FailureKind::Transient,
                e.to_string(),
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("updating-sprint-status", 80);

        progress.started("committing-and-pushing", 90);
        let base_branch = deps.git.base_branch().to_string();
        let commit_hash = match async {
            let hash = if deps.git.is_dirty(workspace_dir.clone()).await? {
                Some(
                    deps.git
                        .commit_all(
                            workspace_dir.clone(),
                            format!("docs: plan stories for epic {epic_id}"),
                        )
                        .await?,
                )
            } else {
                None
            };
            deps.git
                .push_branch(workspace_dir.clone(), base_branch.clone())
                .await?;
            Ok::<Option<String>, crate::gitops::GitError>(hash)
        }
        .await
        {
            Ok(hash) => hash,
            Err(e) => {
                progress.failed("committing-and-pushing", 90, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        progress.completed("committing-and-pushing", 90);

        // Story metadata feeds the handoff projections and the dependency
        // rule.
        progress.started("updating-status", 100);
        let stories_value: serde_json::Value = planner_output
            .stories
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    serde_json::json!({
                        "title": s.title,
                        "dependsOn": s.depends_on,
                        "acceptanceCriteria": s.acceptance_criteria,
                        "documents": planner_output.documents_generated,
                    }),
                )
            })
            .collect::<serde_json::Map<String, serde_json::Value>>()
            .into();
        let _ = deps
            .pipeline
            .merge_metadata(
                &job.project_id,
                serde_json::json!({ "stories": stories_value, "epicId": epic_id }),
            )
            .await;

        info!(
            project_id = %job.project_id,
            epic_id = %epic_id,
            stories_added = added.len(),
            "Planner run finished"
        );
        let result = AgentResult::success(
            AgentArtifacts::Planner(PlannerArtifacts {
                documents_generated: planner_output.documents_generated,
                stories_created: planner_output.stories.iter().map(|s| s.id.clone()).collect(),
                commit_hash,
            }),
            Some(session_id),
            elapsed(started),
        );
        progress.completed("updating-status", 100);
        result
    }
}
