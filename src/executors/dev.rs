//! Dev executor: branch, implement via the agent CLI, verify commits, run
//! tests, push, and open the pull request.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::test_report::{parse_test_summary, TestResults};
use super::{
    await_session, AgentArtifacts, AgentExecutor, AgentResult, DevArtifacts, ExecutorDeps,
    FailureKind, ProgressReporter,
};
use crate::gitops::{validate_ref_component, GitError};
use crate::pipeline::PipelineState;
use crate::queue::Job;
use crate::supervisor::{AgentType, SessionExit, SpawnParams};

static STORY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-\d+$").expect("story id pattern is valid"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevPayload {
    story_id: String,
    git_repo_url: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    iteration_count: u32,
    /// QA feedback carried on rework loops.
    #[serde(default)]
    qa_feedback: Option<serde_json::Value>,
}

pub struct DevExecutor {
    deps: Arc<ExecutorDeps>,
}

impl DevExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    pub fn branch_for_story(story_id: &str) -> String {
        format!("devos/dev/{story_id}")
    }

    fn compose_prompt(payload: &DevPayload, branch: &str) -> String {
        let mut prompt = format!(
            "Implement story {story} on branch {branch}. Write the code and the tests, run \
             the test suite, and commit your work with clear messages.\n",
            story = payload.story_id,
        );
        if !payload.acceptance_criteria.is_empty() {
            prompt.push_str("\nAcceptance criteria:\n");
            for criterion in &payload.acceptance_criteria {
                prompt.push_str(&format!("- {criterion}\n"));
            }
        }
        if let Some(feedback) = &payload.qa_feedback {
            prompt.push_str(&format!(
                "\nThis is rework iteration {}. Address the QA feedback:\n{}\n",
                payload.iteration_count,
                serde_json::to_string_pretty(feedback).unwrap_or_default()
            ));
        }
        prompt
    }

    /// Explicit test run used when the session output had no parseable
    /// summary. Bounded by the test-run budget; anything unparseable after
    /// that yields zero-filled results.
    async fn run_tests_explicitly(&self, dir: &Path, budget: Duration) -> Option<TestResults> {
        let mut command = tokio::process::Command::new("npm");
        command
            .args(["test", "--", "--ci", "--coverage"])
            .current_dir(dir)
            .stdin(std::process::Stdio::null());
        let output = tokio::time::timeout(budget, command.output()).await;
        match output {
            Ok(Ok(output)) => {
                let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(|l| l.to_string())
                    .collect();
                lines.extend(
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .map(|l| l.to_string()),
                );
                parse_test_summary(&lines)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Explicit test run could not start");
                None
            }
            Err(_) => {
                warn!("Explicit test run exceeded its time budget");
                None
            }
        }
    }
}

#[async_trait]
impl AgentExecutor for DevExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Dev
    }

    async fn execute(&self, job: &Job) -> AgentResult {
        let started = Instant::now();
        let deps = &self.deps;

        let payload: DevPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return AgentResult::failure(
                    FailureKind::Fatal,
                    format!("invalid dev job payload: {e}"),
                    None,
                    started.elapsed().as_millis() as u64,
                )
            }
        };
        let agent_id = payload
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("dev-{}", payload.story_id));

        let mut progress = ProgressReporter::new(
            deps.events.clone(),
            AgentType::Dev,
            &job.workspace_id,
            Some(&payload.story_id),
        );

        if let Err((kind, reason)) = super::claim_pipeline(
            deps,
            &job.project_id,
            &job.workspace_id,
            AgentType::Dev,
            &agent_id,
            Some(&payload.story_id),
            Some((PipelineState::Implementing, "dev job started")),
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

impl DevExecutor {
    async fn run(
        &self,
        job: &Job,
        payload: &DevPayload,
        agent_id: &str,
        progress: &mut ProgressReporter,
        started: Instant,
    ) -> AgentResult {
        let deps = &self.deps;
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        // Story identity drives the branch name; both are validated before
        // they reach git or the shell.
        progress.started("reading-story", 5);
        if !STORY_ID.is_match(&payload.story_id) {
            let message = format!("invalid story id '{}'", payload.story_id);
            progress.failed("reading-story", 5, &message);
            return AgentResult::failure(FailureKind::Fatal, message, None, elapsed(started));
        }
        let branch = Self::branch_for_story(&payload.story_id);
        if let Err(e) = validate_ref_component(&branch) {
            progress.failed("reading-story", 5, &e.to_string());
            return AgentResult::failure(
                FailureKind::Fatal,
                e.to_string(),
                None,
                elapsed(started),
            );
        }
        progress.completed("reading-story", 5);

        // Feature branch from main, inside the prepared workspace clone.
        progress.started("creating-branch", 10);
        let workspace_dir = deps
            .config
            .workspace_dir(&job.workspace_id, &job.project_id);
        let branch_result = async {
            deps.git
                .ensure_clone(workspace_dir.clone(), payload.git_repo_url.clone())
                .await?;
            deps.git
                .create_branch_from_base(workspace_dir.clone(), branch.clone())
                .await
        }
        .await;
        if let Err(e) = branch_result {
            progress.failed("creating-branch", 10, &e.to_string());
            return AgentResult::failure(
                FailureKind::Transient,
                format!("branch creation failed: {e}"),
                None,
                elapsed(started),
            );
        }
        progress.completed("creating-branch", 10);

        progress.started("spawning-cli", 15);
        let ticket = deps
            .supervisor
            .clone()
            .spawn(SpawnParams {
                workspace_id: job.workspace_id.clone(),
                project_id: job.project_id.clone(),
                agent_id: agent_id.to_string(),
                agent_type: AgentType::Dev,
                prompt: Self::compose_prompt(payload, &branch),
                story_id: Some(payload.story_id.clone()),
                git_repo_url: payload.git_repo_url.clone(),
                pipeline_snapshot: serde_json::json!({
                    "storyId": payload.story_id,
                    "branch": branch,
                    "iterationCount": payload.iteration_count,
                }),
            })
            .await;
        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(e) => {
                progress.failed("spawning-cli", 15, &e.to_string());
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
        progress.completed("spawning-cli", 15);

        // The CLI streams its work; 20 to 60 percent belongs to it.
        progress.started("writing-code", 20);
        let run = await_session(
            &deps.supervisor,
            ticket,
            Duration::from_secs(deps.config.session_stall_seconds),
        )
        .await;
        let session_id = run.session_id.clone();
        if let SessionExit::Failed { reason, .. } = &run.exit {
            progress.failed("writing-code", 60, reason);
            return AgentResult::failure(
                FailureKind::Cli,
                reason.clone(),
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("writing-code", 60);

        // Test results come from the session output when a runner summary is
        // present, from an explicit bounded run otherwise, and zero-filled as
        // the last resort.
        progress.started("running-tests", 65);
        let output = deps
            .supervisor
            .buffers()
            .get_buffered_output(&session_id)
            .await
            .unwrap_or_default();
        let test_results = match parse_test_summary(&output) {
            Some(results) => results,
            None => {
                info!(
                    story_id = %payload.story_id,
                    "No test summary in session output, running the suite explicitly"
                );
                self.run_tests_explicitly(
                    &workspace_dir,
                    Duration::from_secs(deps.config.test_run_timeout_seconds),
                )
                .await
                .unwrap_or_else(TestResults::zeroed)
            }
        };
        progress.completed("running-tests", 65);

        // The CLI is expected to commit; anything it left in the tree is
        // committed here. A branch with no new commits is a broken run.
        progress.started("committing-code", 75);
        match deps.git.is_dirty(workspace_dir.clone()).await {
            Ok(true) => {
                if let Err(e) = deps
                    .git
                    .commit_all(
                        workspace_dir.clone(),
                        format!("feat: implement story {}", payload.story_id),
                    )
                    .await
                {
                    progress.failed("committing-code", 75, &e.to_string());
                    return AgentResult::failure(
                        FailureKind::Transient,
                        format!("commit failed: {e}"),
                        Some(session_id),
                        elapsed(started),
                    );
                }
            }
            Ok(false) => {}
            Err(e) => {
                progress.failed("committing-code", 75, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        }
        let commits_ahead = match deps
            .git
            .commits_ahead_of_base(workspace_dir.clone(), branch.clone())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                progress.failed("committing-code", 75, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        if commits_ahead == 0 {
            let message = format!(
                "NoCommitsProduced: CLI session finished without new commits on {branch}"
            );
            progress.failed("committing-code", 75, &message);
            return AgentResult::failure(
                FailureKind::Fatal,
                message,
                Some(session_id),
                elapsed(started),
            );
        }
        let commit_hash = match deps.git.head_commit(workspace_dir.clone()).await {
            Ok(hash) => hash,
            Err(e) => {
                progress.failed("committing-code", 75, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        progress.completed("committing-code", 75);

        // Push over the token-embedded URL; one rebase-and-retry on
        // rejection, then the failure is fatal.
        progress.started("pushing-branch", 85);
        let push = deps
            .git
            .push_branch(workspace_dir.clone(), branch.clone())
            .await;
        if let Err(first_error) = push {
            match first_error {
                GitError::PushRejected(_) => {
                    warn!(
                        branch = %branch,
                        error = %first_error,
                        "Push rejected, rebasing once and retrying"
                    );
                    if let Err(e) = deps
                        .git
                        .pull_rebase(workspace_dir.clone(), branch.clone())
                        .await
                    {
                        progress.failed("pushing-branch", 85, &e.to_string());
                        return AgentResult::failure(
                            FailureKind::Fatal,
                            format!("rebase after rejected push failed: {e}"),
                            Some(session_id),
                            elapsed(started),
                        );
                    }
                    if let Err(e) = deps
                        .git
                        .push_branch(workspace_dir.clone(), branch.clone())
                        .await
                    {
                        progress.failed("pushing-branch", 85, &e.to_string());
                        return AgentResult::failure(
                            FailureKind::Fatal,
                            format!("push failed after rebase retry: {e}"),
                            Some(session_id),
                            elapsed(started),
                        );
                    }
                }
                other => {
                    progress.failed("pushing-branch", 85, &other.to_string());
                    return AgentResult::failure(
                        FailureKind::Transient,
                        other.to_string(),
                        Some(session_id),
                        elapsed(started),
                    );
                }
            }
        }
        progress.completed("pushing-branch", 85);

        progress.started("creating-pr", 95);
        let github = match deps.github.for_repo(&payload.git_repo_url) {
            Ok(github) => github,
            Err(e) => {
                progress.failed("creating-pr", 95, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        let pr_title = format!("Story {}: automated implementation", payload.story_id);
        let pr_body = format!(
            "Implements story {story}.\n\nTests: {passed} passed, {failed} failed, {total} total.",
            story = payload.story_id,
            passed = test_results.passed,
            failed = test_results.failed,
            total = test_results.total,
        );
        let pr = match github
            .create_pr_idempotent(&branch, deps.git.base_branch(), &pr_title, &pr_body)
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                progress.failed("creating-pr", 95, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    format!("PR creation failed: {e}"),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        github
            .add_labels(
                pr.number,
                &["devos".to_string(), "automated".to_string()],
            )
            .await;
        progress.completed("creating-pr", 95);

        progress.started("updating-status", 100);
        let changed = deps
            .git
            .changed_files(workspace_dir.clone(), branch.clone())
            .await
            .unwrap_or_default();
        info!(
            story_id = %payload.story_id,
            branch = %branch,
            pr_number = pr.number,
            commits_ahead = commits_ahead,
            "Dev run finished"
        );
        let result = AgentResult::success(
            AgentArtifacts::Dev(DevArtifacts {
                branch,
                commit_hash,
                pr_url: pr.url,
                pr_number: pr.number,
                test_results,
                files_created: changed.created,
                files_modified: changed.modified,
            }),
            Some(session_id),
            elapsed(started),
        );
        progress.completed("updating-status", 100);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_embeds_the_story_id() {
        assert_eq!(DevExecutor::branch_for_story("11-4"), "devos/dev/11-4");
    }

    #[test]
    fn story_id_pattern_matches_epic_dash_number() {
        assert!(STORY_ID.is_match("11-4"));
        assert!(STORY_ID.is_match("3-12"));
        assert!(!STORY_ID.is_match("11-4; rm -rf /"));
        assert!(!STORY_ID.is_match("abc-4"));
        assert!(!STORY_ID.is_match("11_4"));
        assert!(!STORY_ID.is_match(""));
    }
}
