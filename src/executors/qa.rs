//! QA executor: check out the dev branch, run the QA agent session, derive
//! a verdict from its structured report, and submit the PR review.
//!
//! QA never merges the PR; the verdict routes the story onward (or back to
//! Dev) through the handoff coordinator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::test_report::{parse_json_block, TestResults};
use super::{
    await_session, AgentArtifacts, AgentExecutor, AgentResult, ExecutorDeps, FailureKind,
    ProgressReporter, QaArtifacts, Verdict,
};
use crate::github::ReviewEvent;
use crate::queue::Job;
use crate::supervisor::{AgentType, SessionExit, SpawnParams};

/// Coverage below this is a gap; at or above it satisfies the PASS rule.
const COVERAGE_THRESHOLD: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    pub severity: FindingSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionResult {
    pub criterion: String,
    pub met: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// The structured report the QA agent prints as a fenced JSON block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaReport {
    pub tests: TestResults,
    #[serde(default)]
    pub coverage_percent: Option<f64>,
    #[serde(default)]
    pub lint_errors: u32,
    #[serde(default)]
    pub lint_warnings: u32,
    #[serde(default)]
    pub type_errors: u32,
    #[serde(default)]
    pub security_findings: Vec<SecurityFinding>,
    #[serde(default)]
    pub secret_findings: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<CriterionResult>,
    #[serde(default)]
    pub change_requests: Vec<String>,
    #[serde(default)]
    pub additional_tests_written: u32,
    #[serde(default)]
    pub summary: Option<String>,
}

impl QaReport {
    fn worst_security_severity(&self) -> Option<FindingSeverity> {
        self.security_findings.iter().map(|f| f.severity).max()
    }

    fn coverage(&self) -> Option<f64> {
        self.coverage_percent.or(self.tests.coverage_percent)
    }

    /// Verdict rules:
    /// - FAIL on any test failure, any critical security finding (leaked
    ///   secrets count), or any unmet acceptance criterion.
    /// - PASS when tests pass, coverage meets the threshold, there are no
    ///   high or critical findings, and no lint/type noise remains.
    /// - NEEDS_CHANGES for everything in between (warning-level issues,
    ///   minor coverage gaps, high-severity-but-not-critical findings).
    pub fn derive_verdict(&self) -> Verdict {
        let criteria_met = self.acceptance_criteria.iter().all(|c| c.met);
        if self.tests.failed > 0
            || self.worst_security_severity() == Some(FindingSeverity::Critical)
            || !self.secret_findings.is_empty()
            || !criteria_met
        {
            return Verdict::Fail;
        }

        let coverage_ok = self
            .coverage()
            .map(|c| c >= COVERAGE_THRESHOLD)
            .unwrap_or(true);
        let no_high_findings = self
            .worst_security_severity()
            .map(|s| s < FindingSeverity::High)
            .unwrap_or(true);
        let clean_static_analysis =
            self.lint_errors == 0 && self.lint_warnings == 0 && self.type_errors == 0;

        if self.tests.all_passed() && coverage_ok && no_high_findings && clean_static_analysis {
            Verdict::Pass
        } else {
            Verdict::NeedsChanges
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QaPayload {
    story_id: String,
    branch: String,
    pr_url: String,
    pr_number: u64,
    git_repo_url: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

pub struct QaExecutor {
    deps: Arc<ExecutorDeps>,
}

impl QaExecutor {
    pub fn new(deps: Arc<ExecutorDeps>) -> Self {
        Self { deps }
    }

    fn compose_prompt(payload: &QaPayload) -> String {
        let mut prompt = format!(
            "Review the implementation of story {story} on branch {branch} (PR: {pr}).\n\
             Run the full test suite, the linter and type checker, a security scan, and a \
             secret scan.\n\
             Validate each acceptance criterion and finish by printing a QA report as a \
             fenced json block with fields: tests, coveragePercent, lintErrors, lintWarnings, \
             typeErrors, securityFindings, secretFindings, acceptanceCriteria, changeRequests, \
             additionalTestsWritten, summary.\n",
            story = payload.story_id,
            branch = payload.branch,
            pr = payload.pr_url,
        );
        if !payload.acceptance_criteria.is_empty() {
            prompt.push_str("\nAcceptance criteria:\n");
            for criterion in &payload.acceptance_criteria {
                prompt.push_str(&format!("- {criterion}\n"));
            }
        }
        prompt
    }
}

#[async_trait]
impl AgentExecutor for QaExecutor {
    fn agent_type(&self) -> AgentType {
        AgentType::Qa
    }

    async fn execute(&self, job: &Job) -> AgentResult {
        let started = Instant::now();
        let deps = &self.deps;

        let payload: QaPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                return AgentResult::failure(
                    FailureKind::Fatal,
                    format!("invalid QA job payload: {e}"),
                    None,
                    started.elapsed().as_millis() as u64,
                )
            }
        };
        let agent_id = payload
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("qa-{}", payload.story_id));

        let mut progress = ProgressReporter::new(
            deps.events.clone(),
            AgentType::Qa,
            &job.workspace_id,
            Some(&payload.story_id),
        );

        if let Err((kind, reason)) = super::claim_pipeline(
            deps,
            &job.project_id,
            &job.workspace_id,
            AgentType::Qa,
            &agent_id,
            Some(&payload.story_id),
            None,
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

impl QaExecutor {
    async fn run(
        &self,
        job: &Job,
        payload: &QaPayload,
        agent_id: &str,
        progress: &mut ProgressReporter,
        started: Instant,
    ) -> AgentResult {
        let deps = &self.deps;
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        // Checkout the branch under review.
        progress.started("checking-out-branch", 10);
        let workspace_dir = deps
            .config
            .workspace_dir(&job.workspace_id, &job.project_id);
        let checkout = async {
            deps.git
                .fetch_branch(workspace_dir.clone(), payload.branch.clone())
                .await?;
            deps.git
                .checkout_branch(workspace_dir.clone(), payload.branch.clone())
                .await
        }
        .await;
        if let Err(e) = checkout {
            progress.failed("checking-out-branch", 10, &e.to_string());
            return AgentResult::failure(
                FailureKind::Transient,
                format!("checkout of {} failed: {e}", payload.branch),
                None,
                elapsed(started),
            );
        }
        progress.completed("checking-out-branch", 10);

        // QA agent session runs the suite, the scanners, and the criteria
        // validation, then prints its report.
        progress.started("spawning-cli", 20);
        let ticket = deps
            .supervisor
            .clone()
            .spawn(SpawnParams {
                workspace_id: job.workspace_id.clone(),
                project_id: job.project_id.clone(),
                agent_id: agent_id.to_string(),
                agent_type: AgentType::Qa,
                prompt: Self::compose_prompt(payload),
                story_id: Some(payload.story_id.clone()),
                git_repo_url: payload.git_repo_url.clone(),
                pipeline_snapshot: serde_json::json!({
                    "storyId": payload.story_id,
                    "branch": payload.branch,
                    "prUrl": payload.pr_url,
                    "prNumber": payload.pr_number,
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

        progress.started("running-qa-checks", 30);
        let run = await_session(
            &deps.supervisor,
            ticket,
            Duration::from_secs(deps.config.session_stall_seconds),
        )
        .await;
        let session_id = run.session_id.clone();
        if let SessionExit::Failed { reason, .. } = &run.exit {
            progress.failed("running-qa-checks", 70, reason);
            return AgentResult::failure(
                FailureKind::Cli,
                reason.clone(),
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("running-qa-checks", 70);

        // Structured report extraction.
        progress.started("generating-report", 80);
        let output = deps
            .supervisor
            .buffers()
            .get_buffered_output(&session_id)
            .await
            .unwrap_or_default();
        let Some(report) = parse_json_block::<QaReport>(&output) else {
            progress.failed("generating-report", 80, "no QA report in session output");
            return AgentResult::failure(
                FailureKind::Cli,
                "QA session produced no structured report",
                Some(session_id),
                elapsed(started),
            );
        };
        let verdict = report.derive_verdict();
        progress.completed("generating-report", 80);
        info!(
            story_id = %payload.story_id,
            verdict = %verdict,
            failed_tests = report.tests.failed,
            "QA verdict derived"
        );

        // The review reflects the verdict; QA never merges.
        progress.started("submitting-review", 90);
        let github = match deps.github.for_repo(&payload.git_repo_url) {
            Ok(github) => github,
            Err(e) => {
                progress.failed("submitting-review", 90, &e.to_string());
                return AgentResult::failure(
                    FailureKind::Transient,
                    e.to_string(),
                    Some(session_id),
                    elapsed(started),
                );
            }
        };
        let (event, body) = match verdict {
            Verdict::Pass => (
                ReviewEvent::Approve,
                format!(
                    "QA PASS for story {}.\n\n{}",
                    payload.story_id,
                    report.summary.clone().unwrap_or_default()
                ),
            ),
            _ => (
                ReviewEvent::RequestChanges,
                format!(
                    "QA {} for story {}.\n\nChange requests:\n{}",
                    verdict,
                    payload.story_id,
                    report
                        .change_requests
                        .iter()
                        .map(|c| format!("- {c}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                ),
            ),
        };
        if let Err(e) = github.submit_review(payload.pr_number, event, &body).await {
            progress.failed("submitting-review", 90, &e.to_string());
            return AgentResult::failure(
                FailureKind::Transient,
                format!("review submission failed: {e}"),
                Some(session_id),
                elapsed(started),
            );
        }
        progress.completed("submitting-review", 90);

        progress.started("updating-status", 100);
        let additional_tests_written = report.additional_tests_written;
        let result = AgentResult::success(
            AgentArtifacts::Qa(QaArtifacts {
                verdict,
                report,
                additional_tests_written,
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

    fn clean_report() -> QaReport {
        QaReport {
            tests: TestResults {
                total: 15,
                passed: 15,
                failed: 0,
                skipped: 0,
                coverage_percent: Some(92.0),
            },
            coverage_percent: None,
            lint_errors: 0,
            lint_warnings: 0,
            type_errors: 0,
            security_findings: vec![],
            secret_findings: vec![],
            acceptance_criteria: vec![CriterionResult {
                criterion: "login works".to_string(),
                met: true,
                notes: None,
            }],
            change_requests: vec![],
            additional_tests_written: 2,
            summary: Some("all good".to_string()),
        }
    }

    #[test]
    fn clean_report_passes() {
        assert_eq!(clean_report().derive_verdict(), Verdict::Pass);
    }

    #[test]
    fn test_failures_fail_the_story() {
        let mut report = clean_report();
        report.tests.failed = 3;
        report.tests.passed = 12;
        assert_eq!(report.derive_verdict(), Verdict::Fail);
    }

    #[test]
    fn critical_security_finding_fails_the_story() {
        let mut report = clean_report();
        report.security_findings.push(SecurityFinding {
            severity: FindingSeverity::Critical,
            description: "SQL injection in search".to_string(),
        });
        assert_eq!(report.derive_verdict(), Verdict::Fail);
    }

    #[test]
    fn leaked_secret_fails_the_story() {
        let mut report = clean_report();
        report.secret_findings.push(".env committed".to_string());
        assert_eq!(report.derive_verdict(), Verdict::Fail);
    }

    #[test]
    fn unmet_criterion_fails_the_story() {
        let mut report = clean_report();
        report.acceptance_criteria.push(CriterionResult {
            criterion: "emails are sent".to_string(),
            met: false,
            notes: None,
        });
        assert_eq!(report.derive_verdict(), Verdict::Fail);
    }

    #[test]
    fn lint_warnings_alone_need_changes() {
        let mut report = clean_report();
        report.lint_warnings = 4;
        assert_eq!(report.derive_verdict(), Verdict::NeedsChanges);
    }

    #[test]
    fn high_but_not_critical_finding_needs_changes() {
        let mut report = clean_report();
        report.security_findings.push(SecurityFinding {
            severity: FindingSeverity::High,
            description: "weak hash for tokens".to_string(),
        });
        assert_eq!(report.derive_verdict(), Verdict::NeedsChanges);
    }

    #[test]
    fn coverage_gap_needs_changes() {
        let mut report = clean_report();
        report.tests.coverage_percent = Some(61.5);
        assert_eq!(report.derive_verdict(), Verdict::NeedsChanges);
    }

    #[test]
    fn report_json_round_trips_from_cli_output() {
        let lines: Vec<String> = r#"
running checks...
```json
{
  "tests": { "total": 15, "passed": 12, "failed": 3, "skipped": 0, "coveragePercent": 88.0 },
  "lintErrors": 0,
  "acceptanceCriteria": [ { "criterion": "x", "met": true } ],
  "changeRequests": ["fix X", "fix Y"]
}
```
"#
        .lines()
        .map(|l| l.to_string())
        .collect();
        let report: QaReport = parse_json_block(&lines).unwrap();
        assert_eq!(report.tests.failed, 3);
        assert_eq!(report.change_requests.len(), 2);
        assert_eq!(report.derive_verdict(), Verdict::Fail);
    }
}
