//! Coordination rules: declarative checks a completing result must pass
//! before the next agent is scheduled.

use crate::executors::{AgentArtifacts, AgentResult, Verdict};
use crate::pipeline::PipelineContext;
use crate::supervisor::AgentType;

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    pub from: AgentType,
    pub result: &'a AgentResult,
    pub pipeline: &'a PipelineContext,
}

type Check = fn(&RuleContext) -> Result<(), String>;

pub struct Rule {
    pub name: &'static str,
    pub check: Check,
}

/// The completing result must carry the fields its receiver depends on.
fn required_fields(ctx: &RuleContext) -> Result<(), String> {
    match (ctx.from, &ctx.result.artifacts) {
        (AgentType::Planner, Some(AgentArtifacts::Planner(planner))) => {
            if planner.stories_created.is_empty() {
                Err("planner result has no stories".to_string())
            } else {
                Ok(())
            }
        }
        (AgentType::Dev, Some(AgentArtifacts::Dev(dev))) => {
            if dev.branch.is_empty() || dev.pr_url.is_empty() || dev.pr_number == 0 {
                Err("dev result is missing branch or PR information".to_string())
            } else if dev.commit_hash.len() != 40
                || !dev.commit_hash.chars().all(|c| c.is_ascii_hexdigit())
            {
                Err(format!(
                    "dev result commit hash '{}' is not a full sha",
                    dev.commit_hash
                ))
            } else {
                Ok(())
            }
        }
        (AgentType::Qa, Some(AgentArtifacts::Qa(_))) => Ok(()),
        (AgentType::Devops, Some(AgentArtifacts::Devops(_))) => Ok(()),
        (from, _) => Err(format!("{from} result carries no matching artifacts")),
    }
}

/// The result's verdict must be one the pipeline can act on from its
/// current state.
fn verdict_compatible(ctx: &RuleContext) -> Result<(), String> {
    if !ctx.result.success {
        return Err("cannot hand off a failed result".to_string());
    }
    if let Some(AgentArtifacts::Qa(qa)) = &ctx.result.artifacts {
        // Any QA verdict is routable; rework additionally needs budget,
        // which the retry rule checks.
        let _ = qa.verdict;
    }
    Ok(())
}

/// Rework loops stop once the retry budget is exhausted.
fn retry_budget(ctx: &RuleContext) -> Result<(), String> {
    if let Some(AgentArtifacts::Qa(qa)) = &ctx.result.artifacts {
        if qa.verdict != Verdict::Pass && ctx.pipeline.retry_count >= ctx.pipeline.max_retries {
            return Err(format!(
                "retry budget exhausted: iteration {} of {}",
                ctx.pipeline.retry_count, ctx.pipeline.max_retries
            ));
        }
    }
    Ok(())
}

/// A story cannot move into implementation while a declared predecessor is
/// not completed.
fn story_dependency(ctx: &RuleContext) -> Result<(), String> {
    let Some(story_id) = next_story_for(ctx) else {
        return Ok(());
    };
    let metadata = &ctx.pipeline.metadata;
    let depends_on: Vec<String> = metadata
        .get("stories")
        .and_then(|stories| stories.get(&story_id))
        .and_then(|story| story.get("dependsOn"))
        .and_then(|deps| deps.as_array())
        .map(|deps| {
            deps.iter()
                .filter_map(|d| d.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if depends_on.is_empty() {
        return Ok(());
    }
    let completed: Vec<String> = metadata
        .get("completedStories")
        .and_then(|c| c.as_array())
        .map(|c| {
            c.iter()
                .filter_map(|s| s.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    for dependency in &depends_on {
        if !completed.contains(dependency) {
            return Err(format!(
                "story {story_id} depends on {dependency}, which is not completed"
            ));
        }
    }
    Ok(())
}

/// The story that would start implementing if this handoff is accepted.
fn next_story_for(ctx: &RuleContext) -> Option<String> {
    match &ctx.result.artifacts {
        Some(AgentArtifacts::Planner(planner)) => planner.stories_created.first().cloned(),
        Some(AgentArtifacts::Qa(qa)) if qa.verdict != Verdict::Pass => {
            ctx.pipeline.current_story_id.clone()
        }
        _ => None,
    }
}

const RULES: &[Rule] = &[
    Rule {
        name: "required-fields",
        check: required_fields,
    },
    Rule {
        name: "verdict-compatible",
        check: verdict_compatible,
    },
    Rule {
        name: "retry-budget",
        check: retry_budget,
    },
    Rule {
        name: "story-dependency",
        check: story_dependency,
    },
];

/// Run every rule; the first violation wins.
pub fn evaluate(ctx: &RuleContext) -> Result<(), (&'static str, String)> {
    for rule in RULES {
        (rule.check)(ctx).map_err(|reason| (rule.name, reason))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::{
        DevArtifacts, PlannerArtifacts, QaArtifacts, QaReport, TestResults,
    };
    use crate::pipeline::PipelineState;
    use chrono::Utc;

    fn pipeline_ctx(retry_count: u32, metadata: serde_json::Value) -> PipelineContext {
        PipelineContext {
            project_id: "proj".to_string(),
            workspace_id: "ws".to_string(),
            workflow_id: "bmad-proj".to_string(),
            current_state: PipelineState::InQa,
            previous_state: None,
            state_entered_at: Utc::now(),
            active_agent_id: None,
            active_agent_type: None,
            current_story_id: Some("11-4".to_string()),
            retry_count,
            max_retries: 3,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn qa_result(verdict: Verdict) -> AgentResult {
        AgentResult::success(
            crate::executors::AgentArtifacts::Qa(QaArtifacts {
                verdict,
                report: QaReport {
                    tests: TestResults::zeroed(),
                    coverage_percent: None,
                    lint_errors: 0,
                    lint_warnings: 0,
                    type_errors: 0,
                    security_findings: vec![],
                    secret_findings: vec![],
                    acceptance_criteria: vec![],
                    change_requests: vec![],
                    additional_tests_written: 0,
                    summary: None,
                },
                additional_tests_written: 0,
            }),
            None,
            10,
        )
    }

    fn dev_result() -> AgentResult {
        AgentResult::success(
            crate::executors::AgentArtifacts::Dev(DevArtifacts {
                branch: "devos/dev/11-4".to_string(),
                commit_hash: "ab".repeat(20),
                pr_url: "https://github.com/o/r/pull/42".to_string(),
                pr_number: 42,
                test_results: TestResults::zeroed(),
                files_created: vec![],
                files_modified: vec![],
            }),
            None,
            10,
        )
    }

    #[test]
    fn complete_dev_result_passes_all_rules() {
        let pipeline = pipeline_ctx(0, serde_json::json!({}));
        let result = dev_result();
        let ctx = RuleContext {
            from: AgentType::Dev,
            result: &result,
            pipeline: &pipeline,
        };
        assert!(evaluate(&ctx).is_ok());
    }

    #[test]
    fn short_commit_hash_is_rejected() {
        let pipeline = pipeline_ctx(0, serde_json::json!({}));
        let mut result = dev_result();
        if let Some(AgentArtifacts::Dev(dev)) = result.artifacts.as_mut() {
            dev.commit_hash = "abc123".to_string();
        }
        let ctx = RuleContext {
            from: AgentType::Dev,
            result: &result,
            pipeline: &pipeline,
        };
        let (rule, _) = evaluate(&ctx).unwrap_err();
        assert_eq!(rule, "required-fields");
    }

    #[test]
    fn planner_without_stories_is_rejected() {
        let pipeline = pipeline_ctx(0, serde_json::json!({}));
        let result = AgentResult::success(
            crate::executors::AgentArtifacts::Planner(PlannerArtifacts {
                documents_generated: vec!["docs/prd.md".to_string()],
                stories_created: vec![],
                commit_hash: None,
            }),
            None,
            10,
        );
        let ctx = RuleContext {
            from: AgentType::Planner,
            result: &result,
            pipeline: &pipeline,
        };
        let (rule, _) = evaluate(&ctx).unwrap_err();
        assert_eq!(rule, "required-fields");
    }

    #[test]
    fn exhausted_retry_budget_rejects_rework() {
        let pipeline = pipeline_ctx(3, serde_json::json!({}));
        let result = qa_result(Verdict::Fail);
        let ctx = RuleContext {
            from: AgentType::Qa,
            result: &result,
            pipeline: &pipeline,
        };
        let (rule, _) = evaluate(&ctx).unwrap_err();
        assert_eq!(rule, "retry-budget");
    }

    #[test]
    fn qa_pass_ignores_retry_budget() {
        let pipeline = pipeline_ctx(3, serde_json::json!({}));
        let result = qa_result(Verdict::Pass);
        let ctx = RuleContext {
            from: AgentType::Qa,
            result: &result,
            pipeline: &pipeline,
        };
        assert!(evaluate(&ctx).is_ok());
    }

    #[test]
    fn unmet_story_dependency_blocks_implementation() {
        let metadata = serde_json::json!({
            "stories": {
                "11-4": { "dependsOn": ["11-3"] },
            },
            "completedStories": ["11-1"],
        });
        let pipeline = pipeline_ctx(0, metadata);
        let result = AgentResult::success(
            crate::executors::AgentArtifacts::Planner(PlannerArtifacts {
                documents_generated: vec![],
                stories_created: vec!["11-4".to_string()],
                commit_hash: None,
            }),
            None,
            10,
        );
        let ctx = RuleContext {
            from: AgentType::Planner,
            result: &result,
            pipeline: &pipeline,
        };
        let (rule, reason) = evaluate(&ctx).unwrap_err();
        assert_eq!(rule, "story-dependency");
        assert!(reason.contains("11-3"));
    }

    #[test]
    fn satisfied_story_dependency_passes() {
        let metadata = serde_json::json!({
            "stories": {
                "11-4": { "dependsOn": ["11-3"] },
            },
            "completedStories": ["11-3"],
        });
        let pipeline = pipeline_ctx(0, metadata);
        let result = AgentResult::success(
            crate::executors::AgentArtifacts::Planner(PlannerArtifacts {
                documents_generated: vec![],
                stories_created: vec!["11-4".to_string()],
                commit_hash: None,
            }),
            None,
            10,
        );
        let ctx = RuleContext {
            from: AgentType::Planner,
            result: &result,
            pipeline: &pipeline,
        };
        assert!(evaluate(&ctx).is_ok());
    }
}
