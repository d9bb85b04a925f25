//! GitHub gateway: pull requests, labels, and reviews over octocrab.
//!
//! The orchestrator's only GitHub surface. PR creation is idempotent, label
//! application is best-effort, and merge failures are mapped onto the error
//! taxonomy (409 is a merge conflict, 403/422 a branch-protection
//! violation) so the DevOps executor can report them precisely.

use async_trait::async_trait;
use octocrab::params::pulls::MergeMethod;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::scrub::scrub;

#[derive(Debug, Error)]
pub enum GitHubGatewayError {
    #[error("merge conflict: {0}")]
    MergeConflict(String),

    #[error("branch protection violation: {0}")]
    BranchProtectionViolation(String),

    #[error("pull request not found: {0}")]
    NotFound(String),

    #[error("GitHub API error: {0}")]
    Api(String),
}

impl From<octocrab::Error> for GitHubGatewayError {
    fn from(e: octocrab::Error) -> Self {
        GitHubGatewayError::Api(scrub(&e.to_string()))
    }
}

fn status_code_of(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

/// Merge strategy for landing a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Squash
    }
}

impl From<MergeStrategy> for MergeMethod {
    fn from(strategy: MergeStrategy) -> Self {
        match strategy {
            MergeStrategy::Squash => MergeMethod::Squash,
            MergeStrategy::Merge => MergeMethod::Merge,
            MergeStrategy::Rebase => MergeMethod::Rebase,
        }
    }
}

/// Review verdict posted on a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewEvent {
    fn api_value(&self) -> &'static str {
        match self {
            ReviewEvent::Approve => "APPROVE",
            ReviewEvent::RequestChanges => "REQUEST_CHANGES",
            ReviewEvent::Comment => "COMMENT",
        }
    }
}

/// The PR facts executors care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
}

/// Trait seam over GitHub operations so executors can be tested with mocks.
#[async_trait]
pub trait GitHubOps: Send + Sync {
    async fn create_pr_idempotent(
        &self,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo, GitHubGatewayError>;

    async fn find_open_pr_for_branch(
        &self,
        head_branch: &str,
    ) -> Result<Option<PrInfo>, GitHubGatewayError>;

    /// Best-effort: failures are logged, never fatal.
    async fn add_labels(&self, pr_number: u64, labels: &[String]);

    /// Merge the PR; returns the merge commit SHA.
    async fn merge_pr(
        &self,
        pr_number: u64,
        strategy: MergeStrategy,
    ) -> Result<String, GitHubGatewayError>;

    async fn submit_review(
        &self,
        pr_number: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<(), GitHubGatewayError>;
}

pub struct GitHubGateway {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubGateway {
    pub fn new(token: String, owner: String, repo: String) -> Result<Self, GitHubGatewayError> {
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self {
            octocrab,
            owner,
            repo,
        })
    }

    /// Build a gateway from an HTTPS or SSH repository URL.
    pub fn from_repo_url(token: String, repo_url: &str) -> Result<Self, GitHubGatewayError> {
        let (owner, repo) = parse_owner_repo(repo_url).ok_or_else(|| {
            GitHubGatewayError::Api(format!("cannot parse owner/repo from '{}'", scrub(repo_url)))
        })?;
        Self::new(token, owner, repo)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn pr_info(&self, pr: &octocrab::models::pulls::PullRequest) -> PrInfo {
        let url = pr
            .html_url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| {
                format!(
                    "https://github.com/{}/{}/pull/{}",
                    self.owner, self.repo, pr.number
                )
            });
        PrInfo {
            number: pr.number,
            url,
            head_branch: pr.head.ref_field.clone(),
        }
    }
}

/// Extract `(owner, repo)` from the usual GitHub remote URL shapes.
pub fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("http://github.com/"))
        .or_else(|| url.strip_prefix("git@github.com:"))?;
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let mut parts = rest.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.trim_end_matches('/').to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

#[async_trait]
impl GitHubOps for GitHubGateway {
    async fn create_pr_idempotent(
        &self,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo, GitHubGatewayError> {
        let created = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(title, head_branch, base_branch)
            .body(body)
            .send()
            .await;

        match created {
            Ok(pr) => {
                info!(pr_number = pr.number, head = %head_branch, "Created pull request");
                Ok(self.pr_info(&pr))
            }
            Err(e) if status_code_of(&e) == Some(422) => {
                // A PR already exists for this branch; return it instead.
                match self.find_open_pr_for_branch(head_branch).await? {
                    Some(existing) => {
                        info!(
                            pr_number = existing.number,
                            head = %head_branch,
                            "Pull request already exists, reusing"
                        );
                        Ok(existing)
                    }
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_open_pr_for_branch(
        &self,
        head_branch: &str,
    ) -> Result<Option<PrInfo>, GitHubGatewayError> {
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .head(format!("{}:{}", self.owner, head_branch))
            .per_page(10)
            .send()
            .await?;
        Ok(page
            .items
            .iter()
            .find(|pr| pr.head.ref_field == head_branch)
            .map(|pr| self.pr_info(pr)))
    }

    async fn add_labels(&self, pr_number: u64, labels: &[String]) {
        let result = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .add_labels(pr_number, labels)
            .await;
        if let Err(e) = result {
            warn!(
                pr_number = pr_number,
                error = %scrub(&e.to_string()),
                "Failed to add labels to pull request"
            );
        }
    }

    async fn merge_pr(
        &self,
        pr_number: u64,
        strategy: MergeStrategy,
    ) -> Result<String, GitHubGatewayError> {
        let merged = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .merge(pr_number)
            .method(octocrab::params::pulls::MergeMethod::from(strategy))
            .send()
            .await;

        match merged {
            Ok(result) if result.merged => {
                let sha = result.sha.unwrap_or_default();
                info!(pr_number = pr_number, sha = %sha, "Merged pull request");
                Ok(sha)
            }
            Ok(result) => Err(GitHubGatewayError::Api(format!(
                "PR #{pr_number} merge was not successful (sha: {:?})",
                result.sha
            ))),
            Err(e) => match status_code_of(&e) {
                Some(409) => Err(GitHubGatewayError::MergeConflict(format!(
                    "PR #{pr_number} has conflicts with its base branch"
                ))),
                Some(403) | Some(422) => Err(GitHubGatewayError::BranchProtectionViolation(
                    format!("PR #{pr_number} rejected by branch protection"),
                )),
                Some(404) => Err(GitHubGatewayError::NotFound(format!("PR #{pr_number}"))),
                _ => Err(e.into()),
            },
        }
    }

    async fn submit_review(
        &self,
        pr_number: u64,
        event: ReviewEvent,
        body: &str,
    ) -> Result<(), GitHubGatewayError> {
        let route = format!(
            "/repos/{}/{}/pulls/{}/reviews",
            self.owner, self.repo, pr_number
        );
        let payload = serde_json::json!({
            "event": event.api_value(),
            "body": body,
        });
        let _: serde_json::Value = self.octocrab.post(route, Some(&payload)).await?;
        info!(pr_number = pr_number, event = event.api_value(), "Submitted PR review");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_and_ssh_remote_urls() {
        assert_eq!(
            parse_owner_repo("https://github.com/owner/repo.git"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(
            parse_owner_repo("https://github.com/owner/repo"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(
            parse_owner_repo("git@github.com:owner/repo.git"),
            Some(("owner".to_string(), "repo".to_string()))
        );
        assert_eq!(parse_owner_repo("https://example.com/owner/repo"), None);
        assert_eq!(parse_owner_repo("https://github.com/owner"), None);
    }

    #[test]
    fn merge_strategy_defaults_to_squash() {
        assert_eq!(MergeStrategy::default(), MergeStrategy::Squash);
    }

    #[test]
    fn review_events_map_to_api_values() {
        assert_eq!(ReviewEvent::Approve.api_value(), "APPROVE");
        assert_eq!(ReviewEvent::RequestChanges.api_value(), "REQUEST_CHANGES");
        assert_eq!(ReviewEvent::Comment.api_value(), "COMMENT");
    }
}
