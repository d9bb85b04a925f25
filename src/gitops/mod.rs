//! Git gateway: clone, branch, commit, push against the project repository.
//!
//! All repository access goes through git2; no shell git. Credentials come
//! from the process environment per invocation, travel only inside the
//! in-memory authenticated remote URL, and every error message is scrubbed
//! before it can reach a log or a persisted record.

use git2::build::RepoBuilder;
use git2::{
    BranchType, Cred, Delta, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature, StatusOptions,
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::scrub::scrub;

static BRANCH_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._\-/]+$").expect("branch pattern is valid"));

#[derive(Debug, Error)]
pub enum GitError {
    #[error("invalid git ref component: {0}")]
    Validation(String),

    #[error("workspace preparation failed: {0}")]
    Prep(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("rebase conflict: {0}")]
    RebaseConflict(String),

    #[error("git operation timed out: {0}")]
    Timeout(String),

    #[error("git error: {0}")]
    Internal(String),
}

impl From<git2::Error> for GitError {
    fn from(e: git2::Error) -> Self {
        GitError::Internal(scrub(e.message()))
    }
}

/// Files touched on a branch relative to its base.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedFiles {
    pub created: Vec<String>,
    pub modified: Vec<String>,
}

/// Validate a user- or agent-supplied ref component before it is ever
/// interpolated into a ref name or URL.
pub fn validate_ref_component(component: &str) -> Result<(), GitError> {
    if component.is_empty() || !BRANCH_COMPONENT.is_match(component) || component.contains("..") {
        return Err(GitError::Validation(component.to_string()));
    }
    Ok(())
}

/// Git gateway with cloneable configuration. Long-running operations run on
/// the blocking pool under the configured time budget.
#[derive(Clone)]
pub struct GitGateway {
    author_name: String,
    author_email: String,
    base_branch: String,
    token: Option<String>,
    push_timeout: Duration,
    command_timeout: Duration,
}

impl GitGateway {
    pub fn new(
        author_name: String,
        author_email: String,
        base_branch: String,
        token: Option<String>,
        push_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            author_name,
            author_email,
            base_branch,
            token,
            push_timeout,
            command_timeout,
        }
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    fn signature(&self) -> Result<Signature<'static>, GitError> {
        Ok(Signature::now(&self.author_name, &self.author_email)?)
    }

    /// Inject the token into an HTTPS remote URL. The result never leaves
    /// process memory un-scrubbed.
    fn authenticated_url(&self, url: &str) -> String {
        match (&self.token, url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://x-access-token:{token}@{rest}"),
            _ => url.to_string(),
        }
    }

    fn remote_callbacks(&self) -> RemoteCallbacks<'static> {
        let mut callbacks = RemoteCallbacks::new();
        let token = self.token.clone();
        callbacks.credentials(move |_url, username, _allowed| match &token {
            Some(token) => Cred::userpass_plaintext("x-access-token", token),
            None => Cred::username(username.unwrap_or("git")),
        });
        callbacks
    }

    async fn run_blocking<T, F>(
        &self,
        label: &'static str,
        budget: Duration,
        op: F,
    ) -> Result<T, GitError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GitError> + Send + 'static,
    {
        match tokio::time::timeout(budget, tokio::task::spawn_blocking(op)).await {
            Err(_) => Err(GitError::Timeout(label.to_string())),
            Ok(Err(join)) => Err(GitError::Internal(format!("{label}: {join}"))),
            Ok(Ok(result)) => result,
        }
    }

    // -- workspace preparation ---------------------------------------------

    /// Ensure `dir` contains a clone of `repo_url` on the base branch, with
    /// the agent author configured locally. Existing clones are fetched and
    /// fast-forwarded instead of re-cloned.
    pub async fn ensure_clone(&self, dir: PathBuf, repo_url: String) -> Result<(), GitError> {
        let gateway = self.clone();
        self.run_blocking("clone", self.push_timeout, move || {
            gateway.ensure_clone_blocking(&dir, &repo_url)
        })
        .await
    }

    fn ensure_clone_blocking(&self, dir: &Path, repo_url: &str) -> Result<(), GitError> {
        if dir.join(".git").exists() {
            debug!(dir = %dir.display(), "Workspace clone exists, fetching base branch");
            let repo = Repository::open(dir)?;
            let mut remote = repo.find_remote("origin")?;
            let mut options = FetchOptions::new();
            options.remote_callbacks(self.remote_callbacks());
            remote.fetch(&[self.base_branch.as_str()], Some(&mut options), None)?;
            self.configure_identity(&repo)?;
            return Ok(());
        }

        std::fs::create_dir_all(dir)
            .map_err(|e| GitError::Prep(format!("create {}: {e}", dir.display())))?;

        let mut options = FetchOptions::new();
        options.remote_callbacks(self.remote_callbacks());
        let repo = RepoBuilder::new()
            .branch(&self.base_branch)
            .fetch_options(options)
            .clone(repo_url, dir)
            .map_err(|e| GitError::Prep(scrub(e.message())))?;
        self.configure_identity(&repo)?;
        info!(dir = %dir.display(), "Cloned workspace repository");
        Ok(())
    }

    fn configure_identity(&self, repo: &Repository) -> Result<(), GitError> {
        let mut config = repo.config()?;
        config.set_str("user.name", &self.author_name)?;
        config.set_str("user.email", &self.author_email)?;
        Ok(())
    }

    // -- branches ----------------------------------------------------------

    /// Create `branch` from the base branch and check it out. Reuses an
    /// existing local branch of the same name.
    pub async fn create_branch_from_base(
        &self,
        dir: PathBuf,
        branch: String,
    ) -> Result<(), GitError> {
        validate_ref_component(&branch)?;
        let gateway = self.clone();
        self.run_blocking("create-branch", self.command_timeout, move || {
            gateway.create_branch_blocking(&dir, &branch)
        })
        .await
    }

    fn create_branch_blocking(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        let repo = Repository::open(dir)?;

        if repo.find_branch(branch, BranchType::Local).is_err() {
            let base_commit = self.resolve_base_commit(&repo)?;
            let commit = repo.find_commit(base_commit)?;
            repo.branch(branch, &commit, false)?;
        }

        let refname = format!("refs/heads/{branch}");
        let reference = repo.find_reference(&refname)?;
        let target = reference
            .target()
            .ok_or_else(|| GitError::Internal(format!("branch {branch} has no target")))?;
        let commit = repo.find_commit(target)?;
        let tree = commit.tree()?;
        repo.set_head(&refname)?;
        repo.checkout_tree(tree.as_object(), None)?;
        Ok(())
    }

    fn resolve_base_commit(&self, repo: &Repository) -> Result<Oid, GitError> {
        // Prefer the remote-tracking ref so a stale local base branch never
        // becomes the branch point.
        for candidate in [
            format!("refs/remotes/origin/{}", self.base_branch),
            format!("refs/heads/{}", self.base_branch),
        ] {
            if let Ok(reference) = repo.find_reference(&candidate) {
                if let Some(target) = reference.target() {
                    return Ok(target);
                }
            }
        }
        Err(GitError::Internal(format!(
            "base branch {} not found",
            self.base_branch
        )))
    }

    /// Check out an existing branch (local, or created from its
    /// remote-tracking ref).
    pub async fn checkout_branch(&self, dir: PathBuf, branch: String) -> Result<(), GitError> {
        validate_ref_component(&branch)?;
        let gateway = self.clone();
        self.run_blocking("checkout", self.command_timeout, move || {
            gateway.checkout_blocking(&dir, &branch)
        })
        .await
    }

    fn checkout_blocking(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        let repo = Repository::open(dir)?;

        if repo.find_branch(branch, BranchType::Local).is_err() {
            let remote_ref = format!("refs/remotes/origin/{branch}");
            let reference = repo.find_reference(&remote_ref)?;
            let target = reference
                .target()
                .ok_or_else(|| GitError::Internal(format!("{remote_ref} has no target")))?;
            let commit = repo.find_commit(target)?;
            repo.branch(branch, &commit, false)?;
        }

        let refname = format!("refs/heads/{branch}");
        let reference = repo.find_reference(&refname)?;
        let target = reference
            .target()
            .ok_or_else(|| GitError::Internal(format!("branch {branch} has no target")))?;
        let commit = repo.find_commit(target)?;
        repo.set_head(&refname)?;
        repo.checkout_tree(commit.tree()?.as_object(), None)?;
        Ok(())
    }

    /// Fetch a branch from origin so its remote-tracking ref is current.
    pub async fn fetch_branch(&self, dir: PathBuf, branch: String) -> Result<(), GitError> {
        validate_ref_component(&branch)?;
        let gateway = self.clone();
        self.run_blocking("fetch", self.push_timeout, move || {
            let repo = Repository::open(&dir)?;
            let mut remote = repo.find_remote("origin")?;
            let mut options = FetchOptions::new();
            options.remote_callbacks(gateway.remote_callbacks());
            remote.fetch(&[branch.as_str()], Some(&mut options), None)?;
            Ok(())
        })
        .await
    }

    // -- inspection --------------------------------------------------------

    /// Commits on `branch` that are not on the base branch.
    pub async fn commits_ahead_of_base(
        &self,
        dir: PathBuf,
        branch: String,
    ) -> Result<usize, GitError> {
        let gateway = self.clone();
        self.run_blocking("commits-ahead", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let local = repo
                .find_reference(&format!("refs/heads/{branch}"))?
                .target()
                .ok_or_else(|| GitError::Internal(format!("branch {branch} has no target")))?;
            let base = gateway.resolve_base_commit(&repo)?;
            let (ahead, _behind) = repo.graph_ahead_behind(local, base)?;
            Ok(ahead)
        })
        .await
    }

    /// Current HEAD commit hash (full 40-hex).
    pub async fn head_commit(&self, dir: PathBuf) -> Result<String, GitError> {
        self.run_blocking("head", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let commit_id = repo.head()?.peel_to_commit()?.id().to_string();
            Ok(commit_id)
        })
        .await
    }

    /// Whether the working tree has uncommitted changes (including
    /// untracked files).
    pub async fn is_dirty(&self, dir: PathBuf) -> Result<bool, GitError> {
        self.run_blocking("status", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let mut options = StatusOptions::new();
            options.include_untracked(true);
            let statuses = repo.statuses(Some(&mut options))?;
            Ok(!statuses.is_empty())
        })
        .await
    }

    /// Files created or modified on `branch` relative to the base branch.
    pub async fn changed_files(
        &self,
        dir: PathBuf,
        branch: String,
    ) -> Result<ChangedFiles, GitError> {
        let gateway = self.clone();
        self.run_blocking("diff", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let base = gateway.resolve_base_commit(&repo)?;
            let base_tree = repo.find_commit(base)?.tree()?;
            let head = repo
                .find_reference(&format!("refs/heads/{branch}"))?
                .target()
                .ok_or_else(|| GitError::Internal(format!("branch {branch} has no target")))?;
            let head_tree = repo.find_commit(head)?.tree()?;

            let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;
            let mut changed = ChangedFiles::default();
            for delta in diff.deltas() {
                let path = delta
                    .new_file()
                    .path()
                    .map(|p| p.to_string_lossy().to_string());
                let Some(path) = path else { continue };
                match delta.status() {
                    Delta::Added | Delta::Copied => changed.created.push(path),
                    Delta::Modified | Delta::Renamed => changed.modified.push(path),
                    _ => {}
                }
            }
            changed.created.sort();
            changed.modified.sort();
            Ok(changed)
        })
        .await
    }

    // -- commits and pushes ------------------------------------------------

    /// Stage everything and commit. Returns the new commit hash.
    pub async fn commit_all(&self, dir: PathBuf, message: String) -> Result<String, GitError> {
        let gateway = self.clone();
        self.run_blocking("commit", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
            index.write()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let signature = gateway.signature()?;
            let parent = repo.head()?.peel_to_commit()?;
            let oid = repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                &message,
                &tree,
                &[&parent],
            )?;
            Ok(oid.to_string())
        })
        .await
    }

    /// Push `branch` to origin over a token-embedded HTTPS URL. Any push
    /// failure surfaces as `PushRejected` so the caller can decide whether
    /// to rebase and retry.
    pub async fn push_branch(&self, dir: PathBuf, branch: String) -> Result<(), GitError> {
        validate_ref_component(&branch)?;
        let gateway = self.clone();
        self.run_blocking("push", self.push_timeout, move || {
            gateway.push_blocking(&dir, &branch)
        })
        .await
    }

    fn push_blocking(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        let repo = Repository::open(dir)?;
        let origin = repo.find_remote("origin")?;
        let url = origin
            .url()
            .ok_or_else(|| GitError::Internal("origin has no URL".to_string()))?
            .to_string();
        drop(origin);

        let authenticated = self.authenticated_url(&url);
        let mut remote = repo.remote_anonymous(&authenticated)?;
        let mut options = PushOptions::new();
        options.remote_callbacks(self.remote_callbacks());
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .map_err(|e| GitError::PushRejected(scrub(e.message())))?;
        debug!(branch = %branch, "Pushed branch to origin");
        Ok(())
    }

    /// Fetch the remote branch and rebase the local branch onto it. Used
    /// exactly once after a rejected push.
    pub async fn pull_rebase(&self, dir: PathBuf, branch: String) -> Result<(), GitError> {
        validate_ref_component(&branch)?;
        let gateway = self.clone();
        self.run_blocking("pull-rebase", self.push_timeout, move || {
            gateway.pull_rebase_blocking(&dir, &branch)
        })
        .await
    }

    fn pull_rebase_blocking(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        let repo = Repository::open(dir)?;

        let mut remote = repo.find_remote("origin")?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.remote_callbacks());
        remote.fetch(&[branch], Some(&mut options), None)?;
        drop(remote);

        let upstream_ref = repo.find_reference(&format!("refs/remotes/origin/{branch}"))?;
        let upstream = repo.reference_to_annotated_commit(&upstream_ref)?;
        let head_ref = repo.head()?;
        let local = repo.reference_to_annotated_commit(&head_ref)?;

        let mut rebase = repo.rebase(Some(&local), Some(&upstream), None, None)?;
        let committer = self.signature()?;
        while let Some(operation) = rebase.next() {
            operation?;
            if repo.index()?.has_conflicts() {
                rebase.abort()?;
                return Err(GitError::RebaseConflict(format!(
                    "rebase of {branch} onto origin/{branch} hit conflicts"
                )));
            }
            match rebase.commit(None, &committer, None) {
                Ok(_) => {}
                // A patch already present upstream produces an empty commit;
                // skip it and continue replaying.
                Err(e) if e.code() == git2::ErrorCode::Applied => {}
                Err(e) => {
                    rebase.abort()?;
                    return Err(e.into());
                }
            }
        }
        rebase.finish(None)?;
        info!(branch = %branch, "Rebased branch onto origin");
        Ok(())
    }

    /// Remove the locally configured identity. Called when a session ends so
    /// nothing agent-specific lingers in the workspace config.
    pub async fn cleanup_local_config(&self, dir: PathBuf) -> Result<(), GitError> {
        self.run_blocking("cleanup-config", self.command_timeout, move || {
            let repo = Repository::open(&dir)?;
            let mut config = repo.config()?;
            for key in ["user.name", "user.email"] {
                if let Err(e) = config.remove(key) {
                    if e.code() != git2::ErrorCode::NotFound {
                        warn!(key = %key, error = %scrub(e.message()), "Failed to remove local git config");
                    }
                }
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_branch_names() {
        for name in ["devos/dev/11-4", "main", "feature/a.b-c_d", "release/1.2.3"] {
            assert!(validate_ref_component(name).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for name in [
            "devos/dev/11-4; rm -rf /",
            "branch name",
            "a&&b",
            "$(whoami)",
            "br`anch",
            "",
        ] {
            assert!(validate_ref_component(name).is_err(), "{name:?} should fail");
        }
    }

    #[test]
    fn rejects_parent_directory_traversal() {
        assert!(validate_ref_component("../../etc/passwd").is_err());
    }

    #[test]
    fn authenticated_url_embeds_token_for_https_only() {
        let gateway = GitGateway::new(
            "DevOS Agent".into(),
            "agent@devos.ai".into(),
            "main".into(),
            Some("ghp_testtoken12345678".into()),
            Duration::from_secs(120),
            Duration::from_secs(30),
        );
        let url = gateway.authenticated_url("https://github.com/owner/repo.git");
        assert!(url.starts_with("https://x-access-token:ghp_testtoken12345678@"));
        assert_eq!(
            gateway.authenticated_url("git@github.com:owner/repo.git"),
            "git@github.com:owner/repo.git"
        );
    }

    #[test]
    fn authenticated_url_is_scrubbed_when_logged() {
        let gateway = GitGateway::new(
            "DevOS Agent".into(),
            "agent@devos.ai".into(),
            "main".into(),
            Some("ghp_testtoken12345678".into()),
            Duration::from_secs(120),
            Duration::from_secs(30),
        );
        let url = gateway.authenticated_url("https://github.com/owner/repo.git");
        assert!(!crate::scrub::contains_token(&scrub(&url)));
    }
}
