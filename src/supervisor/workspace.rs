//! Workspace preparation: one directory per (workspace, project), holding a
//! clone of the project repository on the base branch.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

use crate::gitops::GitGateway;

static ID_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").expect("id pattern is valid"));

#[derive(Debug, thiserror::Error)]
#[error("workspace preparation failed: {0}")]
pub struct WorkspacePrepFailed(pub String);

/// Maps (workspace, project) onto directories and prepares them for a
/// session. Credentials are supplied through the git gateway's in-memory
/// token only.
pub struct WorkspaceManager {
    root: PathBuf,
    git: GitGateway,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, git: GitGateway) -> Self {
        Self {
            root: root.into(),
            git,
        }
    }

    /// The directory for a (workspace, project) pair. Ids are validated as
    /// single path components before they touch the filesystem.
    pub fn dir_for(
        &self,
        workspace_id: &str,
        project_id: &str,
    ) -> Result<PathBuf, WorkspacePrepFailed> {
        for id in [workspace_id, project_id] {
            if !ID_COMPONENT.is_match(id) {
                return Err(WorkspacePrepFailed(format!(
                    "invalid id component '{id}'"
                )));
            }
        }
        Ok(self.root.join(workspace_id).join(project_id))
    }

    /// Ensure the workspace directory exists and contains a clone of the
    /// repository on the base branch, with the agent author configured
    /// locally.
    pub async fn prepare(
        &self,
        workspace_id: &str,
        project_id: &str,
        git_repo_url: &str,
    ) -> Result<PathBuf, WorkspacePrepFailed> {
        let dir = self.dir_for(workspace_id, project_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkspacePrepFailed(format!("create {}: {e}", dir.display())))?;

        self.git
            .ensure_clone(dir.clone(), git_repo_url.to_string())
            .await
            .map_err(|e| WorkspacePrepFailed(e.to_string()))?;

        debug!(dir = %dir.display(), "Workspace prepared");
        Ok(dir)
    }

    /// Scrub per-session git configuration from a workspace when a session
    /// ends.
    pub async fn cleanup(&self, dir: &Path) {
        let _ = self.git.cleanup_local_config(dir.to_path_buf()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> WorkspaceManager {
        let git = GitGateway::new(
            "DevOS Agent".into(),
            "agent@devos.ai".into(),
            "main".into(),
            None,
            Duration::from_secs(120),
            Duration::from_secs(30),
        );
        WorkspaceManager::new("/tmp/devos-test-root", git)
    }

    #[test]
    fn workspace_and_project_map_to_nested_directory() {
        let manager = manager();
        let dir = manager.dir_for("ws-1", "proj-2").unwrap();
        assert!(dir.ends_with("ws-1/proj-2"));
    }

    #[test]
    fn path_traversal_in_ids_is_rejected() {
        let manager = manager();
        assert!(manager.dir_for("../../etc", "proj").is_err());
        assert!(manager.dir_for("ws", "a/b").is_err());
        assert!(manager.dir_for("ws", ".hidden").is_err());
        assert!(manager.dir_for("", "proj").is_err());
    }
}
