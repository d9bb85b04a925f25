use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for the DevOS orchestrator.
///
/// Field names map one-to-one onto the environment variables of the
/// deployment contract (`WORKSPACE_ROOT`, `CLI_BINARY_PATH`, …), so the
/// whole struct can be populated from the process environment alone.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Git author name used for agent commits.
    pub git_author_name: String,
    /// Git author email used for agent commits.
    pub git_author_email: String,
    /// Root directory under which per-(workspace, project) clones live.
    pub workspace_root: PathBuf,
    /// Path to the agent CLI binary.
    pub cli_binary_path: String,
    /// Directory backing the durable job store.
    pub job_queue_backend_url: String,
    /// Directory backing the pipeline context + history store.
    pub pipeline_state_backend_url: String,
    /// Directory backing output snapshots and session records.
    pub output_buffer_backend_url: String,
    /// Global bound on concurrently running agents.
    pub max_parallel_agents: usize,
    /// Seconds without output before a session is marked stalled.
    pub session_stall_seconds: u64,
    /// Hard runtime ceiling for a CLI session, in seconds.
    pub session_hard_timeout_seconds: u64,
    /// Job queue worker pool size.
    pub queue_workers: usize,
    /// Default retry budget per job.
    pub job_max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Rework budget per story before the pipeline fails terminally.
    pub pipeline_max_retries: u32,
    /// Control plane bind address.
    pub control_plane_addr: String,
    /// Bearer token accepted by the control plane.
    pub control_plane_token: Option<String>,
    /// Git base branch agents branch from.
    pub git_base_branch: String,
    /// Timeouts, in seconds, for the external-command budget.
    pub git_push_timeout_seconds: u64,
    pub git_command_timeout_seconds: u64,
    pub test_run_timeout_seconds: u64,
    pub smoke_test_timeout_seconds: u64,
    pub deploy_monitor_timeout_seconds: u64,
    pub deploy_monitor_interval_seconds: u64,
    /// Grace period between SIGTERM and SIGKILL when terminating a session.
    pub terminate_grace_seconds: u64,
    /// Per-session output buffer cap, in lines.
    pub output_buffer_max_lines: usize,
    /// Output snapshot TTL, in seconds.
    pub output_snapshot_ttl_seconds: u64,
    /// Deployment platform selection: "railway", "vercel", or "auto".
    pub deploy_platform: String,
    /// Railway API settings (token read from env, never persisted).
    pub railway_api_url: String,
    /// Vercel API settings.
    pub vercel_api_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            git_author_name: "DevOS Agent".to_string(),
            git_author_email: "agent@devos.ai".to_string(),
            workspace_root: PathBuf::from(".devos/workspaces"),
            cli_binary_path: "devos-agent".to_string(),
            job_queue_backend_url: ".devos/state/jobs".to_string(),
            pipeline_state_backend_url: ".devos/state/pipeline".to_string(),
            output_buffer_backend_url: ".devos/state/output".to_string(),
            max_parallel_agents: 5,
            session_stall_seconds: 600,
            session_hard_timeout_seconds: 14_400,
            queue_workers: 4,
            job_max_attempts: 3,
            retry_backoff_base_ms: 1_000,
            pipeline_max_retries: 3,
            control_plane_addr: "127.0.0.1:8700".to_string(),
            control_plane_token: None,
            git_base_branch: "main".to_string(),
            git_push_timeout_seconds: 120,
            git_command_timeout_seconds: 30,
            test_run_timeout_seconds: 300,
            smoke_test_timeout_seconds: 300,
            deploy_monitor_timeout_seconds: 600,
            deploy_monitor_interval_seconds: 10,
            terminate_grace_seconds: 5,
            output_buffer_max_lines: 10_000,
            output_snapshot_ttl_seconds: 3_600,
            deploy_platform: "auto".to_string(),
            railway_api_url: "https://backboard.railway.app".to_string(),
            vercel_api_url: "https://api.vercel.com".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration file (devos-orchestrator.toml)
    /// 3. Environment variables (unprefixed, matching the deployment contract)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&OrchestratorConfig::default())?;

        let mut builder = Config::builder().add_source(defaults);

        if Path::new("devos-orchestrator.toml").exists() {
            builder = builder.add_source(File::with_name("devos-orchestrator"));
        }

        builder = builder.add_source(Environment::default().try_parsing(true));

        let config = builder.build()?;
        let loaded: OrchestratorConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_agents == 0 {
            anyhow::bail!("MAX_PARALLEL_AGENTS must be at least 1");
        }
        if self.queue_workers == 0 {
            anyhow::bail!("queue_workers must be at least 1");
        }
        if !matches!(self.deploy_platform.as_str(), "railway" | "vercel" | "auto") {
            anyhow::bail!(
                "deploy_platform must be one of railway|vercel|auto, got '{}'",
                self.deploy_platform
            );
        }
        Ok(())
    }

    /// GitHub token for clone/push and API calls. Read from `GIT_TOKEN` on
    /// every call so the credential lives only in the process environment.
    pub fn git_token(&self) -> Option<String> {
        std::env::var("GIT_TOKEN").ok().filter(|t| !t.is_empty())
    }

    /// Workspace directory for a (workspace, project) pair.
    pub fn workspace_dir(&self, workspace_id: &str, project_id: &str) -> PathBuf {
        self.workspace_root
            .join(workspace_id)
            .join(project_id)
    }

    /// Load .env file if it exists.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<OrchestratorConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = OrchestratorConfig::load_env_file();
        OrchestratorConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static OrchestratorConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_contract() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.git_author_name, "DevOS Agent");
        assert_eq!(cfg.git_author_email, "agent@devos.ai");
        assert_eq!(cfg.max_parallel_agents, 5);
        assert_eq!(cfg.session_stall_seconds, 600);
        assert_eq!(cfg.session_hard_timeout_seconds, 14_400);
        assert_eq!(cfg.deploy_monitor_interval_seconds, 10);
        assert_eq!(cfg.deploy_monitor_timeout_seconds, 600);
        assert_eq!(cfg.smoke_test_timeout_seconds, 300);
        assert_eq!(cfg.git_push_timeout_seconds, 120);
        assert_eq!(cfg.git_command_timeout_seconds, 30);
    }

    #[test]
    fn workspace_dir_nests_workspace_then_project() {
        let cfg = OrchestratorConfig::default();
        let dir = cfg.workspace_dir("ws-1", "proj-9");
        assert!(dir.ends_with("ws-1/proj-9"));
    }

    #[test]
    fn validate_rejects_unknown_platform() {
        let cfg = OrchestratorConfig {
            deploy_platform: "heroku".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
