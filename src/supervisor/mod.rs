//! Process supervisor: spawn, monitor, and terminate agent CLI sessions.
//!
//! Each session runs the agent CLI binary inside a prepared workspace with
//! piped stdio. Captured output feeds the per-session stream buffer and the
//! health monitor; completion and failure are delivered both as events and
//! on a dedicated per-session outcome channel that executors await.
//! Sessions within one (workspace, project) are serialised: the workspace
//! directory is exclusively owned by whichever session currently runs in it.

mod health;
mod output_buffer;
mod session;
mod workspace;

pub use health::{SessionHealthMonitor, SessionMeta, TerminateReason, TerminateRequest};
pub use output_buffer::OutputBufferRegistry;
pub use session::{AgentType, CliSession, SessionExit, SessionStatus};
pub use workspace::{WorkspaceManager, WorkspacePrepFailed};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{Event, EventBus, SessionEvent, SessionEventKind};
use crate::scrub::scrub;
use crate::store::EphemeralStore;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("workspace preparation failed: {0}")]
    WorkspacePrepFailed(String),

    #[error("failed to spawn agent CLI: {0}")]
    SpawnFailed(String),

    #[error("session timed out: {0}")]
    Timeout(String),

    #[error("no such session: {0}")]
    SessionNotFound(String),
}

/// Everything needed to start one agent CLI session.
#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub workspace_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub prompt: String,
    pub story_id: Option<String>,
    pub git_repo_url: String,
    pub pipeline_snapshot: serde_json::Value,
}

/// Handle returned from [`ProcessSupervisor::spawn`]. The outcome channel
/// resolves exactly once; the stalled watch flips to `true` if the health
/// monitor flags the session.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: String,
    pub pid: Option<u32>,
    pub outcome: oneshot::Receiver<SessionExit>,
    pub stalled: watch::Receiver<bool>,
}

/// Narrow seam for components (the job queue) that need to kill a session
/// without depending on the whole supervisor.
#[async_trait]
pub trait SessionTerminator: Send + Sync {
    async fn terminate_session(&self, session_id: &str, reason: &str) -> bool;
}

struct SessionHandle {
    session: CliSession,
    terminate_tx: mpsc::Sender<String>,
}

pub struct SupervisorConfig {
    pub cli_binary_path: String,
    pub hard_timeout: Duration,
    pub terminate_grace: Duration,
    pub git_author_name: String,
    pub git_author_email: String,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    workspaces: WorkspaceManager,
    buffers: Arc<OutputBufferRegistry>,
    health: Arc<SessionHealthMonitor>,
    events: EventBus,
    store: Arc<EphemeralStore>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    workspace_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        workspaces: WorkspaceManager,
        buffers: Arc<OutputBufferRegistry>,
        health: Arc<SessionHealthMonitor>,
        events: EventBus,
        store: Arc<EphemeralStore>,
    ) -> Self {
        Self {
            config,
            workspaces,
            buffers,
            health,
            events,
            store,
            sessions: Mutex::new(HashMap::new()),
            workspace_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffers(&self) -> &Arc<OutputBufferRegistry> {
        &self.buffers
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub async fn session(&self, session_id: &str) -> Option<CliSession> {
        if let Some(handle) = self.sessions.lock().unwrap().get(session_id) {
            return Some(handle.session.clone());
        }
        self.store.get_session(session_id).await
    }

    fn workspace_lock(&self, workspace_id: &str, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{workspace_id}:{project_id}");
        let mut locks = self.workspace_locks.lock().unwrap();
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn update_session<F: FnOnce(&mut CliSession)>(&self, session_id: &str, mutate: F) {
        let updated = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(session_id) {
                Some(handle) => {
                    mutate(&mut handle.session);
                    Some(handle.session.clone())
                }
                None => None,
            }
        };
        if let Some(session) = updated {
            self.store.put_session(session).await;
        }
    }

    fn session_event(&self, session: &CliSession, kind: SessionEventKind, metadata: serde_json::Value) {
        self.events.publish(Event::Session(SessionEvent {
            kind,
            session_id: session.session_id.clone(),
            agent_id: session.agent_id.clone(),
            agent_type: session.agent_type,
            workspace_id: session.workspace_id.clone(),
            project_id: session.project_id.clone(),
            timestamp: Utc::now(),
            metadata,
        }));
    }

    /// Spawn an agent CLI session. Waits for exclusive ownership of the
    /// workspace, prepares the clone, launches the binary, and wires output
    /// streaming plus health monitoring. Returns once the process is
    /// running.
    pub async fn spawn(self: Arc<Self>, params: SpawnParams) -> Result<SessionTicket, SupervisorError> {
        let session_id = Uuid::new_v4().to_string();
        let mut session = CliSession::new(
            session_id.clone(),
            params.workspace_id.clone(),
            params.project_id.clone(),
            params.agent_id.clone(),
            params.agent_type,
        );

        // Exclusive workspace ownership for the whole session lifetime.
        let lock = self.workspace_lock(&params.workspace_id, &params.project_id);
        let workspace_guard = lock.lock_owned().await;

        let dir = self
            .workspaces
            .prepare(&params.workspace_id, &params.project_id, &params.git_repo_url)
            .await
            .map_err(|e| SupervisorError::WorkspacePrepFailed(scrub(&e.to_string())))?;

        let task_dir = dir.join(".devos");
        tokio::fs::create_dir_all(&task_dir)
            .await
            .map_err(|e| SupervisorError::WorkspacePrepFailed(e.to_string()))?;
        let prompt_path = task_dir.join("task-prompt.md");
        tokio::fs::write(&prompt_path, &params.prompt)
            .await
            .map_err(|e| SupervisorError::WorkspacePrepFailed(e.to_string()))?;
        let context_path = task_dir.join("pipeline-context.json");
        let snapshot = serde_json::to_vec_pretty(&params.pipeline_snapshot)
            .unwrap_or_else(|_| b"{}".to_vec());
        tokio::fs::write(&context_path, snapshot)
            .await
            .map_err(|e| SupervisorError::WorkspacePrepFailed(e.to_string()))?;

        let mut command = Command::new(&self.config.cli_binary_path);
        command
            .arg("--agent")
            .arg(params.agent_type.to_string())
            .arg("--workspace")
            .arg(&params.workspace_id)
            .arg("--project")
            .arg(&params.project_id)
            .arg("--prompt-file")
            .arg(&prompt_path)
            .arg("--context-file")
            .arg(&context_path)
            .current_dir(&dir)
            .env("GIT_AUTHOR_NAME", &self.config.git_author_name)
            .env("GIT_AUTHOR_EMAIL", &self.config.git_author_email)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(story_id) = &params.story_id {
            command.arg("--story").arg(story_id);
        }

        let mut child = command.spawn().map_err(|e| {
            error!(
                agent_id = %params.agent_id,
                error = %e,
                "Failed to spawn agent CLI process"
            );
            SupervisorError::SpawnFailed(e.to_string())
        })?;

        let pid = child.id();
        session.pid = pid;
        session.status = SessionStatus::Running;

        let (terminate_tx, terminate_rx) = mpsc::channel::<String>(4);
        let (outcome_tx, outcome_rx) = oneshot::channel::<SessionExit>();

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                session_id.clone(),
                SessionHandle {
                    session: session.clone(),
                    terminate_tx,
                },
            );
        }
        self.store.put_session(session.clone()).await;
        self.buffers.open(&session_id);
        let stalled_rx = self.health.start_monitoring(SessionMeta {
            session_id: session_id.clone(),
            agent_id: params.agent_id.clone(),
            agent_type: params.agent_type,
            workspace_id: params.workspace_id.clone(),
            project_id: params.project_id.clone(),
        });

        info!(
            session_id = %session_id,
            agent_id = %params.agent_id,
            agent_type = %params.agent_type,
            pid = ?pid,
            "Agent CLI session started"
        );
        self.session_event(
            &session,
            SessionEventKind::Started,
            serde_json::json!({ "pid": pid, "storyId": params.story_id }),
        );

        // Stream stdout and stderr into the buffer and health monitor.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = self.clone().spawn_reader(session.clone(), stdout);
        let stderr_task = self.clone().spawn_reader_stderr(session.clone(), stderr);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .supervise(
                    session,
                    child,
                    terminate_rx,
                    outcome_tx,
                    stdout_task,
                    stderr_task,
                    workspace_guard,
                    dir,
                )
                .await;
        });

        Ok(SessionTicket {
            session_id,
            pid,
            outcome: outcome_rx,
            stalled: stalled_rx,
        })
    }

    fn spawn_reader(
        self: Arc<Self>,
        session: CliSession,
        stdout: Option<tokio::process::ChildStdout>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                self.handle_output_line(&session, &line).await;
            }
        })
    }

    fn spawn_reader_stderr(
        self: Arc<Self>,
        session: CliSession,
        stderr: Option<tokio::process::ChildStderr>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                self.handle_output_line(&session, &line).await;
            }
        })
    }

    async fn handle_output_line(&self, session: &CliSession, raw: &str) {
        let line = scrub(raw);
        let count = self.buffers.append(&session.session_id, &line);
        self.health.touch(&session.session_id);
        if let Some(count) = count {
            self.update_session(&session.session_id, |s| {
                s.last_activity_at = Utc::now();
                s.output_line_count = count;
            })
            .await;
        }
        self.session_event(
            session,
            SessionEventKind::Output,
            serde_json::json!({ "line": line }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        self: Arc<Self>,
        session: CliSession,
        mut child: Child,
        mut terminate_rx: mpsc::Receiver<String>,
        outcome_tx: oneshot::Sender<SessionExit>,
        stdout_task: tokio::task::JoinHandle<()>,
        stderr_task: tokio::task::JoinHandle<()>,
        workspace_guard: tokio::sync::OwnedMutexGuard<()>,
        dir: PathBuf,
    ) {
        let session_id = session.session_id.clone();
        let pid = session.pid;

        enum Ended {
            Exited(Option<i32>),
            TimedOut,
            Terminated(String),
            WaitFailed(String),
        }

        let ended = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Ended::Exited(status.code()),
                Err(e) => Ended::WaitFailed(e.to_string()),
            },
            _ = tokio::time::sleep(self.config.hard_timeout) => Ended::TimedOut,
            reason = terminate_rx.recv() => {
                Ended::Terminated(reason.unwrap_or_else(|| "terminated".to_string()))
            }
        };

        match &ended {
            Ended::TimedOut => {
                warn!(session_id = %session_id, "Session hit hard runtime ceiling");
                self.graceful_kill(&mut child, pid).await;
            }
            Ended::Terminated(reason) => {
                info!(session_id = %session_id, reason = %reason, "Terminating session");
                self.graceful_kill(&mut child, pid).await;
            }
            _ => {}
        }

        // Let the readers drain whatever the process wrote on the way out.
        let _ = tokio::time::timeout(Duration::from_secs(2), stdout_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), stderr_task).await;

        let output_line_count = self.buffers.line_count(&session_id);
        self.health.stop_monitoring(&session_id);
        self.buffers.close(&session_id).await;
        self.workspaces.cleanup(&dir).await;

        let (status, exit) = match ended {
            Ended::Exited(Some(0)) => (
                SessionStatus::Completed,
                SessionExit::Completed { output_line_count },
            ),
            Ended::Exited(code) => (
                SessionStatus::Failed,
                SessionExit::Failed {
                    exit_code: code,
                    reason: format!("agent CLI exited with code {code:?}"),
                    output_line_count,
                },
            ),
            Ended::TimedOut => (
                SessionStatus::Failed,
                SessionExit::Failed {
                    exit_code: None,
                    reason: format!(
                        "hard timeout after {}s",
                        self.config.hard_timeout.as_secs()
                    ),
                    output_line_count,
                },
            ),
            Ended::Terminated(reason) => (
                SessionStatus::Terminated,
                SessionExit::Failed {
                    exit_code: None,
                    reason,
                    output_line_count,
                },
            ),
            Ended::WaitFailed(e) => (
                SessionStatus::Failed,
                SessionExit::Failed {
                    exit_code: None,
                    reason: format!("wait failed: {e}"),
                    output_line_count,
                },
            ),
        };

        self.update_session(&session_id, |s| {
            s.status = status;
            s.output_line_count = output_line_count;
            if let SessionExit::Failed { exit_code, .. } = &exit {
                s.exit_code = *exit_code;
            } else {
                s.exit_code = Some(0);
            }
        })
        .await;

        let (kind, metadata) = match &exit {
            SessionExit::Completed { output_line_count } => (
                SessionEventKind::Completed,
                serde_json::json!({
                    "exitCode": 0,
                    "outputLineCount": output_line_count,
                }),
            ),
            SessionExit::Failed {
                exit_code,
                reason,
                output_line_count,
            } => (
                SessionEventKind::Failed,
                serde_json::json!({
                    "exitCode": exit_code,
                    "outputLineCount": output_line_count,
                    "error": scrub(reason),
                    "reason": scrub(reason),
                }),
            ),
        };
        self.session_event(&session, kind, metadata);

        debug!(session_id = %session_id, status = ?status, "Session finished");
        let _ = outcome_tx.send(exit);

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&session_id);
        }
        drop(workspace_guard);
    }

    /// SIGTERM first, escalate to a hard kill after the grace period.
    async fn graceful_kill(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            #[cfg(unix)]
            {
                use std::process::Command as StdCommand;
                let _ = StdCommand::new("kill")
                    .arg("-TERM")
                    .arg(pid.to_string())
                    .output();
            }
        }
        match tokio::time::timeout(self.config.terminate_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }

    /// Request termination of a running session.
    pub async fn terminate(&self, session_id: &str, reason: &str) -> Result<(), SupervisorError> {
        let tx = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(session_id)
                .map(|handle| handle.terminate_tx.clone())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(reason.to_string()).await;
                Ok(())
            }
            None => Err(SupervisorError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Service termination requests from the health monitor.
    pub async fn run_terminate_loop(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<TerminateRequest>,
    ) {
        while let Some(request) = requests.recv().await {
            let reason = match request.reason {
                TerminateReason::HardTimeout { elapsed } => {
                    format!("hard timeout after {}s", elapsed.as_secs())
                }
            };
            if let Err(e) = self.terminate(&request.session_id, &reason).await {
                debug!(
                    session_id = %request.session_id,
                    error = %e,
                    "Termination request for finished session"
                );
            }
        }
    }

    /// Terminate every active session. Used during graceful shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        let session_ids: Vec<String> = {
            let sessions = self.sessions.lock().unwrap();
            sessions.keys().cloned().collect()
        };
        for session_id in session_ids {
            let _ = self.terminate(&session_id, reason).await;
        }
    }
}

#[async_trait]
impl SessionTerminator for ProcessSupervisor {
    async fn terminate_session(&self, session_id: &str, reason: &str) -> bool {
        self.terminate(session_id, reason).await.is_ok()
    }
}
