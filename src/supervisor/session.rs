//! CLI session records and the agent-type vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which member of the agent chain a session (or job) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Planner,
    Dev,
    Qa,
    Devops,
    Orchestrator,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentType::Planner => "planner",
            AgentType::Dev => "dev",
            AgentType::Qa => "qa",
            AgentType::Devops => "devops",
            AgentType::Orchestrator => "orchestrator",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planner" => Ok(AgentType::Planner),
            "dev" => Ok(AgentType::Dev),
            "qa" => Ok(AgentType::Qa),
            "devops" => Ok(AgentType::Devops),
            "orchestrator" => Ok(AgentType::Orchestrator),
            other => Err(format!("unknown agent type '{other}'")),
        }
    }
}

/// Lifecycle status of a CLI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Spawning,
    Running,
    Stalled,
    Completed,
    Failed,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Terminated
        )
    }
}

/// One invocation of the agent CLI binary inside a workspace.
///
/// The supervisor owns the record for the session's lifetime; everyone else
/// holds the `session_id` and queries through the supervisor or the
/// short-TTL session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliSession {
    pub session_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output_line_count: u64,
}

impl CliSession {
    pub fn new(
        session_id: String,
        workspace_id: String,
        project_id: String,
        agent_id: String,
        agent_type: AgentType,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            workspace_id,
            project_id,
            agent_id,
            agent_type,
            status: SessionStatus::Spawning,
            pid: None,
            started_at: now,
            last_activity_at: now,
            exit_code: None,
            output_line_count: 0,
        }
    }
}

/// How a session ended, delivered on the per-session outcome channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Exit code 0.
    Completed { output_line_count: u64 },
    /// Non-zero exit, kill, or hard timeout.
    Failed {
        exit_code: Option<i32>,
        reason: String,
        output_line_count: u64,
    },
}

impl SessionExit {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionExit::Completed { .. })
    }
}
