//! Durable job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a queued job asks the orchestrator to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    SpawnAgent,
    ExecuteTask,
    RecoverContext,
    TerminateAgent,
    Chat,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobType::SpawnAgent => "spawn-agent",
            JobType::ExecuteTask => "execute-task",
            JobType::RecoverContext => "recover-context",
            JobType::TerminateAgent => "terminate-agent",
            JobType::Chat => "chat",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawn-agent" => Ok(JobType::SpawnAgent),
            "execute-task" => Ok(JobType::ExecuteTask),
            "recover-context" => Ok(JobType::RecoverContext),
            "terminate-agent" => Ok(JobType::TerminateAgent),
            "chat" => Ok(JobType::Chat),
            other => Err(format!("unknown job type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        };
        write!(f, "{name}")
    }
}

pub const PRIORITY_HIGHEST: u8 = 1;
pub const PRIORITY_DEFAULT: u8 = 50;
pub const PRIORITY_LOWEST: u8 = 100;

/// A queued agent job. Owned by the job queue; everyone else holds the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Handle for the scheduled queue entry, cleared on cancellation.
    pub external_queue_id: Option<String>,
    pub priority: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to enqueue a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub workspace_id: String,
    pub project_id: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: Option<u8>,
    pub max_attempts: Option<u32>,
}

impl Job {
    pub fn from_request(request: NewJob, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: request.workspace_id,
            project_id: request.project_id,
            job_type: request.job_type,
            payload: request.payload,
            status: JobStatus::Pending,
            external_queue_id: Some(Uuid::new_v4().to_string()),
            priority: request.priority.unwrap_or(PRIORITY_DEFAULT).clamp(
                PRIORITY_HIGHEST,
                PRIORITY_LOWEST,
            ),
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for job listings. `limit` is clamped to [1, 100] at the HTTP
/// boundary; the store applies it verbatim.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub workspace_id: Option<String>,
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: usize,
    pub offset: usize,
}

/// Aggregate queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
