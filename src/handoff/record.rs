//! Handoff audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::supervisor::AgentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Pending,
    Validated,
    Rejected,
    Executed,
}

/// One validated (or rejected) transition between agents for a story.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub story_id: Option<String>,
    pub from_agent_type: AgentType,
    pub to_agent_type: Option<AgentType>,
    pub status: HandoffStatus,
    /// The context projection handed to the receiving agent.
    pub context_snapshot: serde_json::Value,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HandoffRecord {
    pub fn new(
        project_id: &str,
        workspace_id: &str,
        story_id: Option<&str>,
        from_agent_type: AgentType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            story_id: story_id.map(|s| s.to_string()),
            from_agent_type,
            to_agent_type: None,
            status: HandoffStatus::Pending,
            context_snapshot: serde_json::Value::Null,
            rejection_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
