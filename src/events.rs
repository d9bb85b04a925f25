//! Event plane: typed payloads and a broadcast-based bus.
//!
//! Progress and session events are one-way pushes to whoever subscribes
//! (WebSocket fan-out lives outside this crate). Publishing is
//! fire-and-forget: a send with no subscribers, or a lagging subscriber,
//! never affects the primary workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::supervisor::AgentType;

/// Lifecycle moments of a CLI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Started,
    Output,
    Completed,
    Failed,
    Stalled,
}

impl SessionEventKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEventKind::Started => "cli:session:started",
            SessionEventKind::Output => "cli:session:output",
            SessionEventKind::Completed => "cli:session:completed",
            SessionEventKind::Failed => "cli:session:failed",
            SessionEventKind::Stalled => "cli:session:stalled",
        }
    }
}

/// Payload common to every `cli:session:*` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub workspace_id: String,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Status of a single executor step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

/// Payload of `<agent>-agent:progress` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub agent_type: AgentType,
    pub session_id: Option<String>,
    pub story_id: Option<String>,
    pub workspace_id: String,
    pub step: String,
    pub status: StepStatus,
    pub details: Option<String>,
    pub percentage: u8,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn event_name(&self) -> String {
        format!("{}-agent:progress", self.agent_type)
    }
}

/// Payload of `pipeline:state:changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStateChanged {
    pub project_id: String,
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

/// Every event the orchestrator publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Event {
    Session(SessionEvent),
    Progress(ProgressEvent),
    PipelineState(PipelineStateChanged),
}

/// Broadcast bus with fire-and-forget publishing.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Errors (no subscribers) are swallowed: event
    /// delivery must never affect the primary workflow.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_names_match_wire_protocol() {
        assert_eq!(
            SessionEventKind::Started.event_name(),
            "cli:session:started"
        );
        assert_eq!(
            SessionEventKind::Stalled.event_name(),
            "cli:session:stalled"
        );
    }

    #[test]
    fn progress_event_name_is_derived_from_agent_type() {
        let event = ProgressEvent {
            agent_type: AgentType::Dev,
            session_id: None,
            story_id: Some("11-4".to_string()),
            workspace_id: "ws".to_string(),
            step: "creating-branch".to_string(),
            status: StepStatus::Started,
            details: None,
            percentage: 10,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_name(), "dev-agent:progress");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.publish(Event::PipelineState(PipelineStateChanged {
            project_id: "p".to_string(),
            from: "idle".to_string(),
            to: "planning".to_string(),
            trigger: "planner job started".to_string(),
            timestamp: Utc::now(),
        }));
    }

    #[tokio::test]
    async fn subscribers_observe_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        for step in ["a", "b", "c"] {
            bus.publish(Event::Progress(ProgressEvent {
                agent_type: AgentType::Qa,
                session_id: None,
                story_id: None,
                workspace_id: "ws".to_string(),
                step: step.to_string(),
                status: StepStatus::Started,
                details: None,
                percentage: 0,
                timestamp: Utc::now(),
            }));
        }
        for expected in ["a", "b", "c"] {
            match rx.recv().await.unwrap() {
                Event::Progress(p) => assert_eq!(p.step, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
