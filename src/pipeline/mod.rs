//! Pipeline state machine: one authoritative, durable state per project.
//!
//! Transitions are validated against the declarative table in [`state`],
//! written atomically together with an immutable history row, and announced
//! on the event bus. All mutation goes through this module; executors and
//! the handoff coordinator hold project ids only.

pub mod state;

pub use state::{transition_allowed, PipelineState, TRANSITION_TABLE};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{Event, EventBus, PipelineStateChanged};
use crate::store::{PipelineStore, StoreError};
use crate::supervisor::AgentType;

/// Per-project workflow context. Exactly one row per project id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    pub project_id: String,
    pub workspace_id: String,
    pub workflow_id: String,
    pub current_state: PipelineState,
    pub previous_state: Option<PipelineState>,
    pub state_entered_at: DateTime<Utc>,
    pub active_agent_id: Option<String>,
    pub active_agent_type: Option<AgentType>,
    pub current_story_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit row written with every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStateHistory {
    pub project_id: String,
    pub from_state: PipelineState,
    pub to_state: PipelineState,
    pub transition_at: DateTime<Utc>,
    pub trigger: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("illegal transition for project {project_id}: {from} -> {to}")]
    IllegalTransition {
        project_id: String,
        from: PipelineState,
        to: PipelineState,
    },

    #[error("no pipeline context for project {0}")]
    NotFound(String),

    #[error("project {project_id} already has active agent {active_agent_id}")]
    Busy {
        project_id: String,
        active_agent_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `recover()` decided to do for one non-terminal context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Re-enqueue the agent that should be driving this state.
    Resume {
        project_id: String,
        workspace_id: String,
        agent_type: AgentType,
        story_id: Option<String>,
    },
    /// The context is inconsistent; it was transitioned to `failed`.
    MarkedFailed { project_id: String, reason: String },
}

pub struct PipelineStateMachine {
    store: Arc<dyn PipelineStore>,
    events: EventBus,
    default_max_retries: u32,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PipelineStateMachine {
    pub fn new(store: Arc<dyn PipelineStore>, events: EventBus, default_max_retries: u32) -> Self {
        Self {
            store,
            events,
            default_max_retries,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn project_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Load the context for a project, creating an `idle` one if missing.
    pub async fn ensure_context(
        &self,
        project_id: &str,
        workspace_id: &str,
        workflow_id: &str,
    ) -> Result<PipelineContext, PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.load_context(project_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let context = PipelineContext {
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            workflow_id: workflow_id.to_string(),
            current_state: PipelineState::Idle,
            previous_state: None,
            state_entered_at: now,
            active_agent_id: None,
            active_agent_type: None,
            current_story_id: None,
            retry_count: 0,
            max_retries: self.default_max_retries,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.store.save_context(&context).await?;
        info!(project_id = %project_id, "Created pipeline context in idle state");
        Ok(context)
    }

    pub async fn get(&self, project_id: &str) -> Result<Option<PipelineContext>, PipelineError> {
        Ok(self.store.load_context(project_id).await?)
    }

    pub async fn history(
        &self,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineStateHistory>, PipelineError> {
        Ok(self.store.load_history(project_id, limit, offset).await?)
    }

    /// Apply a transition, writing the new state and a history row together.
    pub async fn transition(
        &self,
        project_id: &str,
        to: PipelineState,
        trigger: &str,
        metadata: serde_json::Value,
    ) -> Result<PipelineContext, PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let mut context = self
            .store
            .load_context(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(project_id.to_string()))?;

        let from = context.current_state;
        if !transition_allowed(from, to) {
            return Err(PipelineError::IllegalTransition {
                project_id: project_id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        context.previous_state = Some(from);
        context.current_state = to;
        context.state_entered_at = now;
        context.updated_at = now;
        if to.is_terminal() {
            context.active_agent_id = None;
            context.active_agent_type = None;
        }

        let history = PipelineStateHistory {
            project_id: project_id.to_string(),
            from_state: from,
            to_state: to,
            transition_at: now,
            trigger: trigger.to_string(),
            metadata: metadata.clone(),
        };
        self.store.record_transition(&context, &history).await?;

        info!(
            project_id = %project_id,
            from = %from,
            to = %to,
            trigger = %trigger,
            "Pipeline state transition"
        );
        self.events.publish(Event::PipelineState(PipelineStateChanged {
            project_id: project_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
            timestamp: now,
        }));

        Ok(context)
    }

    /// Claim the pipeline for an agent. Refuses when another agent is
    /// already active for the project (single-agent-per-story rule).
    pub async fn begin_agent(
        &self,
        project_id: &str,
        agent_type: AgentType,
        agent_id: &str,
        story_id: Option<&str>,
    ) -> Result<PipelineContext, PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let mut context = self
            .store
            .load_context(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(project_id.to_string()))?;

        if let Some(active) = &context.active_agent_id {
            if active != agent_id {
                return Err(PipelineError::Busy {
                    project_id: project_id.to_string(),
                    active_agent_id: active.clone(),
                });
            }
        }

        context.active_agent_id = Some(agent_id.to_string());
        context.active_agent_type = Some(agent_type);
        if let Some(story) = story_id {
            context.current_story_id = Some(story.to_string());
        }
        context.updated_at = Utc::now();
        self.store.save_context(&context).await?;
        Ok(context)
    }

    /// Release the active-agent claim after an executor finishes.
    pub async fn clear_agent(&self, project_id: &str) -> Result<(), PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let Some(mut context) = self.store.load_context(project_id).await? else {
            return Ok(());
        };
        context.active_agent_id = None;
        context.active_agent_type = None;
        context.updated_at = Utc::now();
        self.store.save_context(&context).await?;
        Ok(())
    }

    /// Bump the rework counter. Returns the new count.
    pub async fn increment_retry(&self, project_id: &str) -> Result<u32, PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let mut context = self
            .store
            .load_context(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(project_id.to_string()))?;
        context.retry_count += 1;
        context.updated_at = Utc::now();
        self.store.save_context(&context).await?;
        Ok(context.retry_count)
    }

    /// Merge keys into the context's opaque metadata map.
    pub async fn merge_metadata(
        &self,
        project_id: &str,
        patch: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().await;

        let mut context = self
            .store
            .load_context(project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(project_id.to_string()))?;
        if let (Some(existing), Some(additions)) =
            (context.metadata.as_object_mut(), patch.as_object())
        {
            for (key, value) in additions {
                existing.insert(key.clone(), value.clone());
            }
        }
        context.updated_at = Utc::now();
        self.store.save_context(&context).await?;
        Ok(())
    }

    /// Startup recovery: decide, for every non-terminal context, which agent
    /// job to re-enqueue, or mark the context failed when it is
    /// inconsistent. The caller (composition root) enqueues the returned
    /// resume actions.
    pub async fn recover(&self) -> Result<Vec<ResumeAction>, PipelineError> {
        let contexts = self.store.load_all_contexts().await?;
        let mut actions = Vec::new();

        for context in contexts {
            if context.current_state.is_terminal() {
                continue;
            }
            let Some(agent_type) = context.current_state.driving_agent() else {
                continue;
            };

            // Past planning, every phase needs a story to act on; a context
            // without one cannot be resumed coherently.
            let needs_story = !matches!(context.current_state, PipelineState::Planning);
            if needs_story && context.current_story_id.is_none() {
                let reason = format!(
                    "recovery found {} context without a story id",
                    context.current_state
                );
                warn!(project_id = %context.project_id, reason = %reason, "Marking inconsistent context failed");
                self.transition(
                    &context.project_id,
                    PipelineState::Failed,
                    "recovery: inconsistent context",
                    serde_json::json!({ "reason": reason }),
                )
                .await?;
                actions.push(ResumeAction::MarkedFailed {
                    project_id: context.project_id,
                    reason,
                });
                continue;
            }

            // The previous process crashed mid-phase; any active-agent claim
            // it held is stale.
            self.clear_agent(&context.project_id).await?;

            actions.push(ResumeAction::Resume {
                project_id: context.project_id,
                workspace_id: context.workspace_id,
                agent_type,
                story_id: context.current_story_id,
            });
        }

        Ok(actions)
    }
}
