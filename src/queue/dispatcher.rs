//! The queue-to-executor seam.
//!
//! Executors depend on the job queue (to enqueue handoffs); the queue only
//! knows this trait. The composition root provides the implementation,
//! which breaks the cycle between the two modules.

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::queue::Job;

/// Routes a claimed job to whatever executes it. The returned value becomes
/// the job's persisted `result`.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, job: &Job) -> Result<serde_json::Value, OrchestratorError>;
}
