//! Narrow repository interfaces over the durable and short-TTL backends.
//!
//! Owners talk to their own store and nothing else: the job queue owns
//! [`JobStore`], the pipeline state machine owns [`PipelineStore`], the
//! handoff coordinator owns [`HandoffStore`], and the supervisor owns the
//! short-TTL [`EphemeralStore`]. The file-backed implementations persist
//! JSON documents with atomic temp-file + rename writes so that a networked
//! backend can replace them without touching the owners.

mod ephemeral;
mod file;

pub use ephemeral::{EphemeralStore, OutputSnapshot};
pub use file::{FileHandoffStore, FileJobStore, FilePipelineStore};

use async_trait::async_trait;
use thiserror::Error;

use crate::handoff::HandoffRecord;
use crate::pipeline::{PipelineContext, PipelineStateHistory};
use crate::queue::{Job, JobFilter};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt store document {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, job: &Job) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;
    /// Returns the filtered page and the total match count before paging.
    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn all(&self) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn save_context(&self, context: &PipelineContext) -> Result<(), StoreError>;
    async fn load_context(&self, project_id: &str) -> Result<Option<PipelineContext>, StoreError>;
    async fn load_all_contexts(&self) -> Result<Vec<PipelineContext>, StoreError>;
    /// Persist a transition: the updated context and its history row
    /// together. Implementations must not expose the new state without the
    /// history row.
    async fn record_transition(
        &self,
        context: &PipelineContext,
        history: &PipelineStateHistory,
    ) -> Result<(), StoreError>;
    async fn load_history(
        &self,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineStateHistory>, StoreError>;
}

#[async_trait]
pub trait HandoffStore: Send + Sync {
    async fn put(&self, record: &HandoffRecord) -> Result<(), StoreError>;
    async fn list_for_project(&self, project_id: &str) -> Result<Vec<HandoffRecord>, StoreError>;
}
