//! File-backed durable stores: one JSON document per record, atomic writes.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{HandoffStore, JobStore, PipelineStore, StoreError};
use crate::handoff::HandoffRecord;
use crate::pipeline::{PipelineContext, PipelineStateHistory};
use crate::queue::{Job, JobFilter};
use crate::scrub::scrub;

/// Write a JSON document atomically: serialize to a temp file in the same
/// directory, flush, then rename over the destination.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_dir_documents<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(doc) = read_json(&path).await? {
            out.push(doc);
        }
    }
    Ok(out)
}

fn document_name(id: &str) -> String {
    // Ids are uuids or `<workspace>:<project>` style keys; keep the name
    // filesystem-safe either way.
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
            c
        } else {
            '_'
        })
        .collect();
    format!("{safe}.json")
}

// ---------------------------------------------------------------------------
// Jobs

pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.root.join("jobs").join(document_name(id))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        // Final guard: no credential ever reaches disk via an error message.
        let mut job = job.clone();
        if let Some(message) = job.error_message.take() {
            job.error_message = Some(scrub(&message));
        }
        write_json_atomic(&self.job_path(&job.id), &job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        read_json(&self.job_path(id)).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        let mut jobs: Vec<Job> = self.all().await?;
        jobs.retain(|job| {
            filter
                .workspace_id
                .as_ref()
                .is_none_or(|ws| &job.workspace_id == ws)
                && filter.status.is_none_or(|s| job.status == s)
                && filter.job_type.is_none_or(|t| job.job_type == t)
        });
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = jobs.len();
        let limit = if filter.limit == 0 {
            usize::MAX
        } else {
            filter.limit
        };
        let page: Vec<Job> = jobs.into_iter().skip(filter.offset).take(limit).collect();
        Ok((page, total))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.job_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn all(&self) -> Result<Vec<Job>, StoreError> {
        read_dir_documents(&self.root.join("jobs")).await
    }
}

// ---------------------------------------------------------------------------
// Pipeline contexts + history

pub struct FilePipelineStore {
    root: PathBuf,
}

impl FilePipelineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn context_path(&self, project_id: &str) -> PathBuf {
        self.root.join("contexts").join(document_name(project_id))
    }

    fn history_path(&self, project_id: &str) -> PathBuf {
        let mut name = document_name(project_id);
        name.truncate(name.len() - ".json".len());
        self.root.join("history").join(format!("{name}.jsonl"))
    }

    async fn append_history(&self, row: &PipelineStateHistory) -> Result<(), StoreError> {
        let path = self.history_path(&row.project_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for FilePipelineStore {
    async fn save_context(&self, context: &PipelineContext) -> Result<(), StoreError> {
        write_json_atomic(&self.context_path(&context.project_id), context).await
    }

    async fn load_context(&self, project_id: &str) -> Result<Option<PipelineContext>, StoreError> {
        read_json(&self.context_path(project_id)).await
    }

    async fn load_all_contexts(&self) -> Result<Vec<PipelineContext>, StoreError> {
        read_dir_documents(&self.root.join("contexts")).await
    }

    async fn record_transition(
        &self,
        context: &PipelineContext,
        history: &PipelineStateHistory,
    ) -> Result<(), StoreError> {
        // History first: a crash between the two writes leaves a duplicate
        // history row, never a state change without an audit trail.
        self.append_history(history).await?;
        self.save_context(context).await
    }

    async fn load_history(
        &self,
        project_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PipelineStateHistory>, StoreError> {
        let path = self.history_path(project_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: PipelineStateHistory =
                serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            rows.push(row);
        }
        // Newest first, then page.
        rows.reverse();
        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

// ---------------------------------------------------------------------------
// Handoffs

pub struct FileHandoffStore {
    root: PathBuf,
}

impl FileHandoffStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join("handoffs").join(document_name(id))
    }
}

#[async_trait]
impl HandoffStore for FileHandoffStore {
    async fn put(&self, record: &HandoffRecord) -> Result<(), StoreError> {
        write_json_atomic(&self.record_path(&record.id), record).await
    }

    async fn list_for_project(&self, project_id: &str) -> Result<Vec<HandoffRecord>, StoreError> {
        let mut records: Vec<HandoffRecord> =
            read_dir_documents(&self.root.join("handoffs")).await?;
        records.retain(|r| r.project_id == project_id);
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
