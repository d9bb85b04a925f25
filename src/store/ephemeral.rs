//! Short-TTL store for output snapshots and session records.
//!
//! Backed by an in-memory TTL cache, with output snapshots additionally
//! written to the output-buffer backend directory so a reader can still
//! fetch a completed session's output within the TTL after a restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

use crate::supervisor::CliSession;

/// Durable snapshot of a session's buffered output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSnapshot {
    pub session_id: String,
    pub lines: Vec<String>,
    /// Total lines ever written, including elided ones.
    pub line_count: u64,
    pub elided: u64,
    pub saved_at: DateTime<Utc>,
}

pub struct EphemeralStore {
    outputs: Cache<String, Arc<OutputSnapshot>>,
    sessions: Cache<String, CliSession>,
    snapshot_dir: PathBuf,
    ttl: Duration,
}

fn output_key(session_id: &str) -> String {
    format!("cli:output:{session_id}")
}

impl EphemeralStore {
    pub fn new(snapshot_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            outputs: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            sessions: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            snapshot_dir: snapshot_dir.into(),
            ttl,
        }
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.snapshot_dir.join(format!("cli_output_{safe}.json"))
    }

    /// Store a snapshot in the cache and mirror it to disk. Disk failures
    /// are logged and swallowed: snapshotting must never break streaming.
    pub async fn put_output_snapshot(&self, snapshot: OutputSnapshot) {
        let session_id = snapshot.session_id.clone();
        let snapshot = Arc::new(snapshot);
        self.outputs
            .insert(output_key(&session_id), snapshot.clone())
            .await;

        let path = self.snapshot_path(&session_id);
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec(snapshot.as_ref()) {
            Ok(bytes) => {
                if let Err(e) = fs::write(&path, bytes).await {
                    warn!(session_id = %session_id, error = %e, "Failed to persist output snapshot");
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to serialize output snapshot");
            }
        }
    }

    /// Fetch a session's snapshot: cache first, then the on-disk mirror as
    /// long as it is within the TTL. Expired snapshots are gone.
    pub async fn get_output_snapshot(&self, session_id: &str) -> Option<Arc<OutputSnapshot>> {
        if let Some(snapshot) = self.outputs.get(&output_key(session_id)).await {
            return Some(snapshot);
        }

        let path = self.snapshot_path(session_id);
        let bytes = fs::read(&path).await.ok()?;
        let snapshot: OutputSnapshot = serde_json::from_slice(&bytes).ok()?;
        let age = Utc::now() - snapshot.saved_at;
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::hours(1));
        if age > ttl {
            let _ = fs::remove_file(&path).await;
            return None;
        }
        let snapshot = Arc::new(snapshot);
        self.outputs
            .insert(output_key(session_id), snapshot.clone())
            .await;
        Some(snapshot)
    }

    pub async fn put_session(&self, session: CliSession) {
        self.sessions
            .insert(session.session_id.clone(), session)
            .await;
    }

    pub async fn get_session(&self, session_id: &str) -> Option<CliSession> {
        self.sessions.get(session_id).await
    }

    /// Sweep expired on-disk snapshots. Called periodically by the
    /// composition root.
    pub async fn sweep_expired_snapshots(&self) {
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::hours(1));
        let mut entries = match fs::read_dir(&self.snapshot_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            let Ok(snapshot) = serde_json::from_slice::<OutputSnapshot>(&bytes) else {
                let _ = fs::remove_file(&path).await;
                continue;
            };
            if Utc::now() - snapshot.saved_at > ttl {
                let _ = fs::remove_file(&path).await;
            }
        }
    }
}
