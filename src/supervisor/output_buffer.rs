//! Per-session output stream buffers.
//!
//! The supervisor appends captured stdout/stderr lines; executors read at
//! completion and live subscribers get ordered fan-out. Buffers are bounded:
//! the oldest lines are elided (with a marker) once the cap is reached.
//! Dirty buffers are snapshotted to the short-TTL store at a bounded
//! interval and once more on close, so `get_buffered_output` keeps working
//! for the retention window after a session ends.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{EphemeralStore, OutputSnapshot};

struct SessionBuffer {
    lines: VecDeque<String>,
    elided: u64,
    line_count: u64,
    tx: broadcast::Sender<String>,
    dirty: bool,
}

impl SessionBuffer {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            lines: VecDeque::new(),
            elided: 0,
            line_count: 0,
            tx,
            dirty: false,
        }
    }

    fn rendered_lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.elided > 0 {
            out.push(format!("[{} earlier lines elided]", self.elided));
        }
        out.extend(self.lines.iter().cloned());
        out
    }
}

pub struct OutputBufferRegistry {
    buffers: Mutex<HashMap<String, SessionBuffer>>,
    store: Arc<EphemeralStore>,
    max_lines: usize,
}

impl OutputBufferRegistry {
    pub fn new(store: Arc<EphemeralStore>, max_lines: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            store,
            max_lines: max_lines.max(1),
        }
    }

    /// Register a buffer for a new session.
    pub fn open(&self, session_id: &str) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(session_id.to_string())
            .or_insert_with(SessionBuffer::new);
    }

    /// Append one line. Returns the total line count for the session, or
    /// `None` when no buffer is open (lines arriving after close are
    /// dropped).
    pub fn append(&self, session_id: &str, line: &str) -> Option<u64> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.get_mut(session_id)?;
        buffer.line_count += 1;
        buffer.lines.push_back(line.to_string());
        while buffer.lines.len() > self.max_lines {
            buffer.lines.pop_front();
            buffer.elided += 1;
        }
        buffer.dirty = true;
        let _ = buffer.tx.send(line.to_string());
        Some(buffer.line_count)
    }

    /// Live fan-out subscription. Lines are delivered in arrival order.
    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<String>> {
        let buffers = self.buffers.lock().unwrap();
        buffers.get(session_id).map(|b| b.tx.subscribe())
    }

    pub fn line_count(&self, session_id: &str) -> u64 {
        let buffers = self.buffers.lock().unwrap();
        buffers.get(session_id).map(|b| b.line_count).unwrap_or(0)
    }

    /// Buffered output for a session: the live buffer if the session is
    /// still open, otherwise the persisted snapshot (valid until TTL
    /// expiry).
    pub async fn get_buffered_output(&self, session_id: &str) -> Option<Vec<String>> {
        {
            let buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.get(session_id) {
                return Some(buffer.rendered_lines());
            }
        }
        self.store
            .get_output_snapshot(session_id)
            .await
            .map(|snapshot| snapshot.lines.clone())
    }

    fn take_snapshot(&self, session_id: &str, only_if_dirty: bool) -> Option<OutputSnapshot> {
        let mut buffers = self.buffers.lock().unwrap();
        let buffer = buffers.get_mut(session_id)?;
        if only_if_dirty && !buffer.dirty {
            return None;
        }
        buffer.dirty = false;
        Some(OutputSnapshot {
            session_id: session_id.to_string(),
            lines: buffer.rendered_lines(),
            line_count: buffer.line_count,
            elided: buffer.elided,
            saved_at: Utc::now(),
        })
    }

    /// Persist a snapshot for one session immediately.
    pub async fn snapshot_now(&self, session_id: &str) {
        if let Some(snapshot) = self.take_snapshot(session_id, false) {
            self.store.put_output_snapshot(snapshot).await;
        }
    }

    /// Final snapshot, then drop the in-memory buffer. Subscribers see their
    /// channel close.
    pub async fn close(&self, session_id: &str) {
        self.snapshot_now(session_id).await;
        let mut buffers = self.buffers.lock().unwrap();
        buffers.remove(session_id);
        debug!(session_id = %session_id, "Closed output buffer");
    }

    /// Periodic snapshot loop for dirty buffers. The interval is bounded at
    /// one second.
    pub async fn run_snapshot_loop(self: Arc<Self>, interval: Duration) {
        let interval = interval.min(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let session_ids: Vec<String> = {
                let buffers = self.buffers.lock().unwrap();
                buffers.keys().cloned().collect()
            };
            for session_id in session_ids {
                if let Some(snapshot) = self.take_snapshot(&session_id, true) {
                    self.store.put_output_snapshot(snapshot).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(max_lines: usize) -> (OutputBufferRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(EphemeralStore::new(dir.path(), Duration::from_secs(3600)));
        (OutputBufferRegistry::new(store, max_lines), dir)
    }

    #[tokio::test]
    async fn lines_are_preserved_in_arrival_order() {
        let (registry, _dir) = registry(100);
        registry.open("s1");
        for i in 0..5 {
            registry.append("s1", &format!("line {i}"));
        }
        let lines = registry.get_buffered_output("s1").await.unwrap();
        assert_eq!(lines, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn bounded_buffer_elides_oldest_lines_with_marker() {
        let (registry, _dir) = registry(3);
        registry.open("s1");
        for i in 0..5 {
            registry.append("s1", &format!("line {i}"));
        }
        let lines = registry.get_buffered_output("s1").await.unwrap();
        assert_eq!(
            lines,
            vec!["[2 earlier lines elided]", "line 2", "line 3", "line 4"]
        );
        assert_eq!(registry.line_count("s1"), 5);
    }

    #[tokio::test]
    async fn output_survives_close_via_snapshot() {
        let (registry, _dir) = registry(100);
        registry.open("s1");
        registry.append("s1", "hello");
        registry.append("s1", "world");
        registry.close("s1").await;
        let lines = registry.get_buffered_output("s1").await.unwrap();
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn append_after_close_is_dropped() {
        let (registry, _dir) = registry(100);
        registry.open("s1");
        registry.append("s1", "kept");
        registry.close("s1").await;
        assert!(registry.append("s1", "dropped").is_none());
        let lines = registry.get_buffered_output("s1").await.unwrap();
        assert_eq!(lines, vec!["kept"]);
    }

    #[tokio::test]
    async fn subscribers_receive_lines_live() {
        let (registry, _dir) = registry(100);
        registry.open("s1");
        let mut rx = registry.subscribe("s1").unwrap();
        registry.append("s1", "first");
        registry.append("s1", "second");
        assert_eq!(rx.recv().await.unwrap(), "first");
        assert_eq!(rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn unknown_session_has_no_output() {
        let (registry, _dir) = registry(100);
        assert!(registry.get_buffered_output("ghost").await.is_none());
    }
}
