//! Session health monitoring: stall detection and the hard runtime ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::events::{Event, EventBus, SessionEvent, SessionEventKind};
use crate::supervisor::AgentType;

/// Identity fields carried on every health event for a session.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub workspace_id: String,
    pub project_id: String,
}

/// Why the monitor asked the supervisor to terminate a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    HardTimeout { elapsed: Duration },
}

#[derive(Debug)]
pub struct TerminateRequest {
    pub session_id: String,
    pub reason: TerminateReason,
}

struct Watched {
    meta: SessionMeta,
    started: Instant,
    last_activity: Instant,
    stalled_reported: bool,
    timeout_reported: bool,
    stalled_tx: watch::Sender<bool>,
}

/// Watches active sessions: flags a stall after `stall_threshold` without
/// output, and requests termination once `hard_timeout` has elapsed.
/// Sessions that were never started (or already stopped) are not evaluated.
pub struct SessionHealthMonitor {
    watched: Mutex<HashMap<String, Watched>>,
    stall_threshold: Duration,
    hard_timeout: Duration,
    poll_interval: Duration,
    events: EventBus,
    terminate_tx: mpsc::Sender<TerminateRequest>,
}

impl SessionHealthMonitor {
    pub fn new(
        stall_threshold: Duration,
        hard_timeout: Duration,
        poll_interval: Duration,
        events: EventBus,
        terminate_tx: mpsc::Sender<TerminateRequest>,
    ) -> Self {
        Self {
            watched: Mutex::new(HashMap::new()),
            stall_threshold,
            hard_timeout,
            poll_interval,
            events,
            terminate_tx,
        }
    }

    pub fn stall_threshold(&self) -> Duration {
        self.stall_threshold
    }

    /// Begin watching a session. Returns a receiver that flips to `true`
    /// when the session is considered stalled.
    pub fn start_monitoring(&self, meta: SessionMeta) -> watch::Receiver<bool> {
        let (stalled_tx, stalled_rx) = watch::channel(false);
        let now = Instant::now();
        let mut watched = self.watched.lock().unwrap();
        watched.insert(
            meta.session_id.clone(),
            Watched {
                meta,
                started: now,
                last_activity: now,
                stalled_reported: false,
                timeout_reported: false,
                stalled_tx,
            },
        );
        stalled_rx
    }

    /// Record output activity for a session.
    pub fn touch(&self, session_id: &str) {
        let mut watched = self.watched.lock().unwrap();
        if let Some(entry) = watched.get_mut(session_id) {
            entry.last_activity = Instant::now();
            if entry.stalled_reported {
                // Activity after a stall clears the flag; a later stall is
                // reported again.
                entry.stalled_reported = false;
                let _ = entry.stalled_tx.send(false);
            }
        }
    }

    /// Stop watching. A stopped session can no longer stall.
    pub fn stop_monitoring(&self, session_id: &str) {
        let mut watched = self.watched.lock().unwrap();
        watched.remove(session_id);
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        self.watched.lock().unwrap().contains_key(session_id)
    }

    fn evaluate(&self) -> Vec<TerminateRequest> {
        let now = Instant::now();
        let mut requests = Vec::new();
        let mut watched = self.watched.lock().unwrap();

        for entry in watched.values_mut() {
            let idle = now.duration_since(entry.last_activity);
            if idle > self.stall_threshold && !entry.stalled_reported {
                entry.stalled_reported = true;
                let _ = entry.stalled_tx.send(true);
                warn!(
                    session_id = %entry.meta.session_id,
                    idle_seconds = idle.as_secs(),
                    "Session stalled: no output past threshold"
                );
                self.events.publish(Event::Session(SessionEvent {
                    kind: SessionEventKind::Stalled,
                    session_id: entry.meta.session_id.clone(),
                    agent_id: entry.meta.agent_id.clone(),
                    agent_type: entry.meta.agent_type,
                    workspace_id: entry.meta.workspace_id.clone(),
                    project_id: entry.meta.project_id.clone(),
                    timestamp: chrono::Utc::now(),
                    metadata: serde_json::json!({
                        "idleSeconds": idle.as_secs(),
                        "stallThresholdSeconds": self.stall_threshold.as_secs(),
                    }),
                }));
            }

            let elapsed = now.duration_since(entry.started);
            if elapsed > self.hard_timeout && !entry.timeout_reported {
                entry.timeout_reported = true;
                info!(
                    session_id = %entry.meta.session_id,
                    elapsed_seconds = elapsed.as_secs(),
                    "Session exceeded hard runtime ceiling, requesting termination"
                );
                requests.push(TerminateRequest {
                    session_id: entry.meta.session_id.clone(),
                    reason: TerminateReason::HardTimeout { elapsed },
                });
            }
        }
        requests
    }

    /// Poll loop. Stall events are emitted within one poll interval of the
    /// threshold being crossed.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            for request in self.evaluate() {
                if self.terminate_tx.send(request).await.is_err() {
                    // Supervisor is gone; nothing left to protect.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session_id: &str) -> SessionMeta {
        SessionMeta {
            session_id: session_id.to_string(),
            agent_id: "agent-1".to_string(),
            agent_type: AgentType::Dev,
            workspace_id: "ws".to_string(),
            project_id: "proj".to_string(),
        }
    }

    fn monitor(
        stall: Duration,
        hard: Duration,
    ) -> (Arc<SessionHealthMonitor>, mpsc::Receiver<TerminateRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let monitor = Arc::new(SessionHealthMonitor::new(
            stall,
            hard,
            Duration::from_millis(10),
            EventBus::default(),
            tx,
        ));
        (monitor, rx)
    }

    #[tokio::test]
    async fn stall_is_flagged_after_threshold_without_activity() {
        let (monitor, _rx) = monitor(Duration::from_millis(20), Duration::from_secs(60));
        let mut stalled = monitor.start_monitoring(meta("s1"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.evaluate();
        assert!(*stalled.borrow_and_update());
    }

    #[tokio::test]
    async fn activity_resets_the_stall_clock() {
        let (monitor, _rx) = monitor(Duration::from_millis(50), Duration::from_secs(60));
        let stalled = monitor.start_monitoring(meta("s1"));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            monitor.touch("s1");
        }
        monitor.evaluate();
        assert!(!*stalled.borrow());
    }

    #[tokio::test]
    async fn stopped_sessions_never_stall() {
        let (monitor, _rx) = monitor(Duration::from_millis(10), Duration::from_secs(60));
        let mut events = monitor.events.subscribe();
        monitor.start_monitoring(meta("s1"));
        monitor.stop_monitoring("s1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.evaluate();
        assert!(!monitor.is_monitoring("s1"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn hard_timeout_requests_termination_once() {
        let (monitor, mut rx) = monitor(Duration::from_secs(60), Duration::from_millis(15));
        monitor.start_monitoring(meta("s1"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let first = monitor.evaluate();
        assert_eq!(first.len(), 1);
        assert!(matches!(
            first[0].reason,
            TerminateReason::HardTimeout { .. }
        ));
        let second = monitor.evaluate();
        assert!(second.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
