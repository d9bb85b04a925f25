//! Durable job queue: priority scheduling, retry with exponential backoff,
//! cancellation, and retention.
//!
//! Jobs are persisted before `enqueue` returns. A worker pool claims jobs
//! in priority order (FIFO within a priority); a claimed job is processed
//! by exactly one worker. Failures classified as retryable are re-scheduled
//! on the same job row with backoff until the attempt budget runs out, then
//! dead-lettered as `failed`.

mod dispatcher;
pub mod job;

pub use dispatcher::AgentDispatcher;
pub use job::{
    Job, JobFilter, JobStatus, JobType, NewJob, QueueStats, PRIORITY_DEFAULT, PRIORITY_HIGHEST,
    PRIORITY_LOWEST,
};

use chrono::Utc;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorError;
use crate::scrub::scrub;
use crate::store::JobStore;
use crate::supervisor::SessionTerminator;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub default_max_attempts: u32,
    pub backoff_base: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            completed_retention: Duration::from_secs(7 * 24 * 3600),
            failed_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Entry in the ready heap: lowest priority number first, FIFO within a
/// priority.
struct ReadyEntry {
    priority: u8,
    seq: u64,
    job_id: String,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for ReadyEntry {}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Entry in the delayed heap: earliest wake time first.
struct DelayedEntry {
    not_before: Instant,
    priority: u8,
    seq: u64,
    job_id: String,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    seq: u64,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    sched: Mutex<SchedState>,
    notify: Notify,
    dispatcher: OnceLock<Arc<dyn AgentDispatcher>>,
    terminator: OnceLock<Arc<dyn SessionTerminator>>,
    /// job id -> session id, registered by executors for cancellation.
    active_sessions: Mutex<HashMap<String, String>>,
    /// Jobs cancelled while a worker was processing them; the worker
    /// discards its outcome on return.
    cancelled: Mutex<HashSet<String>>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            sched: Mutex::new(SchedState::default()),
            notify: Notify::new(),
            dispatcher: OnceLock::new(),
            terminator: OnceLock::new(),
            active_sessions: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Late wiring: the dispatcher is built after the queue (it owns the
    /// executors, which hold the queue).
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn AgentDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn set_terminator(&self, terminator: Arc<dyn SessionTerminator>) {
        let _ = self.terminator.set(terminator);
    }

    /// Record the CLI session currently serving a job so cancellation can
    /// reach it.
    pub fn register_session(&self, job_id: &str, session_id: &str) {
        self.active_sessions
            .lock()
            .unwrap()
            .insert(job_id.to_string(), session_id.to_string());
    }

    pub fn unregister_session(&self, job_id: &str) {
        self.active_sessions.lock().unwrap().remove(job_id);
    }

    fn push_ready(&self, job: &Job) {
        let mut sched = self.sched.lock().unwrap();
        sched.seq += 1;
        let seq = sched.seq;
        sched.ready.push(ReadyEntry {
            priority: job.priority,
            seq,
            job_id: job.id.clone(),
        });
        drop(sched);
        self.notify.notify_one();
    }

    fn push_delayed(&self, job: &Job, delay: Duration) {
        let mut sched = self.sched.lock().unwrap();
        sched.seq += 1;
        let seq = sched.seq;
        sched.delayed.push(DelayedEntry {
            not_before: Instant::now() + delay,
            priority: job.priority,
            seq,
            job_id: job.id.clone(),
        });
        drop(sched);
        self.notify.notify_one();
    }

    /// Persist a new job and schedule it. The job is durable before this
    /// returns.
    pub async fn enqueue(&self, request: NewJob) -> Result<Job, OrchestratorError> {
        let job = Job::from_request(request, self.config.default_max_attempts);
        self.store
            .put(&job)
            .await
            .map_err(|e| OrchestratorError::Transient(format!("persist job: {e}")))?;
        self.push_ready(&job);
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Wait for the next runnable job id, honouring priority then FIFO, and
    /// promoting delayed retries whose backoff has elapsed.
    async fn claim_next(&self) -> String {
        loop {
            let next_wake = {
                let mut sched = self.sched.lock().unwrap();
                let now = Instant::now();
                loop {
                    let due = sched
                        .delayed
                        .peek()
                        .map(|entry| entry.not_before <= now)
                        .unwrap_or(false);
                    if !due {
                        break;
                    }
                    let entry = sched.delayed.pop().unwrap();
                    let seq = entry.seq;
                    sched.ready.push(ReadyEntry {
                        priority: entry.priority,
                        seq,
                        job_id: entry.job_id,
                    });
                }
                if let Some(entry) = sched.ready.pop() {
                    return entry.job_id;
                }
                sched.delayed.peek().map(|entry| entry.not_before)
            };

            match next_wake {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = self.config.backoff_base * 2u32.saturating_pow(exponent);
        let jitter_ceiling = (self.config.backoff_base / 2).as_millis().max(1) as u64;
        let jitter = rand::rng().random_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter)
    }

    async fn process(&self, job_id: &str) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load claimed job");
                return;
            }
        };

        // Cancelled-while-pending jobs are already terminal; drop the claim.
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            debug!(job_id = %job_id, status = %job.status, "Skipping non-runnable claim");
            return;
        }

        let mut job = job;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        job.updated_at = Utc::now();
        if let Err(e) = self.store.put(&job).await {
            error!(job_id = %job_id, error = %e, "Failed to persist processing state");
            return;
        }

        debug!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let outcome = match self.dispatcher.get() {
            Some(dispatcher) => dispatcher.dispatch(&job).await,
            None => Err(OrchestratorError::Fatal(
                "no dispatcher wired into the job queue".to_string(),
            )),
        };

        self.unregister_session(&job.id);

        // A cancellation that landed mid-flight already marked the job
        // failed; the late outcome is discarded.
        if self.cancelled.lock().unwrap().remove(&job.id) {
            debug!(job_id = %job.id, "Discarding outcome of cancelled job");
            return;
        }

        match outcome {
            Ok(result) => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.error_message = None;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                if let Err(e) = self.store.put(&job).await {
                    error!(job_id = %job.id, error = %e, "Failed to persist completed job");
                }
                info!(job_id = %job.id, "Job completed");
            }
            Err(e) => {
                let message = scrub(&e.to_string());
                if e.is_retryable() && job.attempts < job.max_attempts {
                    job.status = JobStatus::Retrying;
                    job.error_message = Some(message.clone());
                    job.updated_at = Utc::now();
                    if let Err(persist) = self.store.put(&job).await {
                        error!(job_id = %job.id, error = %persist, "Failed to persist retrying job");
                        return;
                    }
                    let delay = self.backoff_delay(job.attempts);
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Job failed, retrying with backoff"
                    );
                    self.push_delayed(&job, delay);
                } else {
                    job.status = JobStatus::Failed;
                    job.error_message = Some(message.clone());
                    job.completed_at = Some(Utc::now());
                    job.updated_at = Utc::now();
                    if let Err(persist) = self.store.put(&job).await {
                        error!(job_id = %job.id, error = %persist, "Failed to persist failed job");
                    }
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %message,
                        "Job failed terminally"
                    );
                }
            }
        }
    }

    /// Start the worker pool. Returns the worker task handles.
    pub fn run_workers(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let queue = Arc::clone(&self);
                tokio::spawn(async move {
                    debug!(worker = worker, "Queue worker started");
                    loop {
                        let job_id = queue.claim_next().await;
                        queue.process(&job_id).await;
                    }
                })
            })
            .collect()
    }

    /// Fetch a job, scoped to a workspace.
    pub async fn get_job(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Option<Job>, OrchestratorError> {
        let job = self
            .store
            .get(id)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        Ok(job.filter(|job| job.workspace_id == workspace_id))
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> Result<(Vec<Job>, usize), OrchestratorError> {
        self.store
            .list(filter)
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))
    }

    /// Cancel a pending or processing job. Terminal jobs conflict. The
    /// associated CLI session, if any, is asked to terminate.
    pub async fn cancel_job(
        &self,
        id: &str,
        workspace_id: &str,
    ) -> Result<Job, OrchestratorError> {
        let Some(mut job) = self.get_job(id, workspace_id).await? else {
            return Err(OrchestratorError::NotFound(format!("job {id}")));
        };

        match job.status {
            JobStatus::Pending | JobStatus::Processing => {
                let was_processing = job.status == JobStatus::Processing;
                job.status = JobStatus::Failed;
                job.error_message = Some("Cancelled by user".to_string());
                job.external_queue_id = None;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                self.store
                    .put(&job)
                    .await
                    .map_err(|e| OrchestratorError::Transient(e.to_string()))?;

                if was_processing {
                    self.cancelled.lock().unwrap().insert(job.id.clone());
                    let session_id = self
                        .active_sessions
                        .lock()
                        .unwrap()
                        .get(&job.id)
                        .cloned();
                    if let (Some(session_id), Some(terminator)) =
                        (session_id, self.terminator.get())
                    {
                        terminator
                            .terminate_session(&session_id, "Cancelled by user")
                            .await;
                    }
                }

                info!(job_id = %job.id, "Job cancelled by user");
                Ok(job)
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Retrying => Err(
                OrchestratorError::Conflict(format!(
                    "job {id} cannot be cancelled in status {}",
                    job.status
                )),
            ),
        }
    }

    pub async fn get_stats(&self) -> Result<QueueStats, OrchestratorError> {
        let jobs = self
            .store
            .all()
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        let mut stats = QueueStats::default();
        for job in jobs {
            match job.status {
                JobStatus::Pending | JobStatus::Retrying => stats.waiting += 1,
                JobStatus::Processing => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Drop jobs past their retention window: completed after 7 days,
    /// failed after 30 (by default).
    pub async fn sweep_retention(&self) -> Result<usize, OrchestratorError> {
        let jobs = self
            .store
            .all()
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        let now = Utc::now();
        let mut removed = 0;
        for job in jobs {
            let retention = match job.status {
                JobStatus::Completed => self.config.completed_retention,
                JobStatus::Failed => self.config.failed_retention,
                _ => continue,
            };
            let reference = job.completed_at.unwrap_or(job.updated_at);
            let age = (now - reference).to_std().unwrap_or_default();
            if age > retention {
                if let Err(e) = self.store.delete(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "Retention sweep failed to delete job");
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed = removed, "Retention sweep removed expired jobs");
        }
        Ok(removed)
    }

    pub async fn run_retention_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_retention().await {
                warn!(error = %e, "Retention sweep failed");
            }
        }
    }

    /// Re-schedule jobs that were pending or retrying when the process last
    /// stopped. Called once on startup.
    pub async fn resume_persisted(&self) -> Result<usize, OrchestratorError> {
        let jobs = self
            .store
            .all()
            .await
            .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
        let mut resumed = 0;
        for mut job in jobs {
            match job.status {
                JobStatus::Pending | JobStatus::Retrying => {
                    self.push_ready(&job);
                    resumed += 1;
                }
                JobStatus::Processing => {
                    // The worker that claimed this job is gone; put the row
                    // back into rotation as a fresh attempt.
                    job.status = JobStatus::Pending;
                    job.updated_at = Utc::now();
                    self.store
                        .put(&job)
                        .await
                        .map_err(|e| OrchestratorError::Transient(e.to_string()))?;
                    self.push_ready(&job);
                    resumed += 1;
                }
                _ => {}
            }
        }
        if resumed > 0 {
            info!(resumed = resumed, "Resumed persisted jobs after restart");
        }
        Ok(resumed)
    }
}
