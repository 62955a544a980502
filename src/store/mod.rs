//! Durable persistence for jobs, messages and audit entries.
//!
//! The store exclusively owns the durable representation of every job and
//! its task map. All writes to one job are serialized behind the store's
//! lock, so at most one task status change is applied at a time and the
//! driver loop always reads a consistent document.

mod file;

pub use file::FileJobStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{
    models::{AuditEntry, Job, JobStatus, TaskStatus},
    protocol::Envelope,
    ConductorError, Result,
};

/// Partial update applied to one task inside a job.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub increment_attempt: bool,
    pub increment_no_agent: bool,
    pub reset_no_agent: bool,
    /// Stamp `dispatched_at` with the current time.
    pub mark_dispatched: bool,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn incrementing_attempt(mut self) -> Self {
        self.increment_attempt = true;
        self
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a job. Idempotent on job id: repeated saves overwrite in
    /// place without changing the creation time.
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// List jobs newest-first, optionally filtered by status. Returns the
    /// page and the total count matching the filter.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, usize)>;

    /// Atomically transition a job's status, stamping `started_at` on the
    /// first move to running and `completed_at` on terminal states.
    /// Rejects transitions the status machine does not allow.
    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job>;

    /// Atomically patch one task within a job.
    async fn update_task(&self, job_id: &str, task_id: &str, patch: TaskPatch) -> Result<Job>;

    /// Replace the job's aggregated result payload.
    async fn set_job_result(&self, job_id: &str, result: HashMap<String, Value>) -> Result<()>;

    /// Operator-triggered retry: failed → pending, incrementing
    /// `retry_count`, resetting failed/skipped tasks while preserving done
    /// ones and the audit history.
    async fn retry_job(&self, job_id: &str) -> Result<Job>;

    /// Record a message for replay. Returns false (and changes nothing)
    /// when the message id was already recorded.
    async fn record_message(&self, envelope: &Envelope) -> Result<bool>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Envelope>>;

    async fn messages_by_conversation(&self, conversation_id: &str) -> Result<Vec<Envelope>>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Audit entries for one job in time order.
    async fn audit_for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>>;

    /// Liveness probe used by the health endpoint.
    async fn health(&self) -> Result<()>;
}

/// Shared mutable state behind both store implementations.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub jobs: HashMap<String, Job>,
    pub messages: HashMap<String, Envelope>,
    /// conversation id → message ids in arrival order
    pub by_conversation: HashMap<String, Vec<String>>,
    pub audit: Vec<AuditEntry>,
}

impl StoreState {
    pub fn apply_save(&mut self, job: &Job) {
        let mut job = job.clone();
        // Idempotent save keeps the original creation time.
        if let Some(existing) = self.jobs.get(&job.id) {
            job.created_at = existing.created_at;
        }
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn apply_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Job {job_id}")))?;

        if !job.status.can_transition_to(status) {
            return Err(ConductorError::IllegalTransition {
                message: format!("Job {job_id}: {} -> {status} is not allowed", job.status),
            });
        }

        job.status = status;
        if let Some(error) = error {
            job.error = Some(error);
        }
        let now = chrono::Utc::now();
        if status == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if status.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(job.clone())
    }

    pub fn apply_task_patch(
        &mut self,
        job_id: &str,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Job {job_id}")))?;
        let task = job
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Task {task_id} in job {job_id}")))?;

        if let Some(status) = patch.status {
            // A finished task never leaves done within the same attempt.
            if task.status == TaskStatus::Done && status != TaskStatus::Done {
                return Err(ConductorError::IllegalTransition {
                    message: format!("Task {task_id} is done and cannot become {status:?}"),
                });
            }
            task.status = status;
        }
        if let Some(result) = patch.result {
            task.result = Some(result);
        }
        if let Some(error) = patch.error {
            task.error = Some(error);
        }
        if patch.increment_attempt {
            task.attempt_count += 1;
        }
        if patch.increment_no_agent {
            task.no_agent_count += 1;
        }
        if patch.reset_no_agent {
            task.no_agent_count = 0;
        }
        if patch.mark_dispatched {
            task.dispatched_at = Some(chrono::Utc::now());
        }
        Ok(job.clone())
    }

    pub fn apply_retry(&mut self, job_id: &str) -> Result<Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Job {job_id}")))?;

        if job.status != JobStatus::Failed {
            return Err(ConductorError::IllegalTransition {
                message: format!("Job {job_id} is {} and cannot be retried", job.status),
            });
        }
        if job.retry_count >= job.max_retries {
            return Err(ConductorError::IllegalTransition {
                message: format!("Job {job_id} has exceeded maximum retries"),
            });
        }

        job.retry_count += 1;
        job.status = JobStatus::Pending;
        job.error = None;
        job.completed_at = None;
        for task in job.tasks.values_mut() {
            if matches!(task.status, TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Running)
            {
                task.status = TaskStatus::Pending;
                task.error = None;
                task.attempt_count = 0;
                task.no_agent_count = 0;
            }
        }
        Ok(job.clone())
    }

    pub fn apply_message(&mut self, envelope: &Envelope) -> bool {
        if self.messages.contains_key(&envelope.id) {
            return false;
        }
        if let Some(conversation) = &envelope.correlation.conversation_id {
            self.by_conversation
                .entry(conversation.clone())
                .or_default()
                .push(envelope.id.clone());
        }
        self.messages.insert(envelope.id.clone(), envelope.clone());
        true
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> (Vec<Job>, usize) {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .collect();
        // Newest first; id as secondary key keeps the order stable when
        // timestamps collide.
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = jobs.len();
        let page = jobs.into_iter().skip(offset).take(limit).cloned().collect();
        (page, total)
    }
}

/// In-memory store used by tests and available for ephemeral deployments.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.state.lock().await.apply_save(job);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, usize)> {
        Ok(self.state.lock().await.list(status, limit, offset))
    }

    async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<Job> {
        self.state.lock().await.apply_status(job_id, status, error)
    }

    async fn update_task(&self, job_id: &str, task_id: &str, patch: TaskPatch) -> Result<Job> {
        self.state.lock().await.apply_task_patch(job_id, task_id, patch)
    }

    async fn set_job_result(&self, job_id: &str, result: HashMap<String, Value>) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Job {job_id}")))?;
        job.result = result;
        Ok(())
    }

    async fn retry_job(&self, job_id: &str) -> Result<Job> {
        self.state.lock().await.apply_retry(job_id)
    }

    async fn record_message(&self, envelope: &Envelope) -> Result<bool> {
        Ok(self.state.lock().await.apply_message(envelope))
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Envelope>> {
        Ok(self.state.lock().await.messages.get(message_id).cloned())
    }

    async fn messages_by_conversation(&self, conversation_id: &str) -> Result<Vec<Envelope>> {
        let state = self.state.lock().await;
        let ids = state.by_conversation.get(conversation_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.state.lock().await.audit.push(entry.clone());
        Ok(())
    }

    async fn audit_for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
