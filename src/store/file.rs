//! File-backed job store.
//!
//! Each job is one JSON document under `jobs/`, each recorded message one
//! document under `messages/`, and each job's audit trail a JSON-lines
//! file under `audit/`. The full working set is loaded at open and kept in
//! memory; every mutation is written through while the store lock is held,
//! so per-job write serialization extends to the files. Job documents are
//! written to a temp file and renamed into place.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{JobStore, StoreState, TaskPatch};
use crate::{
    models::{AuditEntry, Job, JobStatus},
    protocol::Envelope,
    ConductorError, Result,
};

pub struct FileJobStore {
    state: Mutex<StoreState>,
    jobs_dir: PathBuf,
    messages_dir: PathBuf,
    audit_dir: PathBuf,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> ConductorError {
    ConductorError::Storage {
        message: format!("{context}: {e}"),
    }
}

impl FileJobStore {
    /// Open (or initialize) a store rooted at `data_dir`, loading all
    /// persisted jobs and messages.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let jobs_dir = data_dir.join("jobs");
        let messages_dir = data_dir.join("messages");
        let audit_dir = data_dir.join("audit");
        for dir in [&jobs_dir, &messages_dir, &audit_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| storage_err("Creating store directory", e))?;
        }

        let mut state = StoreState::default();

        let mut entries = tokio::fs::read_dir(&jobs_dir)
            .await
            .map_err(|e| storage_err("Reading jobs directory", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("Reading jobs directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<Job>(&path).await {
                Ok(job) => {
                    state.jobs.insert(job.id.clone(), job);
                }
                Err(e) => warn!("Skipping unreadable job document {:?}: {}", path, e),
            }
        }

        let mut entries = tokio::fs::read_dir(&messages_dir)
            .await
            .map_err(|e| storage_err("Reading messages directory", e))?;
        let mut envelopes: Vec<Envelope> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("Reading messages directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<Envelope>(&path).await {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!("Skipping unreadable message document {:?}: {}", path, e),
            }
        }
        // Rebuild the conversation index in arrival order.
        envelopes.sort_by(|a, b| a.ts.cmp(&b.ts));
        for envelope in &envelopes {
            state.apply_message(envelope);
        }

        info!(
            jobs = state.jobs.len(),
            messages = state.messages.len(),
            "File job store opened at {:?}",
            data_dir
        );

        Ok(Self {
            state: Mutex::new(state),
            jobs_dir,
            messages_dir,
            audit_dir,
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| storage_err("Reading document", e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let raw = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|e| storage_err("Writing document", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| storage_err("Replacing document", e))?;
        Ok(())
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }

    async fn persist_job(&self, job: &Job) -> Result<()> {
        Self::write_json_atomic(&self.job_path(&job.id), job).await
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().await;
        state.apply_save(job);
        let stored = state.jobs.get(&job.id).cloned().expect("just inserted");
        self.persist_job(&stored).await
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
        let mut state = self.state.lock().await;
        let job = state.apply_status(job_id, status, error)?;
        self.persist_job(&job).await?;
        Ok(job)
    }

    async fn update_task(&self, job_id: &str, task_id: &str, patch: TaskPatch) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state.apply_task_patch(job_id, task_id, patch)?;
        self.persist_job(&job).await?;
        Ok(job)
    }

    async fn set_job_result(&self, job_id: &str, result: HashMap<String, Value>) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Job {job_id}")))?;
        job.result = result;
        let job = job.clone();
        self.persist_job(&job).await
    }

    async fn retry_job(&self, job_id: &str) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state.apply_retry(job_id)?;
        self.persist_job(&job).await?;
        Ok(job)
    }

    async fn record_message(&self, envelope: &Envelope) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.apply_message(envelope) {
            return Ok(false);
        }
        let path = self.messages_dir.join(format!("{}.json", envelope.id));
        Self::write_json_atomic(&path, envelope).await?;
        Ok(true)
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
        let path = self.audit_dir.join(format!("{}.jsonl", entry.job_id));
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage_err("Opening audit file", e))?;
        file.write_all(&line)
            .await
            .map_err(|e| storage_err("Appending audit entry", e))?;
        Ok(())
    }

    async fn audit_for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>> {
        let path = self.audit_dir.join(format!("{job_id}.jsonl"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("Reading audit file", e)),
        };
        let mut entries: Vec<AuditEntry> = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            entries.push(serde_json::from_str(line)?);
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    async fn health(&self) -> Result<()> {
        tokio::fs::metadata(&self.jobs_dir)
            .await
            .map_err(|e| storage_err("Store directory unavailable", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, Task, TaskStatus};
    use crate::protocol::MessageType;
    use tempfile::tempdir;

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempdir().unwrap();

        let job_id = {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            let mut job = Job::new("calculate");
            job.tasks
                .insert("t1".to_string(), Task::new("t1", ActionType::CallAgent, "calculate"));
            store.save_job(&job).await.unwrap();
            store.update_status(&job.id, JobStatus::Running, None).await.unwrap();
            store
                .update_task(&job.id, "t1", TaskPatch::status(TaskStatus::Done))
                .await
                .unwrap();
            job.id
        };

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let job = reopened.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.tasks["t1"].status, TaskStatus::Done);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn messages_survive_reopen_with_conversation_index() {
        let dir = tempdir().unwrap();

        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            let request = Envelope::new(MessageType::Request, "agent://conductor/orchestrator", "calc")
                .with_conversation("job-7");
            let reply = request.reply(MessageType::Inform, "agent://calc/calc");
            store.record_message(&request).await.unwrap();
            store.record_message(&reply).await.unwrap();
            // Duplicate is refused
            assert!(!store.record_message(&request).await.unwrap());
        }

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let messages = reopened.messages_by_conversation("job-7").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, MessageType::Request);
        assert_eq!(messages[1].message_type, MessageType::Inform);
    }

    #[tokio::test]
    async fn audit_is_append_only_and_time_ordered() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        store
            .append_audit(&AuditEntry::new("job-1", "dispatch", "success"))
            .await
            .unwrap();
        store
            .append_audit(&AuditEntry::new("job-1", "task-done", "success"))
            .await
            .unwrap();
        store
            .append_audit(&AuditEntry::new("job-2", "dispatch", "success"))
            .await
            .unwrap();

        let entries = store.audit_for_job("job-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "dispatch");
        assert_eq!(entries[1].action, "task-done");

        assert!(store.audit_for_job("job-unknown").await.unwrap().is_empty());
    }
}
