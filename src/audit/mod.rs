//! Append-only audit trail.
//!
//! Every state transition and agent exchange produces one entry, persisted
//! through the job store. Evidence blobs (screenshots, payload dumps) live
//! in a content-addressed directory keyed by their SHA-256 hash, so an
//! entry's evidence reference is stable and deduplicating.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{
    models::AuditEntry,
    protocol::Envelope,
    store::JobStore,
    ConductorError, Result,
};

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn JobStore>,
    evidence_dir: PathBuf,
}

impl AuditLog {
    pub async fn open(store: Arc<dyn JobStore>, data_dir: impl AsRef<Path>) -> Result<Self> {
        let evidence_dir = data_dir.as_ref().join("evidence");
        tokio::fs::create_dir_all(&evidence_dir)
            .await
            .map_err(|e| ConductorError::Storage {
                message: format!("Creating evidence directory: {e}"),
            })?;
        Ok(Self {
            store,
            evidence_dir,
        })
    }

    /// Append one entry.
    pub async fn record(&self, entry: AuditEntry) -> Result<()> {
        debug!(
            job_id = %entry.job_id,
            action = %entry.action,
            status = %entry.status,
            "audit"
        );
        self.store.append_audit(&entry).await
    }

    /// Persist an envelope for replay and record the exchange in the
    /// trail. `direction` is `outbound` or `inbound`.
    pub async fn record_exchange(
        &self,
        job_id: &str,
        envelope: &Envelope,
        direction: &str,
    ) -> Result<()> {
        self.store.record_message(envelope).await?;
        self.record(
            AuditEntry::new(job_id, format!("message-{direction}"), "recorded")
                .with_detail("message_id", serde_json::Value::String(envelope.id.clone()))
                .with_detail(
                    "message_type",
                    serde_json::to_value(envelope.message_type)?,
                )
                .with_detail("sender", serde_json::Value::String(envelope.sender.clone())),
        )
        .await
    }

    /// Entries for one job in time order.
    pub async fn entries_for_job(&self, job_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_job(job_id).await
    }

    /// Store an evidence blob and return its reference (`<hash>.<ext>`).
    /// Re-storing identical content yields the same reference.
    pub async fn store_evidence(&self, content: &[u8], extension: &str) -> Result<String> {
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConductorError::Validation(format!(
                "Invalid evidence extension: {extension}"
            )));
        }
        let hash = Sha256::digest(content)
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        let reference = format!("{hash}.{extension}");
        let path = self.evidence_dir.join(&reference);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(reference);
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ConductorError::Storage {
                message: format!("Writing evidence blob: {e}"),
            })?;
        Ok(reference)
    }

    /// Fetch an evidence blob by reference.
    pub async fn load_evidence(&self, reference: &str) -> Result<Vec<u8>> {
        // References are `<hex>.<ext>`; anything else could escape the
        // evidence directory.
        let valid = reference.split_once('.').is_some_and(|(hash, ext)| {
            hash.len() == 64
                && hash.chars().all(|c| c.is_ascii_hexdigit())
                && !ext.is_empty()
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });
        if !valid {
            return Err(ConductorError::Validation(format!(
                "Invalid evidence reference: {reference}"
            )));
        }
        let path = self.evidence_dir.join(reference);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConductorError::NotFound(format!("Evidence {reference}"))
            } else {
                ConductorError::Storage {
                    message: format!("Reading evidence blob: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use crate::store::MemoryJobStore;
    use tempfile::tempdir;

    async fn audit_log(dir: &Path) -> AuditLog {
        AuditLog::open(Arc::new(MemoryJobStore::new()), dir).await.unwrap()
    }

    #[tokio::test]
    async fn entries_come_back_in_time_order() {
        let dir = tempdir().unwrap();
        let log = audit_log(dir.path()).await;

        log.record(AuditEntry::new("job-1", "dispatch", "success"))
            .await
            .unwrap();
        log.record(AuditEntry::new("job-1", "task-done", "success"))
            .await
            .unwrap();

        let entries = log.entries_for_job("job-1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "dispatch");
        assert_eq!(entries[1].action, "task-done");
    }

    #[tokio::test]
    async fn evidence_is_content_addressed() {
        let dir = tempdir().unwrap();
        let log = audit_log(dir.path()).await;

        let first = log.store_evidence(b"screenshot-bytes", "png").await.unwrap();
        let second = log.store_evidence(b"screenshot-bytes", "png").await.unwrap();
        assert_eq!(first, second);
        assert!(first.ends_with(".png"));

        let loaded = log.load_evidence(&first).await.unwrap();
        assert_eq!(loaded, b"screenshot-bytes");
    }

    #[tokio::test]
    async fn traversal_references_are_rejected() {
        let dir = tempdir().unwrap();
        let log = audit_log(dir.path()).await;

        assert!(log.load_evidence("../secrets.txt").await.is_err());
        assert!(log.load_evidence("nothex.png").await.is_err());
        assert!(log
            .load_evidence(&format!("{}.p/ng", "a".repeat(64)))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn record_exchange_persists_message_and_entry() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let log = AuditLog::open(store.clone(), dir.path()).await.unwrap();

        let envelope = Envelope::new(MessageType::Request, "agent://conductor/orchestrator", "calc")
            .with_conversation("job-1");
        log.record_exchange("job-1", &envelope, "outbound").await.unwrap();

        assert!(store.get_message(&envelope.id).await.unwrap().is_some());
        let entries = log.entries_for_job("job-1").await.unwrap();
        assert_eq!(entries[0].action, "message-outbound");
    }
}
