mod unit;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::{
    audit::AuditLog,
    config::DispatchConfig,
    dispatch::Dispatcher,
    models::{Job, JobStatus},
    orchestrator::Orchestrator,
    policy::{PolicyConfig, PolicyEngine},
    queue::JobQueue,
    registry::AgentRegistry,
    store::{JobStore, MemoryJobStore},
};

/// Fully wired orchestrator over an in-memory store with its run loop
/// spawned in the background.
pub(crate) struct Harness {
    pub orchestrator: Orchestrator,
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn JobStore>,
    _data_dir: TempDir,
}

pub(crate) async fn harness() -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let registry = Arc::new(AgentRegistry::new());
    let audit = AuditLog::open(store.clone(), data_dir.path()).await.unwrap();
    let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
    let dispatcher = Dispatcher::new(store.clone(), registry.clone(), policy, audit.clone());
    let config = DispatchConfig {
        default_timeout_secs: 5,
        task_max_attempts: 2,
        no_agent_attempts: 2,
        job_max_retries: 3,
        job_deadline_secs: None,
    };
    let orchestrator = Orchestrator::new(store.clone(), JobQueue::new(), dispatcher, audit, config);

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let _ = orchestrator.run().await;
        });
    }

    Harness {
        orchestrator,
        registry,
        store,
        _data_dir: data_dir,
    }
}

/// Poll the store until the job reaches `expected` or the timeout lapses.
pub(crate) async fn wait_for_status(
    store: &Arc<dyn JobStore>,
    job_id: &str,
    expected: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(job) = store.get_job(job_id).await.unwrap() {
            if job.status == expected {
                return job;
            }
            assert!(
                !job.status.is_terminal() || job.status == expected,
                "job {job_id} reached terminal status {:?} while waiting for {expected:?} (error: {:?})",
                job.status,
                job.error
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {job_id} to become {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
