//! Orchestrator: one driver per active job.
//!
//! The run loop consumes job ids from the queue and spawns a driver task
//! for each. A driver repeatedly reads the job from the store, advances
//! whatever became ready, and sleeps until a reply notification or a poll
//! interval elapses. All task status changes go through the store, which
//! serializes writes per job, so a driver crash or restart resumes from
//! the persisted document.
//!
//! Cancellation is cooperative: the cancel call flips the job's status and
//! returns; the driver stops issuing dispatches on its next scan, and
//! late replies are recorded without transitioning the terminal job.

#[cfg(test)]
pub(crate) mod tests;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::{
    audit::AuditLog,
    config::DispatchConfig,
    constants::{DRIVER_POLL_INTERVAL_MS, NO_AGENT_REQUEUE_DELAY_MS},
    dispatch::{backoff_delay, DispatchOutcome, Dispatcher},
    graph::TaskGraph,
    models::{AuditEntry, Job, JobStatus, PlanMode, TaskStatus},
    protocol::{Envelope, WorkflowContext, WorkflowStep},
    queue::JobQueue,
    store::{JobStore, TaskPatch},
    telemetry::Telemetry,
    ConductorError, Result,
};

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    queue: JobQueue,
    dispatcher: Dispatcher,
    audit: AuditLog,
    config: DispatchConfig,
    telemetry: Arc<Telemetry>,
    /// Per-job wakeup signals; replies arriving through the intake API
    /// notify the job's driver instead of waiting out the poll interval.
    wakers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: JobQueue,
        dispatcher: Dispatcher,
        audit: AuditLog,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            dispatcher,
            audit,
            config,
            telemetry: Arc::new(Telemetry::new()),
            wakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume the queue forever, spawning one driver per dequeued job.
    pub async fn run(&self) -> Result<()> {
        info!("Orchestrator started");
        loop {
            let job_id = self.queue.dequeue_wait().await;
            let orchestrator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.drive_job(&job_id).await {
                    error!(job_id = %job_id, "Job driver failed: {}", e);
                    let _ = orchestrator
                        .store
                        .update_status(&job_id, JobStatus::Failed, Some(e.to_string()))
                        .await;
                    let _ = orchestrator
                        .audit
                        .record(
                            AuditEntry::new(&job_id, "driver-error", "failed")
                                .with_detail("error", json!(e.kind()))
                                .with_detail("message", json!(e.to_string())),
                        )
                        .await;
                }
            });
        }
    }

    /// Persist and enqueue a new job.
    pub async fn submit_job(&self, job: Job) -> Result<String> {
        let job_id = job.id.clone();
        self.store.save_job(&job).await?;
        self.audit
            .record(
                AuditEntry::new(&job_id, "job-submitted", "pending")
                    .with_detail("intent", json!(job.intent))
                    .with_detail("task_count", json!(job.task_count()))
                    .with_detail("mode", serde_json::to_value(job.mode)?),
            )
            .await?;
        self.queue.enqueue(&job_id).await?;
        info!(job_id = %job_id, intent = %job.intent, "Job submitted");
        Ok(job_id)
    }

    /// Cooperative cancel: transition the job and return immediately. The
    /// driver observes the terminal status on its next scan.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let job = self
            .store
            .update_status(job_id, JobStatus::Cancelled, Some("cancelled".to_string()))
            .await?;
        self.audit
            .record(AuditEntry::new(job_id, "job-cancelled", "cancelled"))
            .await?;
        self.telemetry.job_cancelled();
        self.notify_job(job_id).await;
        Ok(job)
    }

    /// Operator-triggered retry of a failed job.
    pub async fn retry_job(&self, job_id: &str) -> Result<Job> {
        let job = self.store.retry_job(job_id).await?;
        self.audit
            .record(
                AuditEntry::new(job_id, "retry", "pending")
                    .with_detail("retry_count", json!(job.retry_count)),
            )
            .await?;
        self.telemetry.job_retried();
        self.queue.enqueue(job_id).await?;
        Ok(job)
    }

    async fn waker(&self, job_id: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().await;
        wakers
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn notify_job(&self, job_id: &str) {
        let wakers = self.wakers.lock().await;
        if let Some(notify) = wakers.get(job_id) {
            notify.notify_one();
        }
    }

    async fn drop_waker(&self, job_id: &str) {
        self.wakers.lock().await.remove(job_id);
    }

    /// Drive one job to a terminal state.
    async fn drive_job(&self, job_id: &str) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            warn!(job_id, "Dequeued job not found in store");
            return Ok(());
        };
        if job.status.is_terminal() {
            // Stale queue entry (e.g. cancelled while queued).
            return Ok(());
        }

        if job.status == JobStatus::Pending {
            self.store.update_status(job_id, JobStatus::Running, None).await?;
            self.audit
                .record(AuditEntry::new(job_id, "job-started", "running"))
                .await?;
            self.telemetry.job_started();
        }

        // A plan with zero tasks is complete by definition.
        if job.tasks.is_empty() {
            self.store.update_status(job_id, JobStatus::Done, None).await?;
            self.audit
                .record(AuditEntry::new(job_id, "job-done", "done"))
                .await?;
            self.telemetry.job_done();
            return Ok(());
        }

        let waker = self.waker(job_id).await;
        let result = match job.mode {
            PlanMode::Handoff => self.drive_handoff(job_id, &waker).await,
            PlanMode::Orchestrated => self.drive_orchestrated(job_id, &waker).await,
        };
        self.drop_waker(job_id).await;
        result
    }

    async fn drive_orchestrated(&self, job_id: &str, waker: &Arc<Notify>) -> Result<()> {
        loop {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Err(ConductorError::NotFound(format!("Job {job_id}")));
            };

            if job.status.is_terminal() {
                debug!(job_id, status = %job.status, "Driver exiting on terminal status");
                return Ok(());
            }

            if self.deadline_exceeded(&job) {
                self.store
                    .update_status(job_id, JobStatus::Failed, Some("Job deadline exceeded".into()))
                    .await?;
                self.audit
                    .record(
                        AuditEntry::new(job_id, "job-failed", "failed")
                            .with_detail("error", json!("timeout")),
                    )
                    .await?;
                self.telemetry.job_failed();
                return Ok(());
            }

            self.expire_overdue_replies(&job).await?;

            // Prune branches whose upstream failed or was pruned.
            for task_id in TaskGraph::prunable_tasks(&job.tasks) {
                self.store
                    .update_task(job_id, &task_id, TaskPatch::status(TaskStatus::Skipped))
                    .await?;
                self.audit
                    .record(
                        AuditEntry::new(job_id, "task-skipped", "skipped")
                            .with_detail("task_id", json!(task_id)),
                    )
                    .await?;
            }

            // Re-read after expiry and pruning.
            let Some(job) = self.store.get_job(job_id).await? else {
                return Err(ConductorError::NotFound(format!("Job {job_id}")));
            };

            if job.all_tasks_done() {
                let result = Self::aggregate_results(&job);
                self.store.set_job_result(job_id, result).await?;
                self.store.update_status(job_id, JobStatus::Done, None).await?;
                self.audit
                    .record(AuditEntry::new(job_id, "job-done", "done"))
                    .await?;
                self.telemetry.job_done();
                info!(job_id, "Job completed");
                return Ok(());
            }

            if let Some(failed) = job.first_failed_task() {
                let reason = failed
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("Task {} failed", failed.id));
                self.store
                    .update_status(job_id, JobStatus::Failed, Some(reason.clone()))
                    .await?;
                self.audit
                    .record(
                        AuditEntry::new(job_id, "job-failed", "failed")
                            .with_detail("task_id", json!(failed.id))
                            .with_detail("error", json!(reason)),
                    )
                    .await?;
                self.telemetry.job_failed();
                info!(job_id, task_id = %failed.id, "Job failed");
                return Ok(());
            }

            let ready = TaskGraph::ready_tasks(&job.tasks);
            if !ready.is_empty() {
                let saw_no_agent = self.dispatch_batch(&job, &ready).await?;
                if saw_no_agent {
                    // Backpressure: give agents a chance to register or
                    // recover before rescanning.
                    tokio::time::sleep(Duration::from_millis(NO_AGENT_REQUEUE_DELAY_MS)).await;
                }
                continue;
            }

            // Nothing ready: wait for a reply notification or poll again.
            tokio::select! {
                _ = waker.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(DRIVER_POLL_INTERVAL_MS)) => {}
            }
        }
    }

    /// Mark every ready task running, then send the requests concurrently.
    /// Returns true when at least one task found no agent.
    async fn dispatch_batch(&self, job: &Job, ready: &[String]) -> Result<bool> {
        // Two passes: siblings in one batch must all be observably running
        // before the first reply can land.
        for task_id in ready {
            self.store
                .update_task(
                    &job.id,
                    task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Running),
                        mark_dispatched: true,
                        ..Default::default()
                    },
                )
                .await?;
            self.audit
                .record(
                    AuditEntry::new(&job.id, "task-running", "running")
                        .with_detail("task_id", json!(task_id)),
                )
                .await?;
        }

        let Some(job) = self.store.get_job(&job.id).await? else {
            return Err(ConductorError::NotFound(format!("Job {}", job.id)));
        };
        self.telemetry.tasks_dispatched(ready.len() as u64);

        let mut handles = Vec::with_capacity(ready.len());
        for task_id in ready {
            let Some(task) = job.tasks.get(task_id).cloned() else {
                continue;
            };
            let orchestrator = self.clone();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                let outcome = orchestrator.dispatcher.dispatch_task(&job, &task, None).await;
                match outcome {
                    Ok(outcome) => orchestrator.apply_outcome(&job.id, &task.id, outcome).await,
                    Err(e) => {
                        orchestrator
                            .apply_outcome(&job.id, &task.id, DispatchOutcome::Failed { error: e })
                            .await
                    }
                }
            }));
        }

        let mut saw_no_agent = false;
        for handle in handles {
            match handle.await {
                Ok(Ok(no_agent)) => saw_no_agent |= no_agent,
                Ok(Err(e)) => warn!(job_id = %job.id, "Outcome application failed: {}", e),
                Err(e) => warn!(job_id = %job.id, "Dispatch task panicked: {}", e),
            }
        }
        Ok(saw_no_agent)
    }

    /// Apply a dispatch outcome to a task. Returns true for the no-agent
    /// case so the caller can back off.
    ///
    /// The task is re-read and the outcome only applied while it is still
    /// `running`; a reply that raced with cancellation or a synthesized
    /// timeout is recorded in the audit trail but changes nothing else.
    async fn apply_outcome(
        &self,
        job_id: &str,
        task_id: &str,
        outcome: DispatchOutcome,
    ) -> Result<bool> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(ConductorError::NotFound(format!("Job {job_id}")));
        };
        let Some(task) = job.tasks.get(task_id) else {
            return Err(ConductorError::NotFound(format!("Task {task_id}")));
        };

        if job.status.is_terminal() {
            // Late result for a closed job: record, and fail the task that
            // was still in flight when the job was cancelled.
            self.audit
                .record(
                    AuditEntry::new(job_id, "late-reply", "ignored")
                        .with_detail("task_id", json!(task_id))
                        .with_detail("job_status", json!(job.status.to_string())),
                )
                .await?;
            if task.status == TaskStatus::Running && job.status == JobStatus::Cancelled {
                self.store
                    .update_task(
                        job_id,
                        task_id,
                        TaskPatch::status(TaskStatus::Failed).with_error("cancelled"),
                    )
                    .await?;
            }
            return Ok(false);
        }

        if task.status != TaskStatus::Running {
            self.audit
                .record(
                    AuditEntry::new(job_id, "stale-outcome", "ignored")
                        .with_detail("task_id", json!(task_id)),
                )
                .await?;
            return Ok(false);
        }

        match outcome {
            DispatchOutcome::Completed { result } => {
                self.store
                    .update_task(
                        job_id,
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Done),
                            result: Some(result),
                            increment_attempt: true,
                            reset_no_agent: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.audit
                    .record(
                        AuditEntry::new(job_id, "task-done", "done")
                            .with_detail("task_id", json!(task_id)),
                    )
                    .await?;
                self.telemetry.task_done();
                self.notify_job(job_id).await;
                Ok(false)
            }
            DispatchOutcome::AwaitingReply => Ok(false),
            DispatchOutcome::NoAgent => {
                let exhausted = task.no_agent_count + 1 >= self.config.no_agent_attempts;
                if exhausted {
                    self.store
                        .update_task(
                            job_id,
                            task_id,
                            TaskPatch::status(TaskStatus::Failed)
                                .with_error(format!(
                                    "No agent available for capability '{}'",
                                    task.capability()
                                )),
                        )
                        .await?;
                    self.audit
                        .record(
                            AuditEntry::new(job_id, "task-failed", "failed")
                                .with_detail("task_id", json!(task_id))
                                .with_detail("error", json!("agent_unavailable")),
                        )
                        .await?;
                    self.telemetry.task_failed();
                } else {
                    self.store
                        .update_task(
                            job_id,
                            task_id,
                            TaskPatch {
                                status: Some(TaskStatus::Pending),
                                increment_no_agent: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.audit
                        .record(
                            AuditEntry::new(job_id, "task-requeued", "no-agent")
                                .with_detail("task_id", json!(task_id))
                                .with_detail("attempt", json!(task.no_agent_count + 1)),
                        )
                        .await?;
                }
                self.notify_job(job_id).await;
                Ok(!exhausted)
            }
            DispatchOutcome::Failed { error } => {
                let attempts_made = task.attempt_count + 1;
                let retryable = error.is_retryable() && attempts_made < task.max_attempts;
                self.audit
                    .record(
                        AuditEntry::new(job_id, "task-attempt-failed", "failed")
                            .with_detail("task_id", json!(task_id))
                            .with_detail("kind", json!(error.kind()))
                            .with_detail("error", json!(error.to_string()))
                            .with_detail("attempt", json!(attempts_made))
                            .with_detail("will_retry", json!(retryable)),
                    )
                    .await?;

                if retryable {
                    self.telemetry.task_retried();
                    self.store
                        .update_task(
                            job_id,
                            task_id,
                            TaskPatch::status(TaskStatus::Running).incrementing_attempt(),
                        )
                        .await?;
                    tokio::time::sleep(backoff_delay(attempts_made)).await;
                    // The job may have been cancelled during the back-off.
                    let still_open = self
                        .store
                        .get_job(job_id)
                        .await?
                        .map(|j| !j.status.is_terminal())
                        .unwrap_or(false);
                    if still_open {
                        self.store
                            .update_task(job_id, task_id, TaskPatch::status(TaskStatus::Pending))
                            .await?;
                    }
                } else {
                    self.store
                        .update_task(
                            job_id,
                            task_id,
                            TaskPatch::status(TaskStatus::Failed)
                                .with_error(error.to_string())
                                .incrementing_attempt(),
                        )
                        .await?;
                    self.telemetry.task_failed();
                }
                self.notify_job(job_id).await;
                Ok(false)
            }
        }
    }

    /// Synthesize timeout failures for running tasks whose reply-wait
    /// deadline passed. The HTTP round trip already enforces the same
    /// bound, so this only fires for agents that acked and went silent.
    async fn expire_overdue_replies(&self, job: &Job) -> Result<()> {
        let now = chrono::Utc::now();
        for task in job.tasks.values() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let Some(dispatched_at) = task.dispatched_at else {
                continue;
            };
            // Grace of one poll interval on top of the task timeout keeps
            // this from racing the synchronous HTTP path.
            let deadline = dispatched_at
                + chrono::Duration::seconds(task.timeout_secs as i64)
                + chrono::Duration::milliseconds(2 * DRIVER_POLL_INTERVAL_MS as i64);
            if now > deadline {
                warn!(job_id = %job.id, task_id = %task.id, "Reply-wait deadline exceeded");
                self.apply_outcome(
                    &job.id,
                    &task.id,
                    DispatchOutcome::Failed {
                        error: ConductorError::Timeout {
                            message: format!(
                                "No reply within {}s of dispatch",
                                task.timeout_secs
                            ),
                        },
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    fn deadline_exceeded(&self, job: &Job) -> bool {
        let deadline = job.deadline_secs.or(self.config.job_deadline_secs);
        match (deadline, job.started_at) {
            (Some(secs), Some(started_at)) => {
                chrono::Utc::now() - started_at > chrono::Duration::seconds(secs as i64)
            }
            _ => false,
        }
    }

    /// Aggregate per-task results into the job result payload. `output`
    /// carries the result of the last task in topological order, which for
    /// linear pipelines is the pipeline's product.
    fn aggregate_results(job: &Job) -> HashMap<String, Value> {
        let mut per_task = serde_json::Map::new();
        for (task_id, task) in &job.tasks {
            if let Some(result) = &task.result {
                per_task.insert(task_id.clone(), result.clone());
            }
        }

        let mut aggregated = HashMap::new();
        let graph = TaskGraph::from_tasks(&job.tasks);
        if let Ok(order) = graph.topo_order() {
            if let Some(last) = order.last() {
                if let Some(result) = job.tasks.get(last).and_then(|t| t.result.clone()) {
                    aggregated.insert("output".to_string(), result);
                }
            }
        }
        aggregated.insert("tasks".to_string(), Value::Object(per_task));
        aggregated
    }

    // ----- handoff mode -----

    /// Dispatch only the first step, embedding the whole chain in the
    /// request payload, then wait for the final reply.
    async fn drive_handoff(&self, job_id: &str, waker: &Arc<Notify>) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(ConductorError::NotFound(format!("Job {job_id}")));
        };

        let graph = TaskGraph::from_tasks(&job.tasks);
        let order = graph.topo_order()?;
        let first_id = order.first().cloned().expect("non-empty checked by caller");

        let steps: Vec<WorkflowStep> = order
            .iter()
            .filter_map(|id| job.tasks.get(id))
            .map(|task| WorkflowStep {
                agent: task.capability().to_string(),
                intent: task.text.clone().unwrap_or_else(|| task.capability().to_string()),
                payload: task.payload.clone().into_iter().collect(),
            })
            .collect();
        let context = WorkflowContext::new(steps);

        self.store
            .update_task(
                job_id,
                &first_id,
                TaskPatch {
                    status: Some(TaskStatus::Running),
                    increment_attempt: true,
                    mark_dispatched: true,
                    ..Default::default()
                },
            )
            .await?;
        self.audit
            .record(
                AuditEntry::new(job_id, "handoff-dispatch", "running")
                    .with_detail("task_id", json!(first_id))
                    .with_detail("chain_length", json!(order.len())),
            )
            .await?;

        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(ConductorError::NotFound(format!("Job {job_id}")));
        };
        let task = job.tasks.get(&first_id).cloned().expect("first task exists");

        match self.dispatcher.dispatch_task(&job, &task, Some(&context)).await {
            Ok(DispatchOutcome::Completed { result }) => {
                self.finalize_handoff(job_id, &result).await
            }
            Ok(DispatchOutcome::AwaitingReply) => {
                // The chain runs agent-to-agent; wait for the final reply
                // delivered through the intake API.
                loop {
                    let Some(job) = self.store.get_job(job_id).await? else {
                        return Err(ConductorError::NotFound(format!("Job {job_id}")));
                    };
                    if job.status.is_terminal() {
                        return Ok(());
                    }
                    if self.deadline_exceeded(&job) {
                        self.store
                            .update_status(
                                job_id,
                                JobStatus::Failed,
                                Some("Job deadline exceeded".into()),
                            )
                            .await?;
                        self.audit
                            .record(
                                AuditEntry::new(job_id, "job-failed", "failed")
                                    .with_detail("error", json!("timeout")),
                            )
                            .await?;
                        self.telemetry.job_failed();
                        return Ok(());
                    }
                    tokio::select! {
                        _ = waker.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(DRIVER_POLL_INTERVAL_MS)) => {}
                    }
                }
            }
            Ok(DispatchOutcome::NoAgent) => {
                self.fail_handoff(job_id, &first_id, "No agent available for the first chain step")
                    .await
            }
            Ok(DispatchOutcome::Failed { error }) | Err(error) => {
                self.fail_handoff(job_id, &first_id, &error.to_string()).await
            }
        }
    }

    async fn fail_handoff(&self, job_id: &str, task_id: &str, reason: &str) -> Result<()> {
        self.store
            .update_task(
                job_id,
                task_id,
                TaskPatch::status(TaskStatus::Failed).with_error(reason),
            )
            .await?;
        self.store
            .update_status(job_id, JobStatus::Failed, Some(reason.to_string()))
            .await?;
        self.audit
            .record(
                AuditEntry::new(job_id, "job-failed", "failed")
                    .with_detail("task_id", json!(task_id))
                    .with_detail("error", json!(reason)),
            )
            .await?;
        self.telemetry.task_failed();
        self.telemetry.job_failed();
        Ok(())
    }

    /// Reconstruct the per-step audit from the trace accumulated in the
    /// returned context and complete the job.
    async fn finalize_handoff(&self, job_id: &str, final_payload: &Value) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(ConductorError::NotFound(format!("Job {job_id}")));
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        let graph = TaskGraph::from_tasks(&job.tasks);
        let order = graph.topo_order()?;

        let trace: Vec<crate::protocol::TraceEntry> = final_payload
            .get("workflow")
            .and_then(|w| w.get("trace"))
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();

        for entry in &trace {
            if let Some(task_id) = order.get(entry.step) {
                self.audit
                    .record(
                        AuditEntry::new(job_id, "handoff-step", entry.status.as_str())
                            .with_detail("task_id", json!(task_id))
                            .with_detail("agent", json!(entry.agent))
                            .with_detail("step", json!(entry.step)),
                    )
                    .await?;
            }
        }

        // Every step in the chain is complete once the final reply lands.
        for task_id in &order {
            let output = trace
                .iter()
                .find(|e| order.get(e.step) == Some(task_id))
                .and_then(|e| e.output.clone())
                .unwrap_or(Value::Null);
            let task_done = job.tasks.get(task_id).map(|t| t.status) == Some(TaskStatus::Done);
            if !task_done {
                self.store
                    .update_task(
                        job_id,
                        task_id,
                        TaskPatch {
                            status: Some(TaskStatus::Done),
                            result: Some(output),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        let mut result = HashMap::new();
        result.insert("output".to_string(), final_payload.clone());
        self.store.set_job_result(job_id, result).await?;
        self.store.update_status(job_id, JobStatus::Done, None).await?;
        self.audit
            .record(
                AuditEntry::new(job_id, "job-done", "done")
                    .with_detail("steps_traced", json!(trace.len())),
            )
            .await?;
        self.telemetry.job_done();
        self.notify_job(job_id).await;
        info!(job_id, "Handoff chain completed");
        Ok(())
    }

    // ----- replies from the intake API -----

    /// Handle an agent reply delivered through `/messages`.
    ///
    /// Idempotent on message id: a re-POSTed envelope changes nothing.
    /// Replies that correlate to no outstanding request are recorded as
    /// orphans and acknowledged.
    pub async fn handle_reply(&self, reply: &Envelope) -> Result<()> {
        if !self.store.record_message(reply).await? {
            debug!(message_id = %reply.id, "Duplicate message ignored");
            return Ok(());
        }

        let request = self.dispatcher.correlate_reply(reply).await?;
        let job_id = request
            .as_ref()
            .and_then(|r| r.correlation.conversation_id.clone())
            .or_else(|| reply.correlation.conversation_id.clone());

        let Some(job_id) = job_id else {
            warn!(message_id = %reply.id, "Reply without correlation");
            self.audit
                .record(
                    AuditEntry::new("unknown", "orphan-reply", "ignored")
                        .with_detail("message_id", json!(reply.id)),
                )
                .await?;
            return Ok(());
        };

        self.audit
            .record(
                AuditEntry::new(&job_id, "message-inbound", "recorded")
                    .with_detail("message_id", json!(reply.id))
                    .with_detail("message_type", serde_json::to_value(reply.message_type)?)
                    .with_detail("sender", json!(reply.sender)),
            )
            .await?;

        let Some(job) = self.store.get_job(&job_id).await? else {
            self.audit
                .record(
                    AuditEntry::new(&job_id, "orphan-reply", "ignored")
                        .with_detail("message_id", json!(reply.id)),
                )
                .await?;
            return Ok(());
        };

        let task_id = request
            .as_ref()
            .and_then(|r| r.context.get("task_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        if job.status.is_terminal() {
            // Recorded above; a running task of a cancelled job is closed
            // out, the job itself stays terminal.
            if let Some(task_id) = task_id {
                let still_running =
                    job.tasks.get(&task_id).map(|t| t.status) == Some(TaskStatus::Running);
                if still_running && job.status == JobStatus::Cancelled {
                    self.store
                        .update_task(
                            &job_id,
                            &task_id,
                            TaskPatch::status(TaskStatus::Failed).with_error("cancelled"),
                        )
                        .await?;
                }
                self.audit
                    .record(
                        AuditEntry::new(&job_id, "late-reply", "ignored")
                            .with_detail("task_id", json!(task_id)),
                    )
                    .await?;
            }
            return Ok(());
        }

        match job.mode {
            PlanMode::Handoff => {
                use crate::protocol::MessageType;
                match reply.message_type {
                    MessageType::Inform | MessageType::Done => {
                        self.finalize_handoff(&job_id, &Value::Object(reply.payload.clone()))
                            .await?;
                    }
                    MessageType::Failure | MessageType::Refuse => {
                        let order = TaskGraph::from_tasks(&job.tasks).topo_order()?;
                        let first = order.first().cloned().unwrap_or_default();
                        let reason = reply
                            .status
                            .reason
                            .clone()
                            .unwrap_or_else(|| "Handoff chain failed".to_string());
                        self.fail_handoff(&job_id, &first, &reason).await?;
                    }
                    _ => {}
                }
            }
            PlanMode::Orchestrated => {
                let Some(task_id) = task_id else {
                    self.audit
                        .record(
                            AuditEntry::new(&job_id, "orphan-reply", "ignored")
                                .with_detail("message_id", json!(reply.id)),
                        )
                        .await?;
                    return Ok(());
                };
                let Some(task) = job.tasks.get(&task_id) else {
                    return Ok(());
                };
                let outcome = self.dispatcher.classify_reply(task, reply);
                self.apply_outcome(&job_id, &task_id, outcome).await?;
            }
        }

        self.notify_job(&job_id).await;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Build a job from a plan produced by the planner or the intake API.
    pub fn job_from_plan(
        intent: &str,
        graph: TaskGraph,
        mode: PlanMode,
        params: HashMap<String, Value>,
        max_retries: u32,
        deadline_secs: Option<u64>,
    ) -> Job {
        let mut job = Job::new(intent).with_max_retries(max_retries).with_params(params);
        job.mode = mode;
        job.deadline_secs = deadline_secs;
        job.tasks = graph.into_tasks();
        job
    }
}

