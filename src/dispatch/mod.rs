//! Dispatcher: sends one ready task to the agent best able to execute it
//! and classifies the outcome.
//!
//! For each task the dispatcher consults the registry, gates through the
//! policy engine, builds a `request` envelope correlated to the job,
//! persists the outgoing message, POSTs to the agent with the task's
//! timeout and interprets the reply. Replies may also arrive
//! asynchronously through the intake API; both paths produce the same
//! classification.

use rand::Rng;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    audit::AuditLog,
    constants::{
        AGENT_TASKS_PATH, ORCHESTRATOR_URI, RETRY_BACKOFF_BASE_MS, RETRY_BACKOFF_CAP_MS,
        RETRY_JITTER_FRACTION,
    },
    models::{AgentAvailability, AuditEntry, Job, Task},
    planner::ETHICS_CAPABILITY,
    policy::{Decision, PolicyEngine},
    protocol::{Envelope, MessageType, WorkflowContext},
    registry::AgentRegistry,
    store::JobStore,
    ConductorError, Result,
};

/// Classified result of one dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The agent replied synchronously with a result payload.
    Completed { result: Value },
    /// The agent accepted the request; the reply will arrive through the
    /// intake API.
    AwaitingReply,
    /// The attempt failed; the orchestrator decides retry vs. fail from
    /// the error kind.
    Failed { error: ConductorError },
    /// No registered agent matched the task's capability.
    NoAgent,
}

/// Exponential back-off with jitter for the given attempt number
/// (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = RETRY_BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    let capped = base.min(RETRY_BACKOFF_CAP_MS) as f64;
    let jitter = capped * RETRY_JITTER_FRACTION;
    let delay = rand::thread_rng().gen_range((capped - jitter)..=(capped + jitter));
    Duration::from_millis(delay.max(0.0) as u64)
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    audit: AuditLog,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyEngine>,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            audit,
            http: reqwest::Client::new(),
        }
    }

    /// Dispatch one task. `workflow` is embedded into the request payload
    /// when the job runs in handoff mode.
    pub async fn dispatch_task(
        &self,
        job: &Job,
        task: &Task,
        workflow: Option<&WorkflowContext>,
    ) -> Result<DispatchOutcome> {
        debug!(job_id = %job.id, task_id = %task.id, action = %task.action, "Dispatching task");

        if let Decision::Deny { reason } = self.policy.validate(task, ORCHESTRATOR_URI) {
            self.audit
                .record(
                    AuditEntry::new(&job.id, "policy-denied", "denied")
                        .with_detail("task_id", json!(task.id))
                        .with_detail("reason", json!(reason)),
                )
                .await?;
            return Ok(DispatchOutcome::Failed {
                error: ConductorError::PolicyDenied { reason },
            });
        }

        let capability = task.capability().to_string();
        let Some(agent) = self.registry.lookup_by_capability(&capability).await else {
            warn!(job_id = %job.id, task_id = %task.id, capability, "No agent available");
            self.audit
                .record(
                    AuditEntry::new(&job.id, "dispatch", "no-agent")
                        .with_detail("task_id", json!(task.id))
                        .with_detail("capability", json!(capability)),
                )
                .await?;
            return Ok(DispatchOutcome::NoAgent);
        };

        let request = self.build_request(job, task, workflow)?;
        self.audit.record_exchange(&job.id, &request, "outbound").await?;
        self.audit
            .record(
                AuditEntry::new(&job.id, "dispatch", "sent")
                    .with_detail("task_id", json!(task.id))
                    .with_detail("agent", json!(agent.id))
                    .with_detail("message_id", json!(request.id))
                    .with_detail("attempt", json!(task.attempt_count + 1)),
            )
            .await?;

        let url = format!("{}{}", agent.endpoint.trim_end_matches('/'), AGENT_TASKS_PATH);
        let response = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(task.timeout_secs.max(1)))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                // Synthesized failure; follows the ordinary failure path.
                let _ = self.registry.update_status(&agent.id, AgentAvailability::Busy).await;
                return Ok(DispatchOutcome::Failed {
                    error: ConductorError::Timeout {
                        message: format!(
                            "Agent {} did not answer within {}s",
                            agent.id, task.timeout_secs
                        ),
                    },
                });
            }
            Err(e) => {
                let _ = self.registry.update_status(&agent.id, AgentAvailability::Offline).await;
                return Ok(DispatchOutcome::Failed { error: e.into() });
            }
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(DispatchOutcome::Failed { error: e.into() });
            }
        };

        // The agent answered something; it is alive.
        let _ = self
            .registry
            .update_status(&agent.id, AgentAvailability::Available)
            .await;

        let reply = match Envelope::from_value(body) {
            Ok(reply) => reply,
            // A bare ack (no envelope) means the real reply comes later
            // through the intake API.
            Err(_) => return Ok(DispatchOutcome::AwaitingReply),
        };

        self.audit.record_exchange(&job.id, &reply, "inbound").await?;
        Ok(self.classify_reply(task, &reply))
    }

    /// Interpret a reply envelope for a task. Used both for synchronous
    /// HTTP replies and for replies delivered through the intake API.
    pub fn classify_reply(&self, task: &Task, reply: &Envelope) -> DispatchOutcome {
        match reply.message_type {
            MessageType::Inform | MessageType::Done => {
                // Ethics gate verdicts ride on inform; a non-allowed
                // verdict aborts with a policy failure instead of a result.
                if task.capability() == ETHICS_CAPABILITY {
                    let allowed = reply
                        .payload
                        .get("allowed")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !allowed {
                        let violations = reply
                            .payload
                            .get("violations")
                            .cloned()
                            .unwrap_or_else(|| json!([]));
                        return DispatchOutcome::Failed {
                            error: ConductorError::PolicyDenied {
                                reason: format!("Ethics verdict: not allowed ({violations})"),
                            },
                        };
                    }
                }
                DispatchOutcome::Completed {
                    result: Value::Object(reply.payload.clone()),
                }
            }
            MessageType::Failure => {
                let reason = reply
                    .status
                    .reason
                    .clone()
                    .or_else(|| {
                        reply
                            .payload
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "Agent reported failure".to_string());
                DispatchOutcome::Failed {
                    error: ConductorError::AgentFailure { message: reason },
                }
            }
            MessageType::Refuse => {
                let reason = reply
                    .status
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Agent refused the request".to_string());
                DispatchOutcome::Failed {
                    error: ConductorError::AgentRefused { reason },
                }
            }
            // Anything else (confirm, propose, ...) acknowledges receipt;
            // the terminating reply is still outstanding.
            _ => DispatchOutcome::AwaitingReply,
        }
    }

    fn build_request(
        &self,
        job: &Job,
        task: &Task,
        workflow: Option<&WorkflowContext>,
    ) -> Result<Envelope> {
        let mut payload: Map<String, Value> = Map::new();
        payload.insert("target".into(), json!(task.target));
        if let Some(text) = &task.text {
            payload.insert("text".into(), json!(text));
        }
        for (key, value) in &task.payload {
            payload.insert(key.clone(), value.clone());
        }
        // Dependents see the results of the tasks they waited on.
        if !task.depends_on.is_empty() {
            let mut inputs = Map::new();
            for dep in &task.depends_on {
                if let Some(result) = job.tasks.get(dep).and_then(|t| t.result.clone()) {
                    inputs.insert(dep.clone(), result);
                }
            }
            payload.insert("inputs".into(), Value::Object(inputs));
        }
        payload.insert(
            "constraints".into(),
            json!({"timeout_secs": task.timeout_secs}),
        );

        let mut request = Envelope::new(MessageType::Request, ORCHESTRATOR_URI, task.capability())
            .with_payload(payload)
            .with_conversation(job.id.clone())
            .with_context_entry("task_id", json!(task.id))
            .with_context_entry("job_intent", json!(job.intent));
        if let Some(workflow) = workflow {
            request.set_workflow_context(workflow)?;
        }
        Ok(request)
    }

    /// Outstanding request the given reply answers, resolved from the
    /// message log by `correlation.in_reply_to`.
    pub async fn correlate_reply(&self, reply: &Envelope) -> Result<Option<Envelope>> {
        let Some(request_id) = &reply.correlation.in_reply_to else {
            return Ok(None);
        };
        self.store.get_message(request_id).await
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
