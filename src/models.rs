use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

use crate::constants::{DEFAULT_TASK_MAX_ATTEMPTS, DEFAULT_TASK_TIMEOUT_SECS};

/// The unit of work requested by a user.
///
/// A job owns its task map. Task readiness is derived from the map on every
/// scan rather than stored, so the job document is the single source of
/// truth for the driver loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub intent: String,
    pub status: JobStatus,
    /// Task map keyed by task id. Dependencies reference keys of this map.
    pub tasks: HashMap<String, Task>,
    /// How the plan is driven: step-by-step by the orchestrator, or handed
    /// off to the first agent in the chain.
    #[serde(default)]
    pub mode: PlanMode,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    /// Aggregated result payload, filled when the job reaches `done`.
    #[serde(default)]
    pub result: HashMap<String, Value>,
    /// Submit-time parameters the planner binds into task payloads.
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// Optional wall-clock bound in seconds; the driver forces
    /// `failed(timeout)` when exceeded.
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Legal transitions of the job status machine. Retry is the only edge
    /// out of a terminal state and only from `failed`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// Whether the orchestrator drives every step itself or delegates the
/// chain to the first agent (workflow handoff).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    #[default]
    Orchestrated,
    Handoff,
}

/// One node in a job's task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub action: ActionType,
    /// Selector identifying the target of the action (an element, an
    /// application name, a capability tag for `call-agent`).
    pub target: String,
    pub text: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Consecutive dispatch rounds in which no agent matched.
    #[serde(default)]
    pub no_agent_count: u32,
    /// When the current attempt was sent to an agent; the reply-wait
    /// deadline is measured from here.
    #[serde(default)]
    pub dispatched_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, action: ActionType, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            target: target.into(),
            text: None,
            payload: HashMap::new(),
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            max_attempts: DEFAULT_TASK_MAX_ATTEMPTS,
            no_agent_count: 0,
            dispatched_at: None,
        }
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Capability tag an agent must advertise to execute this task.
    pub fn capability(&self) -> &str {
        match self.action {
            // call-agent tasks name the capability in the target selector
            ActionType::CallAgent => &self.target,
            _ => self.action.capability_tag(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped)
    }
}

/// Kinds of actions a task may carry.
///
/// The set is closed: routing maps each kind to a capability tag rather
/// than to an executor class hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    OpenApp,
    Click,
    Type,
    WaitFor,
    WebScript,
    UiAutomation,
    SendMail,
    CallAgent,
    GenericTool,
}

impl ActionType {
    /// Capability tag used for registry lookup when the task does not name
    /// one explicitly.
    pub fn capability_tag(&self) -> &'static str {
        match self {
            ActionType::OpenApp => "open_app",
            ActionType::Click => "click",
            ActionType::Type => "type",
            ActionType::WaitFor => "wait_for",
            ActionType::WebScript => "web_script",
            ActionType::UiAutomation => "ui_automation",
            ActionType::SendMail => "send_mail",
            ActionType::CallAgent => "call_agent",
            ActionType::GenericTool => "generic_tool",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.capability_tag())
    }
}

/// Availability reported by or inferred for an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentAvailability {
    Available,
    Busy,
    Offline,
}

/// One record per known agent: identity, transport endpoint and the
/// capability tags it advertises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// URI form `agent://owner/name`; globally unique.
    pub id: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub status: AgentAvailability,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            capabilities,
            status: AgentAvailability::Available,
            metadata: HashMap::new(),
            last_seen: chrono::Utc::now(),
        }
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }
}

/// Immutable record of one state-affecting event in a job's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub action: String,
    pub status: String,
    #[serde(default)]
    pub details: HashMap<String, Value>,
    /// Content hash reference into the evidence directory.
    pub evidence: Option<String>,
}

impl AuditEntry {
    pub fn new(job_id: impl Into<String>, action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            timestamp: chrono::Utc::now(),
            action: action.into(),
            status: status.into(),
            details: HashMap::new(),
            evidence: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn with_evidence(mut self, reference: impl Into<String>) -> Self {
        self.evidence = Some(reference.into());
        self
    }
}

impl Job {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            intent: intent.into(),
            status: JobStatus::Pending,
            tasks: HashMap::new(),
            mode: PlanMode::Orchestrated,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            error: None,
            result: HashMap::new(),
            params: HashMap::new(),
            deadline_secs: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_params(mut self, params: HashMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// True when every task has reached `done`.
    pub fn all_tasks_done(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Done)
    }

    /// First task that exhausted its retries, if any.
    pub fn first_failed_task(&self) -> Option<&Task> {
        self.tasks.values().find(|t| t.status == TaskStatus::Failed)
    }
}
