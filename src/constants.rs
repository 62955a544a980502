//! System-wide constants for queue bounds, polling cadence and retry
//! behaviour. Values that operators commonly tune live in `config`
//! instead; these are fixed engineering limits.

/// URI the orchestrator uses as the sender of every outbound envelope.
pub const ORCHESTRATOR_URI: &str = "agent://conductor/orchestrator";

/// Interval the orchestrator sleeps when the job queue is empty.
pub const QUEUE_POLL_INTERVAL_MS: u64 = 100;

/// Interval a job driver waits between readiness scans when no reply
/// notification arrives.
pub const DRIVER_POLL_INTERVAL_MS: u64 = 250;

/// Upper bound on queued job ids. Submissions beyond this are rejected.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Base delay for task retry back-off; doubled per attempt.
pub const RETRY_BACKOFF_BASE_MS: u64 = 500;

/// Ceiling for a single back-off delay regardless of attempt count.
pub const RETRY_BACKOFF_CAP_MS: u64 = 30_000;

/// Jitter applied to each back-off delay, as a fraction of the delay.
pub const RETRY_JITTER_FRACTION: f64 = 0.2;

/// Delay before a job is requeued after no agent matched a ready task.
pub const NO_AGENT_REQUEUE_DELAY_MS: u64 = 2_000;

/// Default per-task dispatch attempts when the plan does not override it.
pub const DEFAULT_TASK_MAX_ATTEMPTS: u32 = 3;

/// Consecutive no-agent requeues before a task fails with
/// `agent_unavailable`.
pub const DEFAULT_NO_AGENT_ATTEMPTS: u32 = 3;

/// Default HTTP timeout for agent calls when the task carries none.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;

/// Path suffix agents expose for task requests.
pub const AGENT_TASKS_PATH: &str = "/tasks";
