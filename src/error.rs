use thiserror::Error;

/// Convenience type alias for Results with ConductorError
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Main error type for Conductor Core
///
/// Every component boundary returns this enum. Transport errors are
/// converted into the taxonomy at the narrowest possible scope (the
/// dispatcher), so callers above it only ever see classified kinds.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Agent transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Roster file error: {0}")]
    Roster(#[from] serde_yml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("No agent available for capability '{capability}'")]
    AgentUnavailable { capability: String },

    #[error("Agent failure: {message}")]
    AgentFailure { message: String },

    #[error("Agent refused: {reason}")]
    AgentRefused { reason: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Illegal state transition: {message}")]
    IllegalTransition { message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task graph error: {0}")]
    Graph(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    #[error("Queue is full")]
    QueueFull,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ConductorError {
    /// Stable error-kind code surfaced in API error bodies and audit
    /// entries. These strings are part of the external contract.
    pub fn kind(&self) -> &'static str {
        match self {
            ConductorError::Validation(_) | ConductorError::Graph(_) => "validation",
            ConductorError::PolicyDenied { .. } => "policy_denied",
            ConductorError::AgentUnavailable { .. } => "agent_unavailable",
            ConductorError::AgentFailure { .. } => "agent_failure",
            ConductorError::AgentRefused { .. } => "agent_refused",
            ConductorError::Timeout { .. } => "timeout",
            ConductorError::Transport(_) => "transport",
            ConductorError::Storage { .. } | ConductorError::Serialization(_) => "storage",
            ConductorError::IllegalTransition { .. } => "conflict",
            ConductorError::Cancelled => "cancelled",
            ConductorError::RateLimit { .. } => "rate_limited",
            ConductorError::QueueFull => "queue_full",
            ConductorError::NotFound(_) => "not_found",
            ConductorError::Unauthorized => "unauthorized",
            ConductorError::Roster(_) | ConductorError::Configuration(_) => "configuration",
            ConductorError::Planning(_) => "planning",
            ConductorError::Internal(_) => "internal",
        }
    }

    /// Whether the orchestrator may retry the operation that produced this
    /// error. Refusals and policy denials are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::AgentFailure { .. }
                | ConductorError::Timeout { .. }
                | ConductorError::Transport(_)
                | ConductorError::AgentUnavailable { .. }
                | ConductorError::Storage { .. }
        )
    }
}
