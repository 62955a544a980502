//! Gatekeeping rules applied before dispatch.
//!
//! The engine is pure in the sense of making no network calls: blocked
//! actions, the allowed-application list and keyed rate limits are all
//! evaluated in memory. Ethics verdicts are delegated to an ethics agent
//! by the planner embedding an evaluation step in the graph; this module
//! never talks to one.

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::warn;

use crate::models::{ActionType, Task};

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Action or capability tags rejected outright.
    pub blocked_actions: Vec<String>,
    /// Applications `open_app` may target.
    pub allowed_apps: Vec<String>,
    /// Per (sender, capability) dispatch quota.
    pub requests_per_minute: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            blocked_actions: vec![
                "delete_file".to_string(),
                "format_disk".to_string(),
                "run_shell".to_string(),
                "exfiltrate".to_string(),
            ],
            allowed_apps: vec![
                "chrome".to_string(),
                "notepad".to_string(),
                "excel".to_string(),
                "outlook".to_string(),
            ],
            requests_per_minute: 60,
        }
    }
}

pub struct PolicyEngine {
    config: PolicyConfig,
    limiter: RateLimiter<String, DashMapStateStore<String>, DefaultClock>,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute.max(1)).expect("non-zero");
        let limiter = RateLimiter::keyed(Quota::per_minute(per_minute));
        Self { config, limiter }
    }

    /// Validate one task on behalf of `sender` before dispatch.
    pub fn validate(&self, task: &Task, sender: &str) -> Decision {
        let capability = task.capability();

        if self.is_blocked(capability) || self.is_blocked(&task.target) {
            warn!(
                task_id = %task.id,
                capability,
                "Policy violation: blocked action"
            );
            return Decision::deny(format!("Action '{capability}' is blocked by policy"));
        }

        if task.action == ActionType::OpenApp && !self.is_app_allowed(&task.target) {
            warn!(
                task_id = %task.id,
                app = %task.target,
                "Policy violation: application not allowed"
            );
            return Decision::deny(format!(
                "Application '{}' is not on the allowed list",
                task.target
            ));
        }

        let key = format!("{sender}:{capability}");
        if self.limiter.check_key(&key).is_err() {
            warn!(task_id = %task.id, key = %key, "Rate limit exceeded");
            return Decision::deny(format!(
                "Rate limit exceeded for {sender} on '{capability}'"
            ));
        }

        Decision::Allow
    }

    fn is_blocked(&self, value: &str) -> bool {
        self.config
            .blocked_actions
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(value))
    }

    fn is_app_allowed(&self, app: &str) -> bool {
        self.config
            .allowed_apps
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(app))
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;

    const SENDER: &str = "agent://conductor/orchestrator";

    #[test]
    fn blocked_action_is_denied() {
        let engine = PolicyEngine::default();
        let task = Task::new("t1", ActionType::CallAgent, "run_shell");
        let decision = engine.validate(&task, SENDER);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn blocked_target_is_denied() {
        let engine = PolicyEngine::default();
        let task = Task::new("t1", ActionType::GenericTool, "format_disk");
        assert!(!engine.validate(&task, SENDER).is_allowed());
    }

    #[test]
    fn unknown_application_is_denied() {
        let engine = PolicyEngine::default();
        let task = Task::new("t1", ActionType::OpenApp, "regedit");
        let decision = engine.validate(&task, SENDER);
        assert_eq!(
            decision,
            Decision::deny("Application 'regedit' is not on the allowed list")
        );
    }

    #[test]
    fn allowed_application_passes() {
        let engine = PolicyEngine::default();
        let task = Task::new("t1", ActionType::OpenApp, "Notepad");
        assert!(engine.validate(&task, SENDER).is_allowed());
    }

    #[test]
    fn ordinary_agent_call_passes() {
        let engine = PolicyEngine::default();
        let task = Task::new("t1", ActionType::CallAgent, "calculate");
        assert!(engine.validate(&task, SENDER).is_allowed());
    }

    #[test]
    fn rate_limit_applies_per_sender_and_capability() {
        let engine = PolicyEngine::new(PolicyConfig {
            requests_per_minute: 2,
            ..Default::default()
        });

        let task = Task::new("t1", ActionType::CallAgent, "calculate");
        assert!(engine.validate(&task, "agent://u/one").is_allowed());
        assert!(engine.validate(&task, "agent://u/one").is_allowed());
        assert!(!engine.validate(&task, "agent://u/one").is_allowed());

        // A different sender has its own budget, as does a different
        // capability for the same sender.
        assert!(engine.validate(&task, "agent://u/two").is_allowed());
        let other = Task::new("t2", ActionType::CallAgent, "format");
        assert!(engine.validate(&other, "agent://u/one").is_allowed());
    }
}
