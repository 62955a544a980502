//! Intent planning: turning a user intent into a task graph.
//!
//! Two strategies, tried in order. Rule-based routing matches the intent
//! against registered regex patterns and binds a curated template graph;
//! when nothing matches, the planner consults an external agent
//! advertising a planning capability through the ordinary message
//! protocol, then validates the returned plan before adopting it.
//!
//! Rule templates are trusted. Plans built for unmatched intents are not:
//! they always start with an ethics-evaluation gate task, and every other
//! task depends on it, so a denied verdict fails the job before any
//! non-policy step runs.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    constants::ORCHESTRATOR_URI,
    config::PlannerConfig,
    graph::TaskGraph,
    models::{ActionType, PlanMode, Task},
    protocol::{Envelope, MessageType},
    registry::AgentRegistry,
    ConductorError, Result,
};

/// Capability tag of the ethics agent consulted for gate tasks.
pub const ETHICS_CAPABILITY: &str = "ethics_evaluation";

/// Task id given to the injected gate task.
pub const ETHICS_TASK_ID: &str = "policy-check";

/// A planned job: the graph, how it is driven, and the planner's
/// free-form reasoning for the audit trail.
#[derive(Debug)]
pub struct Plan {
    pub graph: TaskGraph,
    pub mode: PlanMode,
    pub reasoning: String,
}

/// One registered intent rule.
#[derive(Debug, Clone)]
pub struct IntentRule {
    pub name: String,
    pub patterns: Vec<String>,
    pub description: String,
}

/// Rule-based intent classification: first registered match wins.
#[derive(Default)]
pub struct IntentRouter {
    rules: Vec<(IntentRule, Vec<Regex>)>,
}

impl IntentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: IntentRule) -> Result<()> {
        let mut compiled = Vec::with_capacity(rule.patterns.len());
        for pattern in &rule.patterns {
            let regex = regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    ConductorError::Configuration(format!(
                        "Invalid pattern for intent {}: {e}",
                        rule.name
                    ))
                })?;
            compiled.push(regex);
        }
        self.rules.push((rule, compiled));
        Ok(())
    }

    /// Route a label or free-form description to an intent name, or
    /// "unknown" when nothing matches.
    pub fn route(&self, message: &str) -> &str {
        if message.trim().is_empty() {
            return "unknown";
        }
        for (rule, patterns) in &self.rules {
            if patterns.iter().any(|regex| regex.is_match(message)) {
                return &rule.name;
            }
        }
        "unknown"
    }
}

pub struct Planner {
    router: IntentRouter,
    registry: Arc<AgentRegistry>,
    http: reqwest::Client,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(registry: Arc<AgentRegistry>, config: PlannerConfig) -> Result<Self> {
        let mut router = IntentRouter::new();
        router.register(IntentRule {
            name: "calculate".to_string(),
            patterns: vec![
                r"^calculate$".to_string(),
                r"\bcalculat(e|ion)\b".to_string(),
                r"\b\d+\s*[-+*/]\s*\d+\b".to_string(),
            ],
            description: "Arithmetic with locale-aware formatting".to_string(),
        })?;
        router.register(IntentRule {
            name: "send_mail".to_string(),
            patterns: vec![
                r"^send_mail$".to_string(),
                r"\bsend\b.*\b(mail|email)\b".to_string(),
                r"\be-?mail\b.*\bto\b".to_string(),
            ],
            description: "Deliver a message to a mail recipient".to_string(),
        })?;

        Ok(Self {
            router,
            registry,
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Decompose an intent (plus optional free-form description) into a
    /// plan.
    pub async fn plan(
        &self,
        intent: &str,
        description: Option<&str>,
        params: &HashMap<String, Value>,
    ) -> Result<Plan> {
        let routed = {
            let by_label = self.router.route(intent);
            if by_label != "unknown" {
                by_label.to_string()
            } else {
                self.router.route(description.unwrap_or("")).to_string()
            }
        };

        debug!(intent, routed = %routed, "Planning job");

        match routed.as_str() {
            "calculate" => self.calculator_template(params),
            "send_mail" => self.mail_template(params),
            _ => self.plan_unmatched(intent, description, params).await,
        }
    }

    /// Curated single-step template: deliver a message to a recipient.
    fn mail_template(&self, params: &HashMap<String, Value>) -> Result<Plan> {
        let recipient = params
            .get("to")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConductorError::Validation(
                    "Intent 'send_mail' requires parameter 'to'".to_string(),
                )
            })?;

        let mut graph = TaskGraph::new();
        let mut task = Task::new("mail", ActionType::SendMail, recipient);
        task.text = params.get("body").and_then(Value::as_str).map(str::to_string);
        if let Some(subject) = params.get("subject") {
            task.payload.insert("subject".to_string(), subject.clone());
        }
        graph.add(task)?;

        Ok(Plan {
            graph,
            mode: PlanMode::Orchestrated,
            reasoning: "Rule 'send_mail': single delivery step".to_string(),
        })
    }

    /// Curated two-step template: calculate, then format the result.
    fn calculator_template(&self, params: &HashMap<String, Value>) -> Result<Plan> {
        for key in ["num1", "num2", "op"] {
            if !params.contains_key(key) {
                return Err(ConductorError::Validation(format!(
                    "Intent 'calculate' requires parameter '{key}'"
                )));
            }
        }

        let mut graph = TaskGraph::new();
        graph.add(
            Task::new("calc", ActionType::CallAgent, "calculate")
                .with_payload("num1", params["num1"].clone())
                .with_payload("num2", params["num2"].clone())
                .with_payload("operator", params["op"].clone()),
        )?;
        graph.add(
            Task::new("format", ActionType::CallAgent, "format")
                .with_depends_on(vec!["calc".to_string()])
                .with_payload(
                    "locale",
                    params.get("locale").cloned().unwrap_or_else(|| json!("en-US")),
                )
                .with_payload(
                    "decimals",
                    params.get("decimals").cloned().unwrap_or_else(|| json!(2)),
                ),
        )?;

        Ok(Plan {
            graph,
            mode: PlanMode::Orchestrated,
            reasoning: "Rule 'calculate': two-step calculation and locale formatting".to_string(),
        })
    }

    /// No rule matched: gate with an ethics check and, when a planning
    /// agent is registered, let it decompose the request. Without one the
    /// intent is dispatched as a single gated agent call.
    async fn plan_unmatched(
        &self,
        intent: &str,
        description: Option<&str>,
        params: &HashMap<String, Value>,
    ) -> Result<Plan> {
        let mut plan = match self
            .registry
            .lookup_by_capability(&self.config.planning_capability)
            .await
        {
            Some(agent) => self.llm_plan(&agent.endpoint, intent, description, params).await?,
            None => {
                info!(intent, "No planning agent registered; using direct dispatch");
                let mut graph = TaskGraph::new();
                let mut task = Task::new("step-1", ActionType::CallAgent, intent);
                for (key, value) in params {
                    task.payload.insert(key.clone(), value.clone());
                }
                graph.add(task)?;
                Plan {
                    graph,
                    mode: PlanMode::Orchestrated,
                    reasoning: format!("Unmatched intent '{intent}' dispatched as a single agent call"),
                }
            }
        };

        plan.graph = Self::insert_ethics_gate(plan.graph, intent, params)?;
        Ok(plan)
    }

    /// Prefix the graph with an ethics-evaluation task every other root
    /// depends on.
    fn insert_ethics_gate(
        graph: TaskGraph,
        intent: &str,
        params: &HashMap<String, Value>,
    ) -> Result<TaskGraph> {
        let mut gated = TaskGraph::new();
        gated.add(
            Task::new(ETHICS_TASK_ID, ActionType::CallAgent, ETHICS_CAPABILITY)
                .with_payload("intent", json!(intent))
                .with_payload("params", serde_json::to_value(params)?),
        )?;

        for task_id in graph.topo_order()? {
            let mut task = graph.get(&task_id).cloned().expect("topo order yields known ids");
            if task.depends_on.is_empty() {
                task.depends_on = vec![ETHICS_TASK_ID.to_string()];
            }
            gated.add(task)?;
        }
        Ok(gated)
    }

    /// Ask the planning agent for a decomposition and validate it.
    async fn llm_plan(
        &self,
        endpoint: &str,
        intent: &str,
        description: Option<&str>,
        params: &HashMap<String, Value>,
    ) -> Result<Plan> {
        let agents: Vec<Value> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .map(|a| json!({"id": a.id, "capabilities": a.capabilities}))
            .collect();

        let request = Envelope::new(MessageType::Request, ORCHESTRATOR_URI, "plan")
            .with_payload_entry("task", json!(description.unwrap_or(intent)))
            .with_payload_entry("intent", json!(intent))
            .with_payload_entry("params", serde_json::to_value(params)?)
            .with_payload_entry("agents", Value::Array(agents))
            .with_payload_entry("schema", Self::plan_schema());

        let response = self
            .http
            .post(format!("{}{}", endpoint.trim_end_matches('/'), crate::constants::AGENT_TASKS_PATH))
            .timeout(Duration::from_secs(self.config.planning_timeout_secs))
            .json(&request)
            .send()
            .await?;
        let reply = Envelope::from_value(response.json::<Value>().await?)?;

        if reply.message_type != MessageType::Inform {
            return Err(ConductorError::Planning(format!(
                "Planning agent replied with {:?}",
                reply.message_type
            )));
        }

        let steps = reply
            .payload
            .get("plan")
            .and_then(|p| p.get("steps"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConductorError::Planning("Planning reply carries no plan.steps".to_string())
            })?;

        let mode = match reply
            .payload
            .get("plan")
            .and_then(|p| p.get("mode"))
            .and_then(Value::as_str)
        {
            Some("handoff") => PlanMode::Handoff,
            _ => PlanMode::Orchestrated,
        };

        let mut graph = TaskGraph::new();
        for (index, step) in steps.iter().enumerate() {
            let capability = step
                .get("agent")
                .and_then(Value::as_str)
                .ok_or_else(|| ConductorError::Planning(format!("Step {index} names no agent")))?;
            let step_intent = step
                .get("intent")
                .and_then(Value::as_str)
                .ok_or_else(|| ConductorError::Planning(format!("Step {index} names no intent")))?;

            // Every step must resolve against the live registry before the
            // plan is adopted.
            if self.registry.lookup_by_capability(capability).await.is_none()
                && self.registry.lookup_by_id(capability).await.is_none()
            {
                return Err(ConductorError::Planning(format!(
                    "Step {index} targets unknown agent or capability '{capability}'"
                )));
            }

            let id = step
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("step-{}", index + 1));
            let depends_on: Vec<String> = step
                .get("depends_on")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|d| d.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let payload: Map<String, Value> = step
                .get("payload")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let mut task = Task::new(id, ActionType::CallAgent, capability)
                .with_depends_on(depends_on);
            task.payload = payload.into_iter().collect();
            task.text = Some(step_intent.to_string());
            graph.add(task).map_err(|e| {
                ConductorError::Planning(format!("Planning reply graph is invalid: {e}"))
            })?;
        }

        if graph.is_empty() {
            return Err(ConductorError::Planning("Planning reply has zero steps".to_string()));
        }
        graph.validate().map_err(|e| {
            ConductorError::Planning(format!("Planning reply graph is cyclic: {e}"))
        })?;

        let reasoning = reply
            .payload
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("Plan produced by planning agent")
            .to_string();

        info!(intent, steps = graph.len(), "Adopted plan from planning agent");
        Ok(Plan {
            graph,
            mode,
            reasoning,
        })
    }

    fn plan_schema() -> Value {
        json!({
            "type": "object",
            "required": ["steps"],
            "properties": {
                "mode": {"enum": ["orchestrated", "handoff"]},
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["agent", "intent"],
                        "properties": {
                            "id": {"type": "string"},
                            "agent": {"type": "string"},
                            "intent": {"type": "string"},
                            "payload": {"type": "object"},
                            "depends_on": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                }
            }
        })
    }
}
