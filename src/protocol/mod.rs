//! Inter-agent message protocol.
//!
//! Every exchange between the orchestrator and an external agent is a JSON
//! envelope of one of twelve types. Envelopes are type-polymorphic at the
//! outer layer; inner payloads stay intent-typed and are read through
//! schema-keyed deserialization at the call site. Unknown fields are
//! tolerated on receive and preserved on forward.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{ConductorError, Result};

/// The twelve envelope types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Inform,
    Propose,
    Agree,
    Refuse,
    Confirm,
    Failure,
    Done,
    Route,
    Discover,
    Offer,
    Assign,
}

impl MessageType {
    /// Whether this type terminates an outstanding request exchange.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageType::Inform | MessageType::Failure | MessageType::Refuse | MessageType::Done
        )
    }
}

/// Conversation tracking carried on every envelope.
///
/// `conversation_id` groups an exchange (the orchestrator uses the job id);
/// `in_reply_to` names the request a reply answers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Correlation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Progress/status block (`failure` envelopes carry the reason here).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StatusInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Agent URI, e.g. `agent://conductor/orchestrator`.
    pub sender: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "correlation_is_empty")]
    pub correlation: Correlation,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub expected: Map<String, Value>,
    #[serde(default, skip_serializing_if = "status_is_empty")]
    pub status: StatusInfo,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub security: Map<String, Value>,
    /// Fields this implementation does not know about, preserved verbatim
    /// so relaying never drops information.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn correlation_is_empty(c: &Correlation) -> bool {
    c.conversation_id.is_none() && c.in_reply_to.is_none() && c.extra.is_empty()
}

fn status_is_empty(s: &StatusInfo) -> bool {
    s.code.is_none() && s.reason.is_none() && s.extra.is_empty()
}

impl Envelope {
    /// Build a new envelope with a fresh id and current timestamp.
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        intent: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now(),
            message_type,
            sender: sender.into(),
            to: Vec::new(),
            intent: intent.into(),
            payload: Map::new(),
            context: Map::new(),
            correlation: Correlation::default(),
            expected: Map::new(),
            status: StatusInfo::default(),
            security: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn with_recipient(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    pub fn with_payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.correlation.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Construct a reply of the given type, carrying the conversation over
    /// and pointing `in_reply_to` at this envelope.
    pub fn reply(&self, message_type: MessageType, sender: impl Into<String>) -> Envelope {
        let mut reply = Envelope::new(message_type, sender, self.intent.clone());
        reply.to = vec![self.sender.clone()];
        reply.correlation.conversation_id = self.correlation.conversation_id.clone();
        reply.correlation.in_reply_to = Some(self.id.clone());
        reply
    }

    /// Parse an envelope at the boundary.
    ///
    /// A message missing any required field (id, ts, type, sender, intent)
    /// is rejected here and never partially processed.
    pub fn from_json(raw: &str) -> Result<Envelope> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| ConductorError::Validation(format!("Malformed envelope: {e}")))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn from_value(value: Value) -> Result<Envelope> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ConductorError::Validation(format!("Malformed envelope: {e}")))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConductorError::Validation("Envelope id is empty".into()));
        }
        if self.sender.trim().is_empty() {
            return Err(ConductorError::Validation("Envelope sender is empty".into()));
        }
        if self.intent.trim().is_empty() {
            return Err(ConductorError::Validation("Envelope intent is empty".into()));
        }
        Ok(())
    }

    /// The workflow context embedded in the payload, if any.
    pub fn workflow_context(&self) -> Option<WorkflowContext> {
        self.payload
            .get(WORKFLOW_CONTEXT_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_workflow_context(&mut self, context: &WorkflowContext) -> Result<()> {
        self.payload
            .insert(WORKFLOW_CONTEXT_KEY.to_string(), serde_json::to_value(context)?);
        Ok(())
    }
}

/// Payload key under which a workflow context travels.
pub const WORKFLOW_CONTEXT_KEY: &str = "workflow";

/// An embedded multi-agent plan carried in a request payload.
///
/// The receiving agent executes its step, appends a trace entry, and
/// forwards the extended context to the next step's agent directly instead
/// of returning to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowContext {
    pub steps: Vec<WorkflowStep>,
    pub current_step: usize,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Capability tag or agent URI expected to execute this step.
    pub agent: String,
    pub intent: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub step: usize,
    pub agent: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl WorkflowContext {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self {
            steps,
            current_step: 0,
            trace: Vec::new(),
        }
    }
}
