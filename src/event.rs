//! Session events and the durable log envelope.
//!
//! Every observable thing a session does is one of these events. The store
//! wraps them in an [`EventEnvelope`] carrying the session id, a per-session
//! monotonic sequence number and a timestamp, appends the envelope to the
//! session's event log and publishes it to live subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One session event, discriminated by its `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session.started")]
    SessionStarted { session_id: String },

    #[serde(rename = "say")]
    Say { text: String },

    #[serde(rename = "ask")]
    Ask { text: String },

    #[serde(rename = "transfer")]
    Transfer { target: String },

    #[serde(rename = "hangup")]
    Hangup,

    #[serde(rename = "tool.call")]
    ToolCall {
        tool_call_id: String,
        name: String,
        args: Value,
    },

    #[serde(rename = "tool.result")]
    ToolResult { tool_call_id: String, result: Value },

    #[serde(rename = "tool.error")]
    ToolError { tool_call_id: String, error: String },

    #[serde(rename = "fsm.transition")]
    FsmTransition { from: String, to: String },

    #[serde(rename = "state.updated")]
    StateUpdated { ctx: Value },

    #[serde(rename = "intent.unhandled")]
    IntentUnhandled {
        intent: String,
        confidence: f64,
        #[serde(rename = "currentState")]
        current_state: String,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl SessionEvent {
    /// The wire discriminant, e.g. `tool.call`.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session.started",
            SessionEvent::Say { .. } => "say",
            SessionEvent::Ask { .. } => "ask",
            SessionEvent::Transfer { .. } => "transfer",
            SessionEvent::Hangup => "hangup",
            SessionEvent::ToolCall { .. } => "tool.call",
            SessionEvent::ToolResult { .. } => "tool.result",
            SessionEvent::ToolError { .. } => "tool.error",
            SessionEvent::FsmTransition { .. } => "fsm.transition",
            SessionEvent::StateUpdated { .. } => "state.updated",
            SessionEvent::IntentUnhandled { .. } => "intent.unhandled",
            SessionEvent::Error { .. } => "error",
        }
    }
}

/// A logged event: the event itself plus its position in the session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl EventEnvelope {
    pub fn new(session_id: impl Into<String>, seq: u64, event: SessionEvent) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            timestamp: Utc::now(),
            event,
        }
    }
}
