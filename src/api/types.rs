//! API request and response types

use crate::event::EventEnvelope;
use crate::store::SessionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request to create a session from an inline flow definition
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub flow: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreatedResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct DemoSessionResponse {
    pub session_id: String,
    pub flow_name: String,
}

/// Request to post user input into a session
#[derive(Debug, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventEnvelope>,
}

#[derive(Debug, Deserialize)]
pub struct FlowInfoQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
}

/// Flow graph in a shape convenient for visualization
#[derive(Debug, Serialize)]
pub struct FlowInfoResponse {
    pub meta: Value,
    pub start: String,
    pub states: Vec<StateInfo>,
    pub intents: Vec<String>,
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionState>,
}

#[derive(Debug, Serialize)]
pub struct StateInfo {
    pub name: String,
    pub actions: Vec<String>,
    pub edges: Vec<EdgeInfo>,
    pub terminal: bool,
}

#[derive(Debug, Serialize)]
pub struct EdgeInfo {
    pub to: String,
    pub trigger: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
}

/// Request to create or update a stored flow
#[derive(Debug, Deserialize)]
pub struct SaveFlowRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub definition: Value,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub definition: Value,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
