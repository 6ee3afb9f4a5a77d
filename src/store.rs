//! Durable session state: record, lock, event log, pub/sub.
//!
//! One session owns five keys in the key-value service:
//!
//! - `state:S` — serialized [`SessionState`]
//! - `flow:S` — serialized flow definition, immutable for the session
//! - `seq:S` — monotonic event counter
//! - `stream:S` — append-only event log, one entry per sequence number
//! - `lock:S` — per-session lock with a 10 second lease
//!
//! Every emission increments `seq:S`, appends to `stream:S`, and publishes
//! the same JSON on `pub:S`, so late readers can range-read the log while
//! live subscribers see updates immediately.

pub mod kv;
pub mod memory;
pub mod redis;

use crate::classify::Intent;
use crate::event::{EventEnvelope, SessionEvent};
use crate::flow::FlowConfig;
use crate::paths::deep_merge;
use chrono::{DateTime, Utc};
use kv::KvBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const LOCK_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("session is locked: {0}")]
    LockBusy(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Mutable per-session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "currentState")]
    pub current_state: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default, rename = "lastIntent", skip_serializing_if = "Option::is_none")]
    pub last_intent: Option<Intent>,
    #[serde(
        default,
        rename = "lastToolCall",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_tool_call: Option<ToolCallRecord>,
    #[serde(
        default,
        rename = "lastToolResult",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_tool_result: Option<ToolResultRecord>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_state: start.into(),
            context: Value::Object(serde_json::Map::new()),
            last_intent: None,
            last_tool_call: None,
            last_tool_result: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

/// A held per-session lock. Release is explicit; a crashed holder is
/// covered by the lease expiry.
#[must_use = "an unreleased lock blocks the session until the lease expires"]
pub struct SessionLock {
    key: String,
    nonce: String,
    kv: Arc<dyn KvBackend>,
}

impl SessionLock {
    pub async fn release(self) -> Result<(), StoreError> {
        let released = self.kv.del_if_eq(&self.key, &self.nonce).await?;
        if !released {
            tracing::warn!(key = %self.key, "lock lease expired before release");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvBackend>,
}

fn state_key(id: &str) -> String {
    format!("state:{id}")
}
fn flow_key(id: &str) -> String {
    format!("flow:{id}")
}
fn seq_key(id: &str) -> String {
    format!("seq:{id}")
}
fn stream_key(id: &str) -> String {
    format!("stream:{id}")
}
fn lock_key(id: &str) -> String {
    format!("lock:{id}")
}
fn pub_topic(id: &str) -> String {
    format!("pub:{id}")
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(memory::MemoryKv::new()))
    }

    // ==================== Session lifecycle ====================

    /// Create the session record and bind its flow. Fails when the id is
    /// already taken.
    pub async fn create_session(
        &self,
        session_id: &str,
        flow: &FlowConfig,
    ) -> Result<SessionState, StoreError> {
        if self.kv.get(&state_key(session_id)).await?.is_some() {
            return Err(StoreError::SessionExists(session_id.to_string()));
        }
        let state = SessionState::new(session_id, flow.start.clone());
        self.kv
            .set(&state_key(session_id), &serde_json::to_string(&state)?)
            .await?;
        self.kv
            .set(&flow_key(session_id), &serde_json::to_string(flow)?)
            .await?;
        Ok(state)
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.kv.get(&state_key(session_id)).await?.is_some())
    }

    pub async fn get_state(&self, session_id: &str) -> Result<SessionState, StoreError> {
        let raw = self
            .kv
            .get(&state_key(session_id))
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn get_flow(&self, session_id: &str) -> Result<FlowConfig, StoreError> {
        let raw = self
            .kv
            .get(&flow_key(session_id))
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn load(&self, session_id: &str) -> Result<(SessionState, FlowConfig), StoreError> {
        Ok((
            self.get_state(session_id).await?,
            self.get_flow(session_id).await?,
        ))
    }

    pub async fn save_state(&self, state: &SessionState) -> Result<(), StoreError> {
        self.kv
            .set(&state_key(&state.session_id), &serde_json::to_string(state)?)
            .await
    }

    /// Drop every key the session owns.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        for key in [
            state_key(session_id),
            flow_key(session_id),
            seq_key(session_id),
            stream_key(session_id),
            lock_key(session_id),
        ] {
            self.kv.del(&key).await?;
        }
        Ok(())
    }

    // ==================== Lock ====================

    /// Acquire the session lock, failing fast when it is held. Lock scopes
    /// must not be nested on the same session.
    pub async fn lock(&self, session_id: &str) -> Result<SessionLock, StoreError> {
        let key = lock_key(session_id);
        let nonce = Uuid::new_v4().to_string();
        if self.kv.set_nx_ex(&key, &nonce, LOCK_TTL).await? {
            Ok(SessionLock {
                key,
                nonce,
                kv: self.kv.clone(),
            })
        } else {
            Err(StoreError::LockBusy(session_id.to_string()))
        }
    }

    // ==================== Event emission ====================

    /// Emit an event: increment `seq`, append to the log, publish to live
    /// subscribers.
    pub async fn emit(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<EventEnvelope, StoreError> {
        let seq = self.kv.incr(&seq_key(session_id)).await?;
        let envelope = EventEnvelope::new(session_id, seq, event);
        let payload = serde_json::to_string(&envelope)?;
        let entry = serde_json::to_string(&serde_json::json!({ "json": payload }))?;
        self.kv.append(&stream_key(session_id), &entry).await?;
        self.kv.publish(&pub_topic(session_id), &payload).await?;
        Ok(envelope)
    }

    /// Range-read the event log, returning events with `seq > after`.
    pub async fn events_since(
        &self,
        session_id: &str,
        after: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let entries = self.kv.range_after(&stream_key(session_id), after).await?;
        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(&entry) {
                Ok(envelope) => events.push(envelope),
                Err(err) => {
                    tracing::warn!(%session_id, error = %err, "skipping undecodable log entry");
                }
            }
        }
        Ok(events)
    }

    /// Subscribe to the session's live event feed. Payloads are envelope
    /// JSON; dropping the receiver ends the subscription.
    pub async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        self.kv.subscribe(&pub_topic(session_id)).await
    }

    // ==================== Derived operations ====================

    /// Deep-merge `patch` into the session context and emit `state.updated`.
    pub async fn update_context(
        &self,
        state: &mut SessionState,
        patch: &Value,
    ) -> Result<(), StoreError> {
        deep_merge(&mut state.context, patch);
        self.save_state(state).await?;
        self.emit(
            &state.session_id,
            SessionEvent::StateUpdated {
                ctx: state.context.clone(),
            },
        )
        .await?;
        Ok(())
    }

    /// Move the session to `next` and emit `fsm.transition`.
    pub async fn transition_to_state(
        &self,
        state: &mut SessionState,
        next: &str,
    ) -> Result<(), StoreError> {
        let from = std::mem::replace(&mut state.current_state, next.to_string());
        self.save_state(state).await?;
        self.emit(
            &state.session_id,
            SessionEvent::FsmTransition {
                from,
                to: next.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn store_intent(
        &self,
        state: &mut SessionState,
        intent: Intent,
    ) -> Result<(), StoreError> {
        state.last_intent = Some(intent);
        self.save_state(state).await
    }

    /// Record an outbound tool call and emit the correlated `tool.call`.
    pub async fn store_tool_call(
        &self,
        state: &mut SessionState,
        record: ToolCallRecord,
    ) -> Result<(), StoreError> {
        state.last_tool_call = Some(record.clone());
        self.save_state(state).await?;
        self.emit(
            &state.session_id,
            SessionEvent::ToolCall {
                tool_call_id: record.id,
                name: record.name,
                args: record.args,
            },
        )
        .await?;
        Ok(())
    }

    /// Record a tool result and emit the correlated `tool.result`.
    pub async fn store_tool_result(
        &self,
        state: &mut SessionState,
        record: ToolResultRecord,
    ) -> Result<(), StoreError> {
        state.last_tool_result = Some(record.clone());
        self.save_state(state).await?;
        self.emit(
            &state.session_id,
            SessionEvent::ToolResult {
                tool_call_id: record.call_id,
                result: record.result,
            },
        )
        .await?;
        Ok(())
    }
}

fn decode_entry(entry: &str) -> Result<EventEnvelope, serde_json::Error> {
    let wrapper: Value = serde_json::from_str(entry)?;
    let payload = wrapper.get("json").and_then(Value::as_str).unwrap_or(entry);
    serde_json::from_str(payload)
}
