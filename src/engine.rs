//! The state machine driver.
//!
//! Every user input or tool result runs under the session lock and produces
//! a deterministic sequence of events. Tool actions do not block the
//! driver: the call is recorded and raced against its timeout on a
//! background task whose completion re-enters [`Orchestrator::process_tool_result`]
//! under a fresh lock, so per-session serial semantics hold without holding
//! the lock across long I/O.

#[cfg(test)]
mod proptests;
#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub mod testing;

use crate::classify::Classifier;
use crate::event::SessionEvent;
use crate::expr::evaluate;
use crate::flow::validate::{validate, ValidationError};
use crate::flow::{demo, Action, FlowConfig, StateDef, TransitionSpec};
use crate::paths::set_path;
use crate::store::{
    SessionState, SessionStore, StoreError, ToolCallRecord, ToolResultRecord,
};
use crate::template::{resolve_str, resolve_value, value_to_text, TemplateEnv};
use crate::tools::{ToolRegistry, ToolWorker};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REPROMPT_TEXT: &str = "I didn't quite understand that. Let me ask again:";
const REPROMPT_SAY_DELAY: Duration = Duration::from_millis(1000);
const REPROMPT_ASK_DELAY: Duration = Duration::from_millis(500);

/// How long a completed tool call keeps retrying to re-enter a busy session
/// before giving up with a `tool.error`.
const RESULT_LOCK_RETRIES: u32 = 10;
const RESULT_LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid flow: {}", format_errors(.0))]
    InvalidFlow(Vec<ValidationError>),
    #[error("unknown state: {0}")]
    UnknownState(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Clone)]
pub struct Orchestrator {
    store: SessionStore,
    classifier: Arc<dyn Classifier>,
    tools: Arc<ToolRegistry>,
    /// Per-session cancellation for scheduled work (soft re-prompts).
    scheduled: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        store: SessionStore,
        classifier: Arc<dyn Classifier>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            store,
            classifier,
            tools,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    // ==================== Session lifecycle ====================

    /// Validate the flow, create the session, and run the start state's
    /// `onEnter` actions.
    pub async fn create_session(
        &self,
        flow: FlowConfig,
        session_id: Option<String>,
    ) -> Result<String, EngineError> {
        let warnings = validate(&flow).map_err(EngineError::InvalidFlow)?;
        for warning in &warnings {
            tracing::warn!(flow = %flow.name(), %warning, "flow validation warning");
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = self.store.create_session(&session_id, &flow).await?;

        let lock = self.store.lock(&session_id).await?;
        let result = match flow.states.get(&flow.start) {
            Some(start) => self.run_on_enter(&mut state, &flow, start).await,
            None => Ok(()),
        };
        release_and_log(lock).await;
        result?;

        Ok(session_id)
    }

    /// Create a session bound to the built-in reservation flow.
    pub async fn create_demo_session(&self) -> Result<(String, String), EngineError> {
        let flow = demo::reservation_flow();
        let name = flow.name().to_string();
        let session_id = self.create_session(flow, None).await?;
        Ok((session_id, name))
    }

    /// Tear down a session: cancel its scheduled work and drop its keys.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        if let Some(token) = self.scheduled.lock().unwrap().remove(session_id) {
            token.cancel();
        }
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    // ==================== Public operations ====================

    /// Classify user text, persist the intent, and evaluate the current
    /// state's transitions in declaration order.
    pub async fn process_user_input(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<(), EngineError> {
        let lock = self.store.lock(session_id).await?;
        let result = self.locked_user_input(session_id, text).await;
        release_and_log(lock).await;
        result
    }

    /// Force the session into `next`: emit the transition and run the
    /// target's `onEnter` actions.
    pub async fn enter_state(&self, session_id: &str, next: &str) -> Result<(), EngineError> {
        let lock = self.store.lock(session_id).await?;
        let result = self.locked_enter_state(session_id, next).await;
        release_and_log(lock).await;
        result
    }

    /// Persist a tool result and evaluate transitions matching the
    /// originating tool.
    pub async fn process_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), EngineError> {
        let lock = self.store.lock(session_id).await?;
        let outcome = self.locked_tool_result(session_id, tool_call_id, result).await;
        release_and_log(lock).await;
        outcome
    }

    // ==================== Locked bodies ====================

    async fn locked_enter_state(&self, session_id: &str, next: &str) -> Result<(), EngineError> {
        let (mut state, flow) = self.store.load(session_id).await?;
        if !flow.states.contains_key(next) {
            return Err(EngineError::UnknownState(next.to_string()));
        }
        self.enter(&mut state, &flow, next).await
    }

    async fn locked_user_input(&self, session_id: &str, text: &str) -> Result<(), EngineError> {
        let (mut state, flow) = self.store.load(session_id).await?;

        let intent = self
            .classifier
            .classify(text, &flow.intents, &state.context)
            .await;
        tracing::debug!(
            %session_id,
            intent = %intent.name,
            confidence = intent.confidence,
            "classified user input"
        );
        self.store.store_intent(&mut state, intent.clone()).await?;

        let current = state.current_state.clone();
        let Some(state_def) = flow.states.get(&current) else {
            tracing::error!(%session_id, state = %current, "session points at unknown state");
            return Ok(());
        };

        for transition in &state_def.transitions {
            if !transition.matches_intent(&intent.name) {
                continue;
            }
            // Guards see the pre-assign context.
            if let Some(when) = &transition.when {
                if !evaluate(when, &state.context, None) {
                    continue;
                }
            }
            return self.execute_transition(&mut state, &flow, transition).await;
        }

        self.store
            .emit(
                session_id,
                SessionEvent::IntentUnhandled {
                    intent: intent.name,
                    confidence: intent.confidence,
                    current_state: current,
                },
            )
            .await?;
        self.schedule_reprompt(session_id);
        Ok(())
    }

    async fn locked_tool_result(
        &self,
        session_id: &str,
        tool_call_id: &str,
        result: Value,
    ) -> Result<(), EngineError> {
        let (mut state, flow) = self.store.load(session_id).await?;

        let tool_name = match &state.last_tool_call {
            Some(call) if call.id == tool_call_id => call.name.clone(),
            _ => {
                tracing::warn!(%session_id, %tool_call_id, "dropping stale tool result");
                return Ok(());
            }
        };

        self.store
            .store_tool_result(
                &mut state,
                ToolResultRecord {
                    call_id: tool_call_id.to_string(),
                    result: result.clone(),
                    timestamp: Utc::now(),
                },
            )
            .await?;

        let current = state.current_state.clone();
        let Some(state_def) = flow.states.get(&current) else {
            tracing::error!(%session_id, state = %current, "session points at unknown state");
            return Ok(());
        };

        for transition in &state_def.transitions {
            if transition.on_tool_result.as_deref() != Some(tool_name.as_str()) {
                continue;
            }
            if let Some(when) = &transition.when {
                if !evaluate(when, &state.context, Some(&result)) {
                    continue;
                }
            }
            return self.execute_transition(&mut state, &flow, transition).await;
        }

        tracing::debug!(%session_id, tool = %tool_name, "no transition consumed the tool result");
        Ok(())
    }

    // ==================== Transition execution ====================

    async fn execute_transition(
        &self,
        state: &mut SessionState,
        flow: &FlowConfig,
        transition: &TransitionSpec,
    ) -> Result<(), EngineError> {
        if let Some(assign) = &transition.assign {
            let patch = {
                let env = template_env(state);
                let mut patch = Value::Object(Map::new());
                for (path, template) in assign {
                    set_path(&mut patch, path, resolve_value(template, &env));
                }
                patch
            };
            self.store.update_context(state, &patch).await?;
        }

        // `branch` wins when both it and `to` are present. Branch guards see
        // the post-assign context.
        let target = if let Some(arms) = &transition.branch {
            let tool_result = state.last_tool_result.as_ref().map(|r| r.result.clone());
            arms.iter()
                .find(|arm| evaluate(&arm.when, &state.context, tool_result.as_ref()))
                .map(|arm| arm.to.clone())
        } else {
            transition.to.clone()
        };

        match target {
            Some(next) => self.enter(state, flow, &next).await,
            None => {
                tracing::debug!(
                    session_id = %state.session_id,
                    "transition matched but no branch arm was true"
                );
                Ok(())
            }
        }
    }

    /// Move to `next` and run its `onEnter` actions in declaration order.
    async fn enter(
        &self,
        state: &mut SessionState,
        flow: &FlowConfig,
        next: &str,
    ) -> Result<(), EngineError> {
        self.store.transition_to_state(state, next).await?;
        match flow.states.get(next) {
            Some(def) => self.run_on_enter(state, flow, def).await,
            None => Ok(()),
        }
    }

    async fn run_on_enter(
        &self,
        state: &mut SessionState,
        flow: &FlowConfig,
        def: &StateDef,
    ) -> Result<(), EngineError> {
        for action in &def.on_enter {
            match action.kind() {
                Some(Action::Say(text)) => {
                    let text = render(state, text);
                    self.store
                        .emit(&state.session_id, SessionEvent::Say { text })
                        .await?;
                }
                Some(Action::Ask(text)) => {
                    let text = render(state, text);
                    self.store
                        .emit(&state.session_id, SessionEvent::Ask { text })
                        .await?;
                }
                Some(Action::Transfer(target)) => {
                    let target = render(state, target);
                    self.store
                        .emit(&state.session_id, SessionEvent::Transfer { target })
                        .await?;
                }
                Some(Action::Hangup) => {
                    self.store
                        .emit(&state.session_id, SessionEvent::Hangup)
                        .await?;
                }
                Some(Action::Tool { name, args }) => {
                    self.start_tool_call(state, flow, name, args).await?;
                }
                None => {
                    tracing::error!(
                        session_id = %state.session_id,
                        "skipping malformed action in a validated flow"
                    );
                }
            }
        }
        Ok(())
    }

    // ==================== Tool calls ====================

    /// Record the call, emit `tool.call`, and race the worker against its
    /// timeout on a background task. The session lock is not held across
    /// the worker's execution.
    fn start_tool_call<'a>(
        &'a self,
        state: &'a mut SessionState,
        flow: &'a FlowConfig,
        name: &'a str,
        args_template: &'a Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let args = {
                let env = TemplateEnv {
                    ctx: Some(&state.context),
                    slot: None,
                    tool: state.last_tool_result.as_ref().map(|r| &r.result),
                };
                resolve_value(args_template, &env)
            };

            let tool_call_id = Uuid::new_v4().to_string();
            self.store
                .store_tool_call(
                    state,
                    ToolCallRecord {
                        id: tool_call_id.clone(),
                        name: name.to_string(),
                        args: args.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await?;

            let orchestrator = self.clone();
            let session_id = state.session_id.clone();
            let worker = self.tools.get(name);
            let name = name.to_string();
            let timeout = flow.tool_timeout(&name);
            tokio::spawn(async move {
                orchestrator
                    .drive_tool_call(&session_id, &tool_call_id, &name, worker, &args, timeout)
                    .await;
            });

            Ok(())
        })
    }

    async fn drive_tool_call(
        &self,
        session_id: &str,
        tool_call_id: &str,
        name: &str,
        worker: Option<Arc<dyn ToolWorker>>,
        args: &Value,
        timeout: Duration,
    ) {
        let Some(worker) = worker else {
            self.emit_tool_error(
                session_id,
                tool_call_id,
                &format!("no worker registered for tool `{name}`"),
            )
            .await;
            return;
        };

        // The worker runs on its own task so a panic surfaces as a join
        // error rather than killing the driver.
        let mut worker_task = tokio::spawn({
            let session_id = session_id.to_string();
            let tool_call_id = tool_call_id.to_string();
            let args = args.clone();
            async move { worker.execute(&session_id, &tool_call_id, &args).await }
        });

        match tokio::time::timeout(timeout, &mut worker_task).await {
            Err(_) => {
                worker_task.abort();
                self.emit_tool_error(
                    session_id,
                    tool_call_id,
                    &format!("tool `{name}` timed out after {} ms", timeout.as_millis()),
                )
                .await;
            }
            Ok(Err(join_err)) => {
                self.emit_tool_error(
                    session_id,
                    tool_call_id,
                    &format!("tool `{name}` crashed: {join_err}"),
                )
                .await;
            }
            Ok(Ok(Err(err))) => {
                self.emit_tool_error(session_id, tool_call_id, &err.to_string())
                    .await;
            }
            Ok(Ok(Ok(result))) => {
                self.feed_tool_result(session_id, tool_call_id, result).await;
            }
        }
    }

    /// Re-enter the state machine with a successful result, retrying while
    /// the session is busy with other work.
    async fn feed_tool_result(&self, session_id: &str, tool_call_id: &str, result: Value) {
        for _ in 0..RESULT_LOCK_RETRIES {
            match self
                .process_tool_result(session_id, tool_call_id, result.clone())
                .await
            {
                Ok(()) => return,
                Err(EngineError::Store(StoreError::LockBusy(_))) => {
                    tokio::time::sleep(RESULT_LOCK_RETRY_DELAY).await;
                }
                Err(EngineError::Store(StoreError::SessionNotFound(_))) => {
                    tracing::debug!(%session_id, "session gone before tool result landed");
                    return;
                }
                Err(err) => {
                    tracing::error!(%session_id, %tool_call_id, error = %err, "failed to apply tool result");
                    return;
                }
            }
        }
        self.emit_tool_error(session_id, tool_call_id, "session stayed busy; result dropped")
            .await;
    }

    async fn emit_tool_error(&self, session_id: &str, tool_call_id: &str, message: &str) {
        tracing::warn!(%session_id, %tool_call_id, error = %message, "tool call failed");
        let event = SessionEvent::ToolError {
            tool_call_id: tool_call_id.to_string(),
            error: message.to_string(),
        };
        if let Err(err) = self.store.emit(session_id, event).await {
            tracing::error!(%session_id, error = %err, "failed to emit tool error");
        }
    }

    // ==================== Soft re-prompt ====================

    /// After an unhandled intent: wait, apologize, wait, then re-ask the
    /// current state's question with fresh template resolution. Tolerates
    /// the session disappearing between schedule and fire.
    fn schedule_reprompt(&self, session_id: &str) {
        let token = self.session_token(session_id);
        let orchestrator = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(REPROMPT_SAY_DELAY) => {}
            }
            if !matches!(orchestrator.store.session_exists(&session_id).await, Ok(true)) {
                return;
            }
            let say = SessionEvent::Say {
                text: REPROMPT_TEXT.to_string(),
            };
            if orchestrator.store.emit(&session_id, say).await.is_err() {
                return;
            }

            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(REPROMPT_ASK_DELAY) => {}
            }
            let Ok((state, flow)) = orchestrator.store.load(&session_id).await else {
                return;
            };
            let Some(ask) = flow
                .states
                .get(&state.current_state)
                .and_then(StateDef::ask_text)
            else {
                return;
            };
            let text = render(&state, ask);
            let _ = orchestrator
                .store
                .emit(&session_id, SessionEvent::Ask { text })
                .await;
        });
    }

    fn session_token(&self, session_id: &str) -> CancellationToken {
        self.scheduled
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }
}

fn template_env(state: &SessionState) -> TemplateEnv<'_> {
    TemplateEnv {
        ctx: Some(&state.context),
        slot: state.last_intent.as_ref().map(|i| &i.slots),
        tool: state.last_tool_result.as_ref().map(|r| &r.result),
    }
}

fn render(state: &SessionState, template: &str) -> String {
    value_to_text(&resolve_str(template, &template_env(state)))
}

async fn release_and_log(lock: crate::store::SessionLock) {
    if let Err(err) = lock.release().await {
        tracing::warn!(error = %err, "failed to release session lock");
    }
}
