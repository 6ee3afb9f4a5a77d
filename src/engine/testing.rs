//! Test fixtures for driving the engine without real I/O or wall-clock
//! waits: scripted workers, a seeded classifier, and polling helpers.

use super::{EngineError, Orchestrator};
use crate::classify::pattern::PatternClassifier;
use crate::event::EventEnvelope;
use crate::store::{SessionStore, StoreError};
use crate::tools::reservation::{demo_registry, CheckAvailability, CreateReservation};
use crate::tools::{RetryWorker, ToolError, ToolRegistry, ToolWorker};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Orchestrator over an in-memory store, the seeded pattern classifier and
/// the stock demo workers.
pub fn demo_orchestrator() -> Orchestrator {
    orchestrator_with(demo_registry())
}

/// Orchestrator with a custom tool registry.
pub fn orchestrator_with(registry: ToolRegistry) -> Orchestrator {
    Orchestrator::new(
        SessionStore::in_memory(),
        Arc::new(PatternClassifier::with_seed(0)),
        Arc::new(registry),
    )
}

/// Demo registry with a busy availability slot, for the alternate-date path.
pub fn registry_with_busy_slot(date: &str, time: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        "CheckAvailability",
        Arc::new(RetryWorker::new(
            CheckAvailability::with_busy([(date.to_string(), time.to_string())]),
            3,
            Duration::from_secs(1),
        )),
    );
    registry.register(
        "CreateReservation",
        Arc::new(RetryWorker::new(CreateReservation, 3, Duration::from_secs(1))),
    );
    registry
}

/// Worker that always fails, counting its attempts.
#[derive(Default)]
pub struct FailingWorker {
    pub attempts: AtomicU32,
}

#[async_trait]
impl ToolWorker for FailingWorker {
    async fn execute(&self, _: &str, _: &str, _: &Value) -> Result<Value, ToolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::failed("upstream unavailable"))
    }
}

/// Worker that sleeps past any reasonable timeout.
pub struct SleepyWorker(pub Duration);

#[async_trait]
impl ToolWorker for SleepyWorker {
    async fn execute(&self, _: &str, _: &str, _: &Value) -> Result<Value, ToolError> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

/// Post user input, retrying while a background tool completion briefly
/// holds the session lock.
pub async fn send_input(orchestrator: &Orchestrator, session_id: &str, text: &str) {
    for _ in 0..200 {
        match orchestrator.process_user_input(session_id, text).await {
            Ok(()) => return,
            Err(EngineError::Store(StoreError::LockBusy(_))) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("input `{text}` failed: {err}"),
        }
    }
    panic!("session `{session_id}` stayed locked");
}

/// Poll until the session reaches `expected`, panicking after ~5 seconds.
pub async fn wait_for_state(store: &SessionStore, session_id: &str, expected: &str) {
    for _ in 0..2000 {
        if let Ok(state) = store.get_state(session_id).await {
            if state.current_state == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let state = store.get_state(session_id).await;
    panic!("session never reached `{expected}`; state: {state:?}");
}

/// Poll until the session log holds at least `count` events of `kind`.
pub async fn wait_for_events(
    store: &SessionStore,
    session_id: &str,
    kind: &str,
    count: usize,
) -> Vec<EventEnvelope> {
    for _ in 0..500 {
        let events = store.events_since(session_id, 0).await.unwrap_or_default();
        if events.iter().filter(|e| e.event.kind() == kind).count() >= count {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = store.events_since(session_id, 0).await.unwrap_or_default();
    panic!(
        "log never held {count} `{kind}` events; kinds: {:?}",
        events.iter().map(|e| e.event.kind()).collect::<Vec<_>>()
    );
}
