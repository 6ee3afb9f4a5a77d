//! Tool workers and the process-wide registry.
//!
//! A worker performs one named external side effect. The registry maps tool
//! names to workers and is built once at startup; the engine wraps each
//! invocation with the flow's per-tool timeout and re-enters the state
//! machine with the result.

pub mod reservation;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }
}

/// One external side effect, invoked from a flow's `tool` action.
#[async_trait]
pub trait ToolWorker: Send + Sync {
    async fn execute(
        &self,
        session_id: &str,
        tool_call_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError>;
}

#[async_trait]
impl<T: ToolWorker + ?Sized> ToolWorker for Arc<T> {
    async fn execute(
        &self,
        session_id: &str,
        tool_call_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        (**self).execute(session_id, tool_call_id, args).await
    }
}

/// Name → worker mapping. Mutated only at startup, shared read-only across
/// every session afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    workers: HashMap<String, Arc<dyn ToolWorker>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, worker: Arc<dyn ToolWorker>) {
        self.workers.insert(name.into(), worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolWorker>> {
        self.workers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.workers.keys().map(String::as_str).collect()
    }
}

/// Bounded-retry wrapper: up to `attempts` tries with a fixed delay between
/// them. Only the final failure propagates; retrying never re-emits
/// `tool.call`.
pub struct RetryWorker<W> {
    inner: W,
    attempts: u32,
    delay: Duration,
}

impl<W> RetryWorker<W> {
    pub fn new(inner: W, attempts: u32, delay: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            delay,
        }
    }
}

#[async_trait]
impl<W: ToolWorker> ToolWorker for RetryWorker<W> {
    async fn execute(
        &self,
        session_id: &str,
        tool_call_id: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.inner.execute(session_id, tool_call_id, args).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    tracing::warn!(
                        %session_id,
                        %tool_call_id,
                        attempt,
                        error = %err,
                        "tool attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ToolError::failed("tool produced no result")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingWorker {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ToolWorker for CountingWorker {
        async fn execute(&self, _: &str, _: &str, _: &Value) -> Result<Value, ToolError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(ToolError::failed(format!("boom {call}")))
            } else {
                Ok(json!({"call": call}))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let worker = RetryWorker::new(
            CountingWorker {
                calls: AtomicU32::new(0),
                fail_first: 2,
            },
            3,
            Duration::from_secs(1),
        );
        let result = worker.execute("s1", "c1", &json!({})).await.unwrap();
        assert_eq!(result, json!({"call": 3}));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_surfaces_only_the_final_failure() {
        let inner = CountingWorker {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let worker = RetryWorker::new(inner, 3, Duration::from_secs(1));
        let err = worker.execute("s1", "c1", &json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "boom 3");
        assert_eq!(worker.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn registry_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "Echo",
            Arc::new(CountingWorker {
                calls: AtomicU32::new(0),
                fail_first: 0,
            }),
        );
        assert!(registry.get("Echo").is_some());
        assert!(registry.get("Nope").is_none());
        assert_eq!(registry.names(), vec!["Echo"]);
    }
}
