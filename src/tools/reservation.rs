//! Demo workers backing the restaurant reservation flow.

use super::{RetryWorker, ToolError, ToolRegistry, ToolWorker};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Availability check: a slot is open unless it was seeded as busy.
#[derive(Default)]
pub struct CheckAvailability {
    busy: HashSet<(String, String)>,
}

impl CheckAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed busy `(date, time)` slots; used to exercise the retry-the-
    /// date-time path.
    #[allow(dead_code)] // Used in tests
    pub fn with_busy(slots: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            busy: slots.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ToolWorker for CheckAvailability {
    async fn execute(&self, _: &str, _: &str, args: &Value) -> Result<Value, ToolError> {
        let date = required_str(args, "date")?;
        let time = required_str(args, "time")?;
        let ok = !self.busy.contains(&(date.to_string(), time.to_string()));
        Ok(json!({ "ok": ok }))
    }
}

/// Booking creation: returns a fresh reservation id.
#[derive(Default)]
pub struct CreateReservation;

#[async_trait]
impl ToolWorker for CreateReservation {
    async fn execute(&self, _: &str, _: &str, args: &Value) -> Result<Value, ToolError> {
        required_str(args, "date")?;
        required_str(args, "time")?;
        Ok(json!({ "reservationId": Uuid::new_v4().to_string() }))
    }
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::failed(format!("missing argument `{field}`")))
}

/// The registry the demo deployment starts with: both reservation workers
/// behind the bounded-retry wrapper.
pub fn demo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(
        "CheckAvailability",
        Arc::new(RetryWorker::new(
            CheckAvailability::new(),
            RETRY_ATTEMPTS,
            RETRY_DELAY,
        )),
    );
    registry.register(
        "CreateReservation",
        Arc::new(RetryWorker::new(
            CreateReservation,
            RETRY_ATTEMPTS,
            RETRY_DELAY,
        )),
    );
    registry
}
