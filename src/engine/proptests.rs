//! Property-based tests for the engine.
//!
//! Random input sequences against the reservation flow must never break
//! the log invariants: dense sequence numbers, exactly one outcome per
//! tool call, and a `currentState` that stays inside the flow.

use super::testing::{demo_orchestrator, send_input};
use crate::event::SessionEvent;
use crate::flow::demo::reservation_flow;
use proptest::prelude::*;
use std::time::Duration;

const INPUTS: [&str; 6] = [
    "I'd like to make a reservation",
    "We are 4 people",
    "party of 12",
    "tomorrow at 7pm",
    "My name is John Doe, phone 555-1234",
    "blue elephants banana",
];

fn arb_inputs() -> impl Strategy<Value = Vec<&'static str>> {
    proptest::collection::vec(proptest::sample::select(&INPUTS[..]), 1..8)
}

async fn quiesce(store: &crate::store::SessionStore, session_id: &str) {
    // Wait until every emitted tool.call has an outcome.
    for _ in 0..500 {
        let events = store.events_since(session_id, 0).await.unwrap();
        let calls: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.event {
                SessionEvent::ToolCall { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            })
            .collect();
        let settled = calls.iter().all(|call_id| {
            events.iter().any(|e| match &e.event {
                SessionEvent::ToolResult { tool_call_id, .. }
                | SessionEvent::ToolError { tool_call_id, .. } => tool_call_id == call_id,
                _ => false,
            })
        });
        if settled {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never quiesced");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn random_dialogs_keep_log_invariants(inputs in arb_inputs()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (events, state) = rt.block_on(async {
            let orchestrator = demo_orchestrator();
            let store = orchestrator.store().clone();
            let (session_id, _) = orchestrator.create_demo_session().await.unwrap();

            for input in inputs {
                send_input(&orchestrator, &session_id, input).await;
                quiesce(&store, &session_id).await;
            }

            let events = store.events_since(&session_id, 0).await.unwrap();
            let state = store.get_state(&session_id).await.unwrap();
            (events, state)
        });

        // Dense sequence numbers.
        for pair in events.windows(2) {
            prop_assert_eq!(pair[1].seq, pair[0].seq + 1);
        }

        // Exactly one outcome per tool call.
        for event in &events {
            if let SessionEvent::ToolCall { tool_call_id, .. } = &event.event {
                let outcomes = events
                    .iter()
                    .filter(|e| match &e.event {
                        SessionEvent::ToolResult { tool_call_id: id, .. }
                        | SessionEvent::ToolError { tool_call_id: id, .. } => id == tool_call_id,
                        _ => false,
                    })
                    .count();
                prop_assert_eq!(outcomes, 1);
            }
        }

        // currentState never leaves the flow.
        let flow = reservation_flow();
        prop_assert!(flow.states.contains_key(&state.current_state));
    }
}
