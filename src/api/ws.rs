//! WebSocket endpoint for live session observers.
//!
//! Flow:
//! 1. Client connects to `/ws?session_id=<id>`
//! 2. Server sends `session.started`, then every session event as it lands
//! 3. Client may send `user.text`, `user.dtmf`, or `client.cancel`;
//!    unknown frames are answered with an `error` and ignored

use super::AppState;
use crate::event::{EventEnvelope, SessionEvent};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

/// Create the streaming router
pub fn create_ws_router(state: AppState) -> Router {
    Router::new().route("/ws", get(observer_ws)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: String,
}

/// An inbound client frame.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    digits: Option<String>,
}

async fn observer_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut stream) = socket.split();

    if !matches!(state.store.session_exists(&session_id).await, Ok(true)) {
        let _ = sink
            .send(error_frame(
                &session_id,
                &format!("session not found: {session_id}"),
            ))
            .await;
        return;
    }

    let mut events = match state.fanout.attach(&session_id).await {
        Ok(rx) => rx,
        Err(err) => {
            let _ = sink.send(error_frame(&session_id, &err.to_string())).await;
            return;
        }
    };

    tracing::debug!(%session_id, "observer attached");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(envelope) = event else { break };
                let Ok(payload) = serde_json::to_string(&envelope) else { continue };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_frame(&state, &session_id, &text, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the receiver detaches this observer; the session itself is
    // unaffected.
    tracing::debug!(%session_id, "observer detached");
}

/// Returns `true` when the connection should close.
async fn handle_client_frame(
    state: &AppState,
    session_id: &str,
    raw: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(raw) else {
        let _ = sink.send(error_frame(session_id, "unparseable frame")).await;
        return false;
    };

    match frame.kind.as_str() {
        "user.text" => {
            let text = frame.text.unwrap_or_default();
            if text.trim().is_empty() {
                let _ = sink.send(error_frame(session_id, "missing text")).await;
            } else if let Err(err) = state.orchestrator.process_user_input(session_id, &text).await
            {
                let _ = sink.send(error_frame(session_id, &err.to_string())).await;
            }
            false
        }
        "user.dtmf" => {
            let digits = frame.digits.unwrap_or_default();
            if digits.is_empty() {
                let _ = sink.send(error_frame(session_id, "missing digits")).await;
            } else if let Err(err) =
                state.orchestrator.process_user_input(session_id, &digits).await
            {
                let _ = sink.send(error_frame(session_id, &err.to_string())).await;
            }
            false
        }
        "client.cancel" => true,
        other => {
            let _ = sink
                .send(error_frame(
                    session_id,
                    &format!("unknown frame type: {other}"),
                ))
                .await;
            false
        }
    }
}

/// Build an `error` frame addressed to this connection only. These are not
/// logged to the session stream; like the synthetic `session.started` they
/// carry the reserved sequence number 0, so the wire shape matches every
/// other delivered event.
fn error_frame(session_id: &str, message: &str) -> Message {
    let envelope = EventEnvelope::new(
        session_id,
        0,
        SessionEvent::Error {
            message: message.to_string(),
        },
    );
    Message::Text(
        serde_json::to_string(&envelope)
            .unwrap_or_else(|_| r#"{"type":"error"}"#.to_string()),
    )
}
