//! Observer fan-out.
//!
//! Bridges a session's pub/sub feed to any number of live observers. The
//! first observer for a session opens the upstream subscription; every
//! received event is dispatched to every observer's outbound channel; dead
//! observers are evicted on send failure; when the set empties, the
//! upstream subscription closes. Each newly attached observer first
//! receives a synthetic `session.started` event.

use crate::event::{EventEnvelope, SessionEvent};
use crate::store::{SessionStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const OBSERVER_CAPACITY: usize = 256;

type ObserverSet = Arc<Mutex<Vec<mpsc::Sender<EventEnvelope>>>>;

pub struct Fanout {
    store: SessionStore,
    sessions: Arc<Mutex<HashMap<String, ObserverSet>>>,
}

impl Fanout {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach an observer to a session. Dropping the returned receiver
    /// detaches it; the last detach closes the upstream subscription.
    pub async fn attach(
        &self,
        session_id: &str,
    ) -> Result<mpsc::Receiver<EventEnvelope>, StoreError> {
        let (tx, rx) = mpsc::channel(OBSERVER_CAPACITY);

        let started = EventEnvelope::new(
            session_id,
            0,
            SessionEvent::SessionStarted {
                session_id: session_id.to_string(),
            },
        );
        // The channel is freshly created; this cannot be full.
        let _ = tx.try_send(started);

        // Subscribe before taking the table lock; if another attach won the
        // race the extra subscription is dropped immediately.
        let upstream = self.store.subscribe(session_id).await?;

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(observers) = sessions.get(session_id) {
            observers.lock().unwrap().push(tx);
            drop(upstream);
        } else {
            let observers: ObserverSet = Arc::new(Mutex::new(vec![tx]));
            sessions.insert(session_id.to_string(), observers.clone());
            tokio::spawn(pump(
                session_id.to_string(),
                upstream,
                observers,
                self.sessions.clone(),
            ));
        }

        Ok(rx)
    }

    /// Live observer count for a session.
    #[allow(dead_code)] // Used in tests
    pub fn observer_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map_or(0, |observers| observers.lock().unwrap().len())
    }
}

/// Dispatch loop for one session. Ends when every observer is gone or the
/// upstream feed closes.
async fn pump(
    session_id: String,
    mut upstream: mpsc::Receiver<String>,
    observers: ObserverSet,
    sessions: Arc<Mutex<HashMap<String, ObserverSet>>>,
) {
    while let Some(payload) = upstream.recv().await {
        let envelope: EventEnvelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "dropping undecodable event");
                continue;
            }
        };

        tracing::trace!(%session_id, kind = envelope.event.kind(), seq = envelope.seq, "dispatching");
        let now_empty = {
            let mut set = observers.lock().unwrap();
            set.retain(|tx| tx.try_send(envelope.clone()).is_ok());
            set.is_empty()
        };
        // An attach may race in between the dispatch above and the table
        // lock; close only if the set is still empty once both locks are
        // held (same lock order as `attach`).
        if now_empty && close_if_still_empty(&session_id, &observers, &sessions) {
            tracing::debug!(%session_id, "fan-out subscription closed");
            return;
        }
    }

    let mut table = sessions.lock().unwrap();
    if table
        .get(&session_id)
        .is_some_and(|current| Arc::ptr_eq(current, &observers))
    {
        table.remove(&session_id);
    }
    tracing::debug!(%session_id, "fan-out subscription closed");
}

/// Remove the session's fan-out entry if its observer set is still empty.
/// Holding the table lock first blocks concurrent attaches, so the check
/// and removal are atomic; returns false when an observer raced in and the
/// pump must keep running.
fn close_if_still_empty(
    session_id: &str,
    observers: &ObserverSet,
    sessions: &Mutex<HashMap<String, ObserverSet>>,
) -> bool {
    let mut table = sessions.lock().unwrap();
    if !observers.lock().unwrap().is_empty() {
        return false;
    }
    if table
        .get(session_id)
        .is_some_and(|current| Arc::ptr_eq(current, observers))
    {
        table.remove(session_id);
    }
    true
}
