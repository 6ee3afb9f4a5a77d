//! In-process key-value backend.
//!
//! The default backend when no store URL is configured, and the backend
//! every test runs against. Topic fan-out uses a broadcast channel per
//! topic, bridged to per-subscriber mpsc channels so the trait surface
//! matches the networked backend.

use super::kv::KvBackend;
use super::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const TOPIC_CAPACITY: usize = 256;
const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    expiries: HashMap<String, Instant>,
    counters: HashMap<String, u64>,
    logs: HashMap<String, Vec<String>>,
    topics: HashMap<String, broadcast::Sender<String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.strings.remove(key);
            }
        }
    }

    fn topic_sender(&mut self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.purge_expired(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.purge_expired(key);
        if state.strings.get(key).is_some_and(|v| v == expected) {
            state.strings.remove(key);
            state.expiries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.purge_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.expiries.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().unwrap();
        state.strings.remove(key);
        state.expiries.remove(key);
        state.counters.remove(key);
        state.logs.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.inner.lock().unwrap();
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn append(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        let mut state = self.inner.lock().unwrap();
        state
            .logs
            .entry(key.to_string())
            .or_default()
            .push(entry.to_string());
        Ok(())
    }

    async fn range_after(&self, key: &str, after: u64) -> Result<Vec<String>, StoreError> {
        let state = self.inner.lock().unwrap();
        let entries = state.logs.get(key).map(Vec::as_slice).unwrap_or_default();
        let skip = usize::try_from(after).unwrap_or(usize::MAX);
        Ok(entries.iter().skip(skip).cloned().collect())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let sender = {
            let state = self.inner.lock().unwrap();
            state.topics.get(topic).cloned()
        };
        if let Some(sender) = sender {
            // No subscribers is fine; the log is the durable copy.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut upstream = {
            let mut state = self.inner.lock().unwrap();
            BroadcastStream::new(state.topic_sender(topic).subscribe())
        };
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        tokio::spawn(async move {
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "memory pubsub subscriber lagged");
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_presence_and_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("lock:s", "a", Duration::from_millis(40)).await.unwrap());
        assert!(!kv.set_nx_ex("lock:s", "b", Duration::from_millis(40)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kv.set_nx_ex("lock:s", "c", Duration::from_millis(40)).await.unwrap());
        assert_eq!(kv.get("lock:s").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn del_if_eq_compares_values() {
        let kv = MemoryKv::new();
        kv.set_nx_ex("lock:s", "nonce", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!kv.del_if_eq("lock:s", "other").await.unwrap());
        assert!(kv.del_if_eq("lock:s", "nonce").await.unwrap());
        assert_eq!(kv.get("lock:s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_are_dense() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("seq:s").await.unwrap(), 1);
        assert_eq!(kv.incr("seq:s").await.unwrap(), 2);
        assert_eq!(kv.incr("seq:other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn log_appends_and_ranges() {
        let kv = MemoryKv::new();
        for entry in ["a", "b", "c"] {
            kv.append("stream:s", entry).await.unwrap();
        }
        assert_eq!(kv.range_after("stream:s", 0).await.unwrap(), ["a", "b", "c"]);
        assert_eq!(kv.range_after("stream:s", 2).await.unwrap(), ["c"]);
        assert!(kv.range_after("stream:s", 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pubsub_delivers_to_live_subscribers() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("pub:s").await.unwrap();
        kv.publish("pub:s", "one").await.unwrap();
        kv.publish("pub:s", "two").await.unwrap();
        assert_eq!(rx.recv().await, Some("one".to_string()));
        assert_eq!(rx.recv().await, Some("two".to_string()));
    }
}
