//! The narrow contract the session store needs from a key-value service:
//! set-if-absent with expiry, compare-and-delete, counters, an append-only
//! log per key, and topic pub/sub.

use super::StoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Set `key` to `value` with a TTL, only if the key is absent.
    /// Returns `true` when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete `key` only if it still holds `expected`. Returns `true` when
    /// the key was deleted.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment the counter at `key`, returning the new value.
    /// A missing counter starts at zero.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    /// Append an entry to the ordered log at `key`.
    async fn append(&self, key: &str, entry: &str) -> Result<(), StoreError>;

    /// Read log entries, skipping the first `after` of them.
    async fn range_after(&self, key: &str, after: u64) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a topic. Dropping the receiver ends the subscription.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError>;
}

#[async_trait]
impl<T: KvBackend + ?Sized> KvBackend for Arc<T> {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_nx_ex(key, value, ttl).await
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).del_if_eq(key, expected).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        (**self).del(key).await
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        (**self).incr(key).await
    }

    async fn append(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        (**self).append(key, entry).await
    }

    async fn range_after(&self, key: &str, after: u64) -> Result<Vec<String>, StoreError> {
        (**self).range_after(key, after).await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        (**self).publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        (**self).subscribe(topic).await
    }
}
