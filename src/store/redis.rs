//! Redis key-value backend.
//!
//! Selected when a `redis://` store URL is configured. The lock uses
//! `SET NX EX`; release is a compare-and-delete Lua script so only the
//! holder's nonce can release. Event logs are plain lists (append order is
//! the sequence order) and live fan-out uses Redis pub/sub.

use super::kv::KvBackend;
use super::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;

const SUBSCRIBER_CAPACITY: usize = 256;

const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

pub struct RedisKv {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisKv {
    /// Connect to the given `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(backend_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend_err)?;
        Ok(Self { client, conn })
    }
}

fn backend_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(reply.is_some())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        u64::try_from(value).map_err(|_| StoreError::Backend("negative counter".to_string()))
    }

    async fn append(&self, key: &str, entry: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("RPUSH")
            .arg(key)
            .arg(entry)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn range_after(&self, key: &str, after: u64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let start = i64::try_from(after).unwrap_or(i64::MAX);
        redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend_err)?;
        pubsub.subscribe(topic).await.map_err(backend_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%topic, error = %err, "dropping undecodable pubsub payload");
                    }
                }
            }
        });
        Ok(rx)
    }
}
