//! Shared store operations the stage relies on: a FIFO work queue with a
//! blocking pop and per-job hashes with field-level writes.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::info;
use redis::{
    aio::ConnectionManager,
    AsyncCommands,
};
use tokio::sync::{
    Mutex,
    Notify,
};

use crate::error::BrokerError;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Pushes `id` at the head of `queue`; `dequeue_blocking` pops the tail.
    async fn enqueue(&self, queue: &str, id: &str) -> Result<(), BrokerError>;

    /// Pushes `id` at the tail of `queue`, for stages that pop the head.
    async fn handoff(&self, queue: &str, id: &str) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for an item on `queue` and removes it. An item
    /// is delivered to exactly one caller; `None` means the wait ran out.
    async fn dequeue_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// Writes all `fields` in one call.
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), BrokerError>;

    async fn hash_del(&self, key: &str, fields: &[&str]) -> Result<(), BrokerError>;

    /// Removes `stale` and writes `fields` as one atomic step: either both
    /// happen or neither does.
    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        stale: &[&str],
    ) -> Result<(), BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Redis-backed broker. Blocking pops run on their own connection so they
/// never hold up record writes. Both connections are re-established after
/// the server drops them; the failing call still reports the error.
#[derive(Clone)]
pub struct RedisBroker {
    con: ConnectionManager,
    queue_con: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let con = client.get_connection_manager().await?;
        let queue_con = client.get_connection_manager().await?;
        let broker = Self {
            con: con,
            queue_con: queue_con,
        };
        broker.ping().await?;
        info!("Connected to Redis at `{url}`");
        Ok(broker)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: () = con.lpush(queue, id).await?;
        Ok(())
    }

    async fn handoff(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: () = con.rpush(queue, id).await?;
        Ok(())
    }

    async fn dequeue_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let mut con = self.queue_con.clone();
        // a zero timeout would block forever
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = con.brpop(queue, secs).await?;
        Ok(popped.map(|(_queue, id)| id))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let mut con = self.con.clone();
        Ok(con.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut con = self.con.clone();
        Ok(con.hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: () = con.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hash_del(&self, key: &str, fields: &[&str]) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: () = con.hdel(key, fields.to_vec()).await?;
        Ok(())
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        stale: &[&str],
    ) -> Result<(), BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        // HDEL and HMSET reject empty argument lists
        if !stale.is_empty() {
            pipe.hdel(key, stale.to_vec()).ignore();
        }
        if !fields.is_empty() {
            pipe.hset_multiple(key, fields).ignore();
        }
        let mut con = self.con.clone();
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut con = self.con.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut con)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<String>>,

    hashes: HashMap<String, HashMap<String, String>>,

    // wakes a waiting consumer per push
    signals: HashMap<String, Arc<Notify>>,
}

impl MemoryState {
    fn signal(&mut self, queue: &str) -> Arc<Notify> {
        self.signals
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

/// In-process broker with the same queue and hash semantics as Redis, used
/// for standalone runs (`redis_url = "memory://"`) and tests.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, queue: &str, id: &str, at_head: bool) {
        let mut state = self.state.lock().await;
        let items = state.queues.entry(queue.to_string()).or_default();
        if at_head {
            items.push_front(id.to_string());
        } else {
            items.push_back(id.to_string());
        }
        state.signal(queue).notify_one();
    }

    /// Queue contents from head to tail.
    #[cfg(test)]
    pub async fn queued(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state.queues
            .get(queue)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        self.push(queue, id, true).await;
        Ok(())
    }

    async fn handoff(&self, queue: &str, id: &str) -> Result<(), BrokerError> {
        self.push(queue, id, false).await;
        Ok(())
    }

    async fn dequeue_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        let wait = async {
            loop {
                let signal = {
                    let mut state = self.state.lock().await;
                    if let Some(id) = state.queues
                        .get_mut(queue)
                        .and_then(|items| items.pop_back())
                    {
                        return id;
                    }
                    state.signal(queue)
                };
                // a push between unlock and here leaves a permit behind
                signal.notified().await;
            }
        };
        Ok(tokio::time::timeout(timeout, wait).await.ok())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_del(&self, key: &str, fields: &[&str]) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(hash) = state.hashes.get_mut(key) {
            for field in fields {
                hash.remove(*field);
            }
            if hash.is_empty() {
                state.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_replace(
        &self,
        key: &str,
        fields: &[(&str, String)],
        stale: &[&str],
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for field in stale {
            hash.remove(*field);
        }
        for (field, value) in fields {
            hash.insert(field.to_string(), value.clone());
        }
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
