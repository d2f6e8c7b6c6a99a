//! Presence façade
//!
//! The surface room and session logic talks to: topic pub/sub through the
//! [`Multiplexer`] plus the coordination primitives (expiring strings, sets,
//! hashes, counters) of the shared store. The façade holds no presence state
//! of its own; every primitive is one round trip on the command connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::multiplexer::{Callback, Multiplexer};
use crate::store::{Commands, Subscriber, escape_pattern};

#[cfg(feature = "redis")]
use crate::config::Config;

#[cfg(feature = "memory")]
use crate::store::MemoryStore;

/// Shared presence store handle for one node
pub struct Presence {
    commands: Arc<dyn Commands>,
    multiplexer: Multiplexer,
}

impl Presence {
    /// Build a façade over an existing connection pair
    pub fn new(commands: Arc<dyn Commands>, subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            commands,
            multiplexer: Multiplexer::new(subscriber),
        }
    }

    /// Connect both connections to Redis
    ///
    /// # Example
    /// ```ignore
    /// let presence = Presence::connect(&Config::from_env()?).await?;
    /// ```
    #[cfg(feature = "redis")]
    pub async fn connect(config: &Config) -> Result<Self> {
        use crate::store::{RedisCommands, RedisSubscriber};

        let client = redis::Client::open(config.redis_url.as_str())?;
        let commands = RedisCommands::connect(&client).await?;
        let subscriber = RedisSubscriber::connect(&client).await?;
        info!("presence connected to redis");

        Ok(Self::new(Arc::new(commands), Arc::new(subscriber)))
    }

    /// Open a connection pair on an in-memory store
    ///
    /// Façades opened on clones of one store see each other's state and
    /// messages. Must be called inside a Tokio runtime.
    #[cfg(feature = "memory")]
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self::new(Arc::new(store.commands()), Arc::new(store.subscriber()))
    }

    /// Subscribe `callback` to `topic`; returns the handle to unsubscribe with
    pub async fn subscribe(&self, topic: &str, callback: Callback) -> Result<Callback> {
        self.multiplexer.subscribe(topic, callback).await
    }

    /// Remove `callback` from `topic`, or every callback when `None`
    pub async fn unsubscribe(&self, topic: &str, callback: Option<&Callback>) -> Result<()> {
        self.multiplexer.unsubscribe(topic, callback).await
    }

    /// Publish a payload to every subscriber of `topic`, on any node
    ///
    /// `None` is sent as `false`. Subscriber counts are not reported.
    pub async fn publish<T>(&self, topic: &str, payload: Option<&T>) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let message = Envelope::from(payload).encode()?;
        let receivers = self.commands.publish(topic, &message).await?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    /// Publish without a payload; subscribers receive `false`
    pub async fn publish_empty(&self, topic: &str) -> Result<()> {
        self.publish::<()>(topic, None).await
    }

    /// Whether any connection, on any node, is subscribed to exactly `topic`
    pub async fn exists(&self, topic: &str) -> Result<bool> {
        let channels = self.commands.channels(&escape_pattern(topic)).await?;
        Ok(channels.iter().any(|channel| channel == topic))
    }

    /// Set `key` to `value` for `seconds`, replacing any previous value
    pub async fn setex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        self.commands.setex(key, value, seconds).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.commands.get(key).await
    }

    /// Delete `key`; deleting a missing key succeeds
    pub async fn del(&self, key: &str) -> Result<()> {
        self.commands.del(key).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.commands.sadd(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        self.commands.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.commands.sismember(key, member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.commands.srem(key, member).await
    }

    pub async fn scard(&self, key: &str) -> Result<usize> {
        self.commands.scard(key).await
    }

    /// Members common to all `keys`
    ///
    /// No keys yields an empty set without contacting the store; a single key
    /// yields that set's members.
    pub async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        self.commands.sinter(keys).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.commands.hset(key, field, value).await
    }

    /// Add `delta` to a hash field (missing fields start at 0), returning the new value
    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.commands.hincrby(key, field, delta).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.commands.hget(key, field).await
    }

    /// All fields of a hash; empty when the hash does not exist
    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.commands.hgetall(key).await
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.commands.hdel(key, field).await
    }

    pub async fn hlen(&self, key: &str) -> Result<usize> {
        self.commands.hlen(key).await
    }

    /// Increment a counter (missing counters start at 0), returning the new value
    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.commands.incr(key).await
    }

    /// Decrement a counter (missing counters start at 0), returning the new value
    pub async fn decr(&self, key: &str) -> Result<i64> {
        self.commands.decr(key).await
    }

    /// Topics this node has callbacks for
    pub fn subscriptions(&self) -> Vec<String> {
        self.multiplexer.topics()
    }

    /// Close both connections
    ///
    /// Never fails; operations still in flight may end with
    /// `PresenceError::Closed`, and later ones always do.
    pub async fn shutdown(&self) {
        if let Err(e) = self.multiplexer.shutdown().await {
            warn!(error = %e, "failed to close notification connection");
        }
        if let Err(e) = self.commands.quit().await {
            warn!(error = %e, "failed to close command connection");
        }
        info!("presence shut down");
    }
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("multiplexer", &self.multiplexer)
            .finish()
    }
}
