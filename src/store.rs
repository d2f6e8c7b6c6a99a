//! Store connection abstraction
//!
//! A presence store is reached through two connections: one for commands
//! (reads, writes, publishes) and one for notifications. A connection that has
//! subscribed to channels cannot issue arbitrary commands, so the two are kept
//! apart and modeled by separate traits.
//!
//! # Features
//!
//! - `redis` - Redis backend for multi-node deployments
//! - `memory` - In-process backend for single-node deployments and tests

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use self::redis::{RedisCommands, RedisSubscriber};

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryCommands, MemoryStore, MemorySubscriber};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Handler for pushed messages: `(channel, raw payload)`
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Command connection
///
/// Every method is a single round trip. Failures are returned unchanged.
#[async_trait]
pub trait Commands: Send + Sync {
    /// Set `key` to `value`, expiring after `seconds`
    async fn setex(&self, key: &str, value: &str, seconds: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<HashSet<String>>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn scard(&self, key: &str) -> Result<usize>;

    /// Members present in every set. Callers must pass at least one key.
    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    /// Add `delta` to a hash field, treating a missing field as 0
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn decr(&self, key: &str) -> Result<i64>;

    /// Channels with at least one subscriber whose name matches a glob pattern
    ///
    /// The in-memory store only evaluates `*` and escaped literal names.
    async fn channels(&self, pattern: &str) -> Result<Vec<String>>;

    /// Publish a message, returning how many subscribers received it
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Close the connection. Later commands fail with `PresenceError::Closed`.
    async fn quit(&self) -> Result<()>;
}

/// Notification connection
///
/// Listeners are called one at a time, in the order messages arrive.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to a channel; resolves once the store acknowledged it
    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Attach a message listener. Listeners stay attached until `quit`.
    fn add_listener(&self, handler: MessageHandler);

    fn listener_count(&self) -> usize;

    /// Close the connection. Later subscribe calls fail with `PresenceError::Closed`.
    async fn quit(&self) -> Result<()>;
}

/// Listener list shared between a subscriber handle and its reader task
#[derive(Default)]
pub(crate) struct Listeners {
    handlers: RwLock<Vec<MessageHandler>>,
}

impl Listeners {
    pub(crate) fn add(&self, handler: MessageHandler) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub(crate) fn deliver(&self, channel: &str, payload: &[u8]) {
        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            handler(channel, payload);
        }
    }
}

/// Escape glob metacharacters so a pattern only matches `name` itself
pub fn escape_pattern(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
