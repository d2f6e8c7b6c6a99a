//! In-memory store backend
//!
//! Single-process only. Several connections opened on the same
//! [`MemoryStore`] share its keyspace and channels, which is how nodes share
//! one Redis. Ideal for development, single-instance deployments and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{PresenceError, Result};
use crate::store::{Commands, Listeners, MessageHandler, Subscriber};

type Delivery = (String, Vec<u8>);

/// A value stored under a key
#[derive(Debug, Clone)]
enum Entry {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Str { expires_at: Some(at), .. } if *at <= now)
    }
}

#[derive(Default)]
struct Inner {
    /// Keyspace; one lock so every command is atomic, as in Redis
    keys: Mutex<HashMap<String, Entry>>,
    /// channel -> (subscriber id -> delivery sender)
    channels: DashMap<String, HashMap<u64, mpsc::UnboundedSender<Delivery>>>,
    next_subscriber: AtomicU64,
}

/// Shared in-memory keyspace and channel registry
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a command connection on this store
    pub fn commands(&self) -> MemoryCommands {
        MemoryCommands {
            store: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a notification connection on this store
    pub fn subscriber(&self) -> MemorySubscriber {
        MemorySubscriber::new(self.clone())
    }

    /// Run `f` on the keyspace after dropping whichever of `touched` expired
    ///
    /// Expiry is lazy, as in Redis: a key outlives its TTL in memory until a
    /// command touches it.
    fn with_keys<R>(
        &self,
        touched: &[&str],
        f: impl FnOnce(&mut HashMap<String, Entry>) -> R,
    ) -> R {
        let mut keys = self.inner.keys.lock();
        let now = Instant::now();
        for key in touched {
            if keys.get(*key).is_some_and(|entry| entry.is_expired(now)) {
                keys.remove(*key);
            }
        }
        f(&mut keys)
    }

    fn publish(&self, channel: &str, payload: &str) -> usize {
        let Some(subscribers) = self.inner.channels.get(channel) else {
            return 0;
        };
        subscribers
            .values()
            .filter(|tx| tx.send((channel.to_string(), payload.as_bytes().to_vec())).is_ok())
            .count()
    }

    /// Subscribed channels matching `pattern`
    ///
    /// Understands `*` alone and literal names with `\`-escaped
    /// metacharacters. Other globs are rejected instead of matched loosely.
    fn active_channels(&self, pattern: &str) -> Result<Vec<String>> {
        if pattern == "*" {
            return Ok(self
                .inner
                .channels
                .iter()
                .filter(|entry| !entry.value().is_empty())
                .map(|entry| entry.key().clone())
                .collect());
        }

        let name = literal_name(pattern)
            .ok_or_else(|| PresenceError::UnsupportedPattern(pattern.to_string()))?;
        let active = self
            .inner
            .channels
            .get(name.as_str())
            .is_some_and(|subscribers| !subscribers.is_empty());
        Ok(if active { vec![name] } else { Vec::new() })
    }

    fn attach(&self, channel: &str, id: u64, tx: mpsc::UnboundedSender<Delivery>) {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
    }

    fn detach(&self, channel: &str, id: u64) {
        if let Some(mut subscribers) = self.inner.channels.get_mut(channel) {
            subscribers.remove(&id);
        }
        self.inner
            .channels
            .remove_if(channel, |_, subscribers| subscribers.is_empty());
    }

    fn detach_all(&self, id: u64) {
        for mut entry in self.inner.channels.iter_mut() {
            entry.value_mut().remove(&id);
        }
        self.inner.channels.retain(|_, subscribers| !subscribers.is_empty());
    }
}

/// Unescape a pattern that has no live glob metacharacters
fn literal_name(pattern: &str) -> Option<String> {
    let mut name = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => name.push(chars.next()?),
            '*' | '?' | '[' => return None,
            c => name.push(c),
        }
    }
    Some(name)
}

fn parse_int(value: &str) -> Result<i64> {
    value.parse().map_err(|_| PresenceError::NotInteger)
}

fn set_mut<'a>(keys: &'a mut HashMap<String, Entry>, key: &str) -> Result<&'a mut HashSet<String>> {
    match keys
        .entry(key.to_string())
        .or_insert_with(|| Entry::Set(HashSet::new()))
    {
        Entry::Set(members) => Ok(members),
        _ => Err(PresenceError::WrongType),
    }
}

fn hash_mut<'a>(
    keys: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    match keys
        .entry(key.to_string())
        .or_insert_with(|| Entry::Hash(HashMap::new()))
    {
        Entry::Hash(fields) => Ok(fields),
        _ => Err(PresenceError::WrongType),
    }
}

fn set_ref<'a>(keys: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a HashSet<String>>> {
    match keys.get(key) {
        None => Ok(None),
        Some(Entry::Set(members)) => Ok(Some(members)),
        Some(_) => Err(PresenceError::WrongType),
    }
}

fn hash_ref<'a>(
    keys: &'a HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a HashMap<String, String>>> {
    match keys.get(key) {
        None => Ok(None),
        Some(Entry::Hash(fields)) => Ok(Some(fields)),
        Some(_) => Err(PresenceError::WrongType),
    }
}

/// Remove a set or hash that became empty
fn prune(keys: &mut HashMap<String, Entry>, key: &str) {
    let empty = match keys.get(key) {
        Some(Entry::Set(members)) => members.is_empty(),
        Some(Entry::Hash(fields)) => fields.is_empty(),
        _ => false,
    };
    if empty {
        keys.remove(key);
    }
}

fn add_to_counter(keys: &mut HashMap<String, Entry>, key: &str, delta: i64) -> Result<i64> {
    let entry = keys.entry(key.to_string()).or_insert_with(|| Entry::Str {
        value: "0".to_string(),
        expires_at: None,
    });
    match entry {
        Entry::Str { value, .. } => {
            let next = parse_int(value)?
                .checked_add(delta)
                .ok_or(PresenceError::NotInteger)?;
            *value = next.to_string();
            Ok(next)
        }
        _ => Err(PresenceError::WrongType),
    }
}

/// Command connection on a [`MemoryStore`]
pub struct MemoryCommands {
    store: MemoryStore,
    closed: AtomicBool,
}

impl MemoryCommands {
    fn store(&self) -> Result<&MemoryStore> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PresenceError::Closed);
        }
        Ok(&self.store)
    }
}

#[async_trait]
impl Commands for MemoryCommands {
    async fn setex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        let store = self.store()?;
        let expires_at = (seconds > 0)
            .then(|| Instant::now().checked_add(Duration::from_secs(seconds)))
            .flatten()
            .ok_or(PresenceError::InvalidExpire(seconds))?;
        store.with_keys(&[key], |keys| {
            keys.insert(
                key.to_string(),
                Entry::Str {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.store()?.with_keys(&[key], |keys| match keys.get(key) {
            None => Ok(None),
            Some(Entry::Str { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(PresenceError::WrongType),
        })
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.store()?.with_keys(&[key], |keys| {
            keys.remove(key);
        });
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.store()?.with_keys(&[key], |keys| {
            set_mut(keys, key)?.insert(member.to_string());
            Ok(())
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.store()?.with_keys(&[key], |keys| {
            if set_ref(keys, key)?.is_none() {
                return Ok(());
            }
            set_mut(keys, key)?.remove(member);
            prune(keys, key);
            Ok(())
        })
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        self.store()?
            .with_keys(&[key], |keys| Ok(set_ref(keys, key)?.cloned().unwrap_or_default()))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.store()?.with_keys(&[key], |keys| {
            Ok(set_ref(keys, key)?.is_some_and(|members| members.contains(member)))
        })
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.store()?
            .with_keys(&[key], |keys| Ok(set_ref(keys, key)?.map_or(0, HashSet::len)))
    }

    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>> {
        self.store()?.with_keys(keys, |entries| {
            let mut sets = Vec::with_capacity(keys.len());
            for key in keys {
                match set_ref(entries, key)? {
                    Some(members) => sets.push(members),
                    // A missing key is an empty set, so the intersection is empty
                    None => return Ok(HashSet::new()),
                }
            }
            let Some((first, rest)) = sets.split_first() else {
                return Ok(HashSet::new());
            };
            Ok(first
                .iter()
                .filter(|member| rest.iter().all(|set| set.contains(*member)))
                .cloned()
                .collect())
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.store()?.with_keys(&[key], |keys| {
            hash_mut(keys, key)?.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.store()?.with_keys(&[key], |keys| {
            Ok(hash_ref(keys, key)?.and_then(|fields| fields.get(field).cloned()))
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.store()?
            .with_keys(&[key], |keys| Ok(hash_ref(keys, key)?.cloned().unwrap_or_default()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.store()?.with_keys(&[key], |keys| {
            if hash_ref(keys, key)?.is_none() {
                return Ok(());
            }
            hash_mut(keys, key)?.remove(field);
            prune(keys, key);
            Ok(())
        })
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        self.store()?
            .with_keys(&[key], |keys| Ok(hash_ref(keys, key)?.map_or(0, HashMap::len)))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.store()?.with_keys(&[key], |keys| {
            let fields = hash_mut(keys, key)?;
            let current = fields.get(field).map(|v| parse_int(v)).transpose()?;
            let next = current
                .unwrap_or(0)
                .checked_add(delta)
                .ok_or(PresenceError::NotInteger)?;
            fields.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.store()?.with_keys(&[key], |keys| add_to_counter(keys, key, 1))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.store()?.with_keys(&[key], |keys| add_to_counter(keys, key, -1))
    }

    async fn channels(&self, pattern: &str) -> Result<Vec<String>> {
        self.store()?.active_channels(pattern)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let receivers = self.store()?.publish(channel, payload);
        trace!(channel, receivers, "memory publish");
        Ok(receivers)
    }

    async fn quit(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Notification connection on a [`MemoryStore`]
///
/// Deliveries are queued per connection and handed to listeners by a reader
/// task, one at a time.
pub struct MemorySubscriber {
    store: MemoryStore,
    id: u64,
    delivery_tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    listeners: Arc<Listeners>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySubscriber {
    fn new(store: MemoryStore) -> Self {
        let id = store.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<Delivery>();
        let listeners = Arc::new(Listeners::default());

        let reader = listeners.clone();
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = delivery_rx.recv().await {
                reader.deliver(&channel, &payload);
            }
        });

        Self {
            store,
            id,
            delivery_tx: Mutex::new(Some(delivery_tx)),
            listeners,
            task: Mutex::new(Some(task)),
        }
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Delivery>> {
        self.delivery_tx.lock().clone().ok_or(PresenceError::Closed)
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        let tx = self.sender()?;
        self.store.attach(channel, self.id, tx);
        debug!(channel, subscriber = self.id, "memory subscribe");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.sender()?;
        self.store.detach(channel, self.id);
        debug!(channel, subscriber = self.id, "memory unsubscribe");
        Ok(())
    }

    fn add_listener(&self, handler: MessageHandler) {
        self.listeners.add(handler);
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn quit(&self) -> Result<()> {
        self.delivery_tx.lock().take();
        self.store.detach_all(self.id);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.store.detach_all(self.id);
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::escape_pattern;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_setex_expires() {
        tokio::time::pause();
        let commands = MemoryStore::new().commands();

        commands.setex("room:1:owner", "node-a", 10).await.unwrap();
        assert_eq!(
            commands.get("room:1:owner").await.unwrap().as_deref(),
            Some("node-a")
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(commands.get("room:1:owner").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_setex_rejects_invalid_ttl() {
        let commands = MemoryStore::new().commands();

        assert!(matches!(
            commands.setex("k", "v", 0).await,
            Err(PresenceError::InvalidExpire(0))
        ));
        assert!(matches!(
            commands.setex("k", "v", u64::MAX).await,
            Err(PresenceError::InvalidExpire(u64::MAX))
        ));
        assert_eq!(commands.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_key_is_dropped_when_written() {
        tokio::time::pause();
        let commands = MemoryStore::new().commands();

        commands.setex("room:1", "owner", 1).await.unwrap();
        commands.setex("room:2", "owner", 60).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // The expired string no longer blocks a set under the same key
        commands.sadd("room:1", "alice").await.unwrap();
        assert_eq!(commands.scard("room:1").await.unwrap(), 1);
        assert_eq!(commands.get("room:2").await.unwrap().as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn test_empty_set_is_removed() {
        let commands = MemoryStore::new().commands();

        commands.sadd("rooms", "lobby").await.unwrap();
        commands.srem("rooms", "lobby").await.unwrap();

        // The key is gone, so a string command on it works again
        commands.setex("rooms", "x", 60).await.unwrap();
        assert_eq!(commands.get("rooms").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let commands = MemoryStore::new().commands();

        commands.hset("room:1", "clients", "2").await.unwrap();
        assert!(matches!(
            commands.sadd("room:1", "x").await,
            Err(PresenceError::WrongType)
        ));
        assert!(matches!(
            commands.get("room:1").await,
            Err(PresenceError::WrongType)
        ));
    }

    #[tokio::test]
    async fn test_incr_requires_integer() {
        let commands = MemoryStore::new().commands();

        commands.setex("name", "lobby", 60).await.unwrap();
        assert!(matches!(
            commands.incr("name").await,
            Err(PresenceError::NotInteger)
        ));

        commands.hset("room:1", "title", "lobby").await.unwrap();
        assert!(matches!(
            commands.hincrby("room:1", "title", 1).await,
            Err(PresenceError::NotInteger)
        ));
    }

    #[tokio::test]
    async fn test_counters_start_at_zero() {
        let commands = MemoryStore::new().commands();

        assert_eq!(commands.decr("clients").await.unwrap(), -1);
        assert_eq!(commands.incr("clients").await.unwrap(), 0);
        assert_eq!(commands.incr("clients").await.unwrap(), 1);
        assert_eq!(commands.get("clients").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_publish_counts_receivers() {
        let store = MemoryStore::new();
        let commands = store.commands();
        let first = store.subscriber();
        let second = store.subscriber();

        first.subscribe("lobby").await.unwrap();
        second.subscribe("lobby").await.unwrap();
        assert_eq!(commands.publish("lobby", "1").await.unwrap(), 2);

        second.unsubscribe("lobby").await.unwrap();
        assert_eq!(commands.publish("lobby", "1").await.unwrap(), 1);

        first.quit().await.unwrap();
        assert_eq!(commands.publish("lobby", "1").await.unwrap(), 0);
        assert!(commands.channels("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_channel_patterns() {
        let store = MemoryStore::new();
        let commands = store.commands();
        let subscriber = store.subscriber();

        subscriber.subscribe("room:*").await.unwrap();
        subscriber.subscribe("room:1").await.unwrap();

        let mut all = commands.channels("*").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["room:*", "room:1"]);
        assert_eq!(
            commands.channels(&escape_pattern("room:*")).await.unwrap(),
            vec!["room:*"]
        );
        assert!(commands.channels("room:2").await.unwrap().is_empty());
        assert!(matches!(
            commands.channels("room:?").await,
            Err(PresenceError::UnsupportedPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_receives_deliveries() {
        let store = MemoryStore::new();
        let commands = store.commands();
        let subscriber = store.subscriber();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        subscriber.add_listener(Arc::new(move |channel: &str, payload: &[u8]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((channel.to_string(), payload.to_vec()));
        }));
        subscriber.subscribe("lobby").await.unwrap();

        commands.publish("lobby", "\"hello\"").await.unwrap();
        commands.publish("elsewhere", "\"ignored\"").await.unwrap();

        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "lobby");
        assert_eq!(payload, b"\"hello\"");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quit_closes_connections() {
        let store = MemoryStore::new();
        let commands = store.commands();
        let subscriber = store.subscriber();

        commands.quit().await.unwrap();
        subscriber.quit().await.unwrap();

        assert!(matches!(commands.get("k").await, Err(PresenceError::Closed)));
        assert!(matches!(
            subscriber.subscribe("lobby").await,
            Err(PresenceError::Closed)
        ));
    }
}
