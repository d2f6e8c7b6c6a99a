//! Redis store backend
//!
//! Commands go through a multiplexed connection. Notifications use a dedicated
//! pub/sub connection owned by a reader task; subscribe and unsubscribe
//! requests are routed to that task so the connection has a single owner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{Client, Msg, RedisResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PresenceError, Result};
use crate::store::{Commands, Listeners, MessageHandler, Subscriber};

/// Command connection backed by a Redis multiplexed connection
pub struct RedisCommands {
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisCommands {
    /// Open the command connection
    pub async fn connect(client: &Client) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("redis command connection established");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Clone the connection handle, failing once `quit` ran
    fn conn(&self) -> Result<MultiplexedConnection> {
        self.conn.lock().clone().ok_or(PresenceError::Closed)
    }
}

#[async_trait]
impl Commands for RedisCommands {
    async fn setex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("SETEX")
            .arg(key)
            .arg(seconds)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>> {
        let mut conn = self.conn()?;
        let members: HashSet<String> = ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let is_member: bool = ::redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(is_member)
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let count: usize = ::redis::cmd("SCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn sinter(&self, keys: &[&str]) -> Result<HashSet<String>> {
        let mut conn = self.conn()?;
        let members: HashSet<String> = ::redis::cmd("SINTER")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let value: Option<String> = ::redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn()?;
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(fields)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let _: () = ::redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let count: usize = ::redis::cmd("HLEN").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn()?;
        let value: i64 = ::redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let value: i64 = ::redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn()?;
        let value: i64 = ::redis::cmd("DECR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn channels(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let channels: Vec<String> = ::redis::cmd("PUBSUB")
            .arg("CHANNELS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;
        Ok(channels)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let receivers: usize = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn quit(&self) -> Result<()> {
        // In-flight commands hold their own handle and finish (or fail) on their own
        if self.conn.lock().take().is_some() {
            debug!("redis command connection closed");
        }
        Ok(())
    }
}

/// Requests routed to the task owning the pub/sub connection
enum Control {
    Subscribe(String, oneshot::Sender<RedisResult<()>>),
    Unsubscribe(String, oneshot::Sender<RedisResult<()>>),
}

enum Event {
    Message(Option<Msg>),
    Control(Option<Control>),
}

/// Notification connection backed by a Redis pub/sub connection
pub struct RedisSubscriber {
    control: Mutex<Option<mpsc::UnboundedSender<Control>>>,
    listeners: Arc<Listeners>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisSubscriber {
    /// Open the pub/sub connection and start its reader task
    pub async fn connect(client: &Client) -> Result<Self> {
        let pubsub = client.get_async_pubsub().await?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Listeners::default());

        let task = tokio::spawn(run_subscriber(pubsub, control_rx, listeners.clone()));
        debug!("redis notification connection established");

        Ok(Self {
            control: Mutex::new(Some(control_tx)),
            listeners,
            task: Mutex::new(Some(task)),
        })
    }

    async fn request(
        &self,
        control: impl FnOnce(oneshot::Sender<RedisResult<()>>) -> Control,
    ) -> Result<()> {
        let sender = self.control.lock().clone().ok_or(PresenceError::Closed)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(control(ack_tx))
            .map_err(|_| PresenceError::Closed)?;
        ack_rx.await.map_err(|_| PresenceError::Closed)??;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channel: &str) -> Result<()> {
        self.request(|ack| Control::Subscribe(channel.to_string(), ack))
            .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.request(|ack| Control::Unsubscribe(channel.to_string(), ack))
            .await
    }

    fn add_listener(&self, handler: MessageHandler) {
        self.listeners.add(handler);
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn quit(&self) -> Result<()> {
        // Dropping the sender fails new requests; aborting the task drops the
        // connection and fails requests still waiting for an ack.
        self.control.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("redis notification connection closed");
        }
        Ok(())
    }
}

impl Drop for RedisSubscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reader loop: delivers pushed messages and applies subscription changes
async fn run_subscriber(
    mut pubsub: PubSub,
    mut control: mpsc::UnboundedReceiver<Control>,
    listeners: Arc<Listeners>,
) {
    loop {
        let event = {
            let mut messages = std::pin::pin!(pubsub.on_message());
            tokio::select! {
                msg = messages.next() => Event::Message(msg),
                ctl = control.recv() => Event::Control(ctl),
            }
        };

        match event {
            Event::Message(Some(msg)) => {
                listeners.deliver(msg.get_channel_name(), msg.get_payload_bytes());
            }
            Event::Message(None) => {
                warn!("redis notification connection closed by server");
                break;
            }
            Event::Control(Some(Control::Subscribe(channel, ack))) => {
                let result = pubsub.subscribe(channel.as_str()).await;
                debug!(channel = %channel, ok = result.is_ok(), "redis subscribe");
                let _ = ack.send(result);
            }
            Event::Control(Some(Control::Unsubscribe(channel, ack))) => {
                let result = pubsub.unsubscribe(channel.as_str()).await;
                debug!(channel = %channel, ok = result.is_ok(), "redis unsubscribe");
                let _ = ack.send(result);
            }
            Event::Control(None) => break,
        }
    }
}
