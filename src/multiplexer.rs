//! Subscription multiplexer
//!
//! Many logical subscribers share one notification connection. Each topic
//! keeps an ordered callback list; the store-side subscription for a topic
//! exists exactly while that list is non-empty. A single message handler is
//! attached to the connection the first time anything subscribes and stays
//! attached for the connection's lifetime, even when no topic is subscribed,
//! so a late message for a just-removed topic finds the handler and is dropped
//! there.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::envelope;
use crate::error::{PresenceError, Result};
use crate::store::Subscriber;

/// Error a callback may return; it is logged and does not affect other callbacks
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type CallbackFn = dyn Fn(&Value) -> std::result::Result<(), CallbackError> + Send + Sync;

/// A topic callback
///
/// Callbacks are compared by identity: clones of one `Callback` are equal,
/// two callbacks built from identical closures are not. Keep the value
/// returned by `subscribe` to remove exactly that registration later.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    /// Wrap an infallible callback
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self(Arc::new(move |message: &Value| {
            f(message);
            Ok(())
        }))
    }

    /// Wrap a callback that may fail
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Whether both handles refer to the same registration
    pub fn same(&self, other: &Callback) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }

    fn call(&self, message: &Value) -> std::result::Result<(), CallbackError> {
        (self.0)(message)
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

type Table = Mutex<HashMap<String, Vec<Callback>>>;

/// Fans messages from one notification connection out to per-topic callbacks
pub struct Multiplexer {
    subscriber: Arc<dyn Subscriber>,
    /// topic -> callbacks in registration order; never holds an empty list
    topics: Arc<Table>,
    /// Serializes subscribe/unsubscribe so store-side transitions follow the table
    transitions: tokio::sync::Mutex<()>,
    handler_attached: AtomicBool,
}

impl Multiplexer {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            topics: Arc::new(Mutex::new(HashMap::new())),
            transitions: tokio::sync::Mutex::new(()),
            handler_attached: AtomicBool::new(false),
        }
    }

    /// Register `callback` for `topic`
    ///
    /// The first callback of a topic subscribes the connection and returns
    /// once the store acknowledged it. If that fails the registration is
    /// undone and the error returned.
    pub async fn subscribe(&self, topic: &str, callback: Callback) -> Result<Callback> {
        let _transition = self.transitions.lock().await;
        self.attach_handler();

        let first = {
            let mut topics = self.topics.lock();
            let callbacks = topics.entry(topic.to_string()).or_default();
            callbacks.push(callback.clone());
            callbacks.len() == 1
        };

        if first {
            if let Err(e) = self.subscriber.subscribe(topic).await {
                self.topics.lock().remove(topic);
                warn!(topic, error = %e, "subscribe failed");
                return Err(e);
            }
            debug!(topic, "subscribed");
        } else {
            trace!(topic, "callback added to active topic");
        }

        Ok(callback)
    }

    /// Remove one callback (first matching registration) or, with `None`,
    /// every callback of `topic`
    ///
    /// Unknown topics and callbacks are ignored. Removing the last callback
    /// unsubscribes the connection from the topic. If the store rejects that,
    /// the callbacks are put back and the error returned, mirroring
    /// `subscribe`. A closed connection holds no subscriptions, so after
    /// `PresenceError::Closed` they stay removed.
    pub async fn unsubscribe(&self, topic: &str, callback: Option<&Callback>) -> Result<()> {
        let _transition = self.transitions.lock().await;

        let removed = {
            let mut topics = self.topics.lock();
            let Some(callbacks) = topics.get_mut(topic) else {
                return Ok(());
            };
            let emptying = match callback {
                None => true,
                Some(callback) => callbacks.len() == 1 && callbacks[0].same(callback),
            };
            if !emptying {
                if let Some(callback) = callback
                    && let Some(pos) = callbacks.iter().position(|c| c.same(callback))
                {
                    callbacks.remove(pos);
                }
                return Ok(());
            }
            topics.remove(topic).unwrap_or_default()
        };

        if let Err(e) = self.subscriber.unsubscribe(topic).await {
            if !matches!(e, PresenceError::Closed) {
                self.topics.lock().insert(topic.to_string(), removed);
            }
            warn!(topic, error = %e, "unsubscribe failed");
            return Err(e);
        }
        debug!(topic, "unsubscribed");

        Ok(())
    }

    /// Topics that currently have callbacks
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    /// Number of callbacks registered for `topic`
    pub fn callback_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    /// Close the notification connection and forget every callback
    pub async fn shutdown(&self) -> Result<()> {
        let dropped = {
            let mut topics = self.topics.lock();
            let count = topics.len();
            topics.clear();
            count
        };
        debug!(topics = dropped, "multiplexer shutting down");
        self.subscriber.quit().await
    }

    fn attach_handler(&self) {
        if self.handler_attached.swap(true, Ordering::AcqRel) {
            return;
        }
        let topics = self.topics.clone();
        self.subscriber
            .add_listener(Arc::new(move |topic: &str, raw: &[u8]| {
                dispatch(&topics, topic, raw);
            }));
        debug!("message handler attached");
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("topics", &self.topics.lock().len())
            .field("handler_attached", &self.handler_attached.load(Ordering::Relaxed))
            .finish()
    }
}

/// Deliver one message to every callback of its topic, in order
///
/// Callbacks run against a snapshot of the list, so registrations changing
/// meanwhile do not disturb this round. Failures stay inside this function.
fn dispatch(topics: &Table, topic: &str, raw: &[u8]) {
    let callbacks = match topics.lock().get(topic) {
        Some(callbacks) => callbacks.clone(),
        None => {
            trace!(topic, "no callbacks, message dropped");
            return;
        }
    };

    let message = match envelope::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            warn!(topic, error = %e, "dropping undecodable message");
            return;
        }
    };

    for (index, callback) in callbacks.iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| callback.call(&message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(topic, index, error = %e, "callback failed"),
            Err(_) => error!(topic, index, "callback panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MessageHandler;
    use async_trait::async_trait;

    /// Records store-side calls and lets tests push messages directly
    #[derive(Default)]
    struct RecordingSubscriber {
        calls: Mutex<Vec<String>>,
        listeners: Mutex<Vec<MessageHandler>>,
        fail_subscribe: AtomicBool,
        fail_unsubscribe: AtomicBool,
    }

    impl RecordingSubscriber {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn push(&self, topic: &str, raw: &str) {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener(topic, raw.as_bytes());
            }
        }
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn subscribe(&self, channel: &str) -> Result<()> {
            // Round trip; lets a concurrent transition run in between
            tokio::task::yield_now().await;
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(PresenceError::Closed);
            }
            self.calls.lock().push(format!("subscribe {channel}"));
            Ok(())
        }

        async fn unsubscribe(&self, channel: &str) -> Result<()> {
            tokio::task::yield_now().await;
            if self.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(PresenceError::WrongType);
            }
            self.calls.lock().push(format!("unsubscribe {channel}"));
            Ok(())
        }

        fn add_listener(&self, handler: MessageHandler) {
            self.listeners.lock().push(handler);
        }

        fn listener_count(&self) -> usize {
            self.listeners.lock().len()
        }

        async fn quit(&self) -> Result<()> {
            self.calls.lock().push("quit".to_string());
            Ok(())
        }
    }

    fn setup() -> (Arc<RecordingSubscriber>, Multiplexer) {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let multiplexer = Multiplexer::new(subscriber.clone());
        (subscriber, multiplexer)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback {
        let log = log.clone();
        Callback::new(move |message| log.lock().push(format!("{tag}:{message}")))
    }

    #[tokio::test]
    async fn test_single_physical_subscribe_per_topic() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = multiplexer.subscribe("lobby", recorder(&log, "a")).await.unwrap();
        let b = multiplexer.subscribe("lobby", recorder(&log, "b")).await.unwrap();
        multiplexer.subscribe("room:7", recorder(&log, "c")).await.unwrap();
        assert_eq!(subscriber.calls(), vec!["subscribe lobby", "subscribe room:7"]);

        multiplexer.unsubscribe("lobby", Some(&a)).await.unwrap();
        assert_eq!(subscriber.calls().len(), 2);

        multiplexer.unsubscribe("lobby", Some(&b)).await.unwrap();
        assert_eq!(subscriber.calls().last().unwrap(), "unsubscribe lobby");
        assert_eq!(multiplexer.topics(), vec!["room:7".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_attached_once() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        for topic in ["a", "b", "c"] {
            multiplexer.subscribe(topic, recorder(&log, "x")).await.unwrap();
            multiplexer.unsubscribe(topic, None).await.unwrap();
        }
        multiplexer.subscribe("a", recorder(&log, "x")).await.unwrap();

        assert_eq!(subscriber.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer.subscribe("lobby", recorder(&log, "first")).await.unwrap();
        multiplexer.subscribe("lobby", recorder(&log, "second")).await.unwrap();
        subscriber.push("lobby", r#"{"n":1}"#);

        assert_eq!(*log.lock(), vec![r#"first:{"n":1}"#, r#"second:{"n":1}"#]);
    }

    #[tokio::test]
    async fn test_remove_by_identity_first_match_only() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = recorder(&log, "dup");

        multiplexer.subscribe("lobby", callback.clone()).await.unwrap();
        multiplexer.subscribe("lobby", callback.clone()).await.unwrap();
        multiplexer.unsubscribe("lobby", Some(&callback)).await.unwrap();
        assert_eq!(multiplexer.callback_count("lobby"), 1);

        subscriber.push("lobby", "1");
        assert_eq!(*log.lock(), vec!["dup:1"]);
    }

    #[tokio::test]
    async fn test_unknown_callback_is_ignored() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer.subscribe("lobby", recorder(&log, "kept")).await.unwrap();
        let stranger = recorder(&log, "stranger");
        multiplexer.unsubscribe("lobby", Some(&stranger)).await.unwrap();
        multiplexer.unsubscribe("nowhere", None).await.unwrap();

        assert_eq!(multiplexer.callback_count("lobby"), 1);
        assert_eq!(subscriber.calls(), vec!["subscribe lobby"]);
    }

    #[tokio::test]
    async fn test_failing_callbacks_are_isolated() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer
            .subscribe("lobby", Callback::fallible(|_| Err("boom".into())))
            .await
            .unwrap();
        multiplexer
            .subscribe("lobby", Callback::new(|_| panic!("callback panic")))
            .await
            .unwrap();
        multiplexer.subscribe("lobby", recorder(&log, "ok")).await.unwrap();

        subscriber.push("lobby", "true");
        subscriber.push("lobby", "2");
        assert_eq!(*log.lock(), vec!["ok:true", "ok:2"]);
    }

    #[tokio::test]
    async fn test_undecodable_message_does_not_stop_dispatch() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer.subscribe("lobby", recorder(&log, "a")).await.unwrap();
        subscriber.push("lobby", "{broken");
        subscriber.push("lobby", r#""fine""#);

        assert_eq!(*log.lock(), vec![r#"a:"fine""#]);
    }

    #[tokio::test]
    async fn test_message_after_unsubscribe_is_dropped() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer.subscribe("lobby", recorder(&log, "a")).await.unwrap();
        multiplexer.unsubscribe("lobby", None).await.unwrap();
        subscriber.push("lobby", "1");

        assert!(log.lock().is_empty());
        assert_eq!(subscriber.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back() {
        let (subscriber, multiplexer) = setup();
        subscriber.fail_subscribe.store(true, Ordering::SeqCst);

        let result = multiplexer.subscribe("lobby", Callback::new(|_| {})).await;
        assert!(matches!(result, Err(PresenceError::Closed)));
        assert!(multiplexer.topics().is_empty());

        subscriber.fail_subscribe.store(false, Ordering::SeqCst);
        multiplexer.subscribe("lobby", Callback::new(|_| {})).await.unwrap();
        assert_eq!(subscriber.calls(), vec!["subscribe lobby"]);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_restores_callbacks() {
        let (subscriber, multiplexer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));

        multiplexer.subscribe("lobby", recorder(&log, "a")).await.unwrap();
        multiplexer.subscribe("lobby", recorder(&log, "b")).await.unwrap();
        subscriber.fail_unsubscribe.store(true, Ordering::SeqCst);

        let result = multiplexer.unsubscribe("lobby", None).await;
        assert!(matches!(result, Err(PresenceError::WrongType)));
        assert_eq!(multiplexer.callback_count("lobby"), 2);

        subscriber.push("lobby", "1");
        assert_eq!(*log.lock(), vec!["a:1", "b:1"]);

        subscriber.fail_unsubscribe.store(false, Ordering::SeqCst);
        multiplexer.unsubscribe("lobby", None).await.unwrap();
        assert_eq!(subscriber.calls(), vec!["subscribe lobby", "unsubscribe lobby"]);
    }

    /// The table has `topic` exactly when the store-side calls leave it subscribed
    fn assert_consistent(
        subscriber: &RecordingSubscriber,
        multiplexer: &Multiplexer,
        topic: &str,
    ) {
        let calls = subscriber.calls();
        let expected: &[&str] = if multiplexer.callback_count(topic) > 0 {
            &["subscribe t"]
        } else {
            &["subscribe t", "unsubscribe t"]
        };
        assert!(
            calls.is_empty() || calls == expected,
            "calls {calls:?} disagree with {} callbacks",
            multiplexer.callback_count(topic)
        );
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_unsubscribe_stay_ordered() {
        let (subscriber, multiplexer) = setup();
        let (subscribed, unsubscribed) = tokio::join!(
            multiplexer.subscribe("t", Callback::new(|_| {})),
            multiplexer.unsubscribe("t", None),
        );
        subscribed.unwrap();
        unsubscribed.unwrap();
        assert_eq!(subscriber.calls(), vec!["subscribe t", "unsubscribe t"]);
        assert!(multiplexer.topics().is_empty());
        assert_consistent(&subscriber, &multiplexer, "t");

        let (subscriber, multiplexer) = setup();
        let (unsubscribed, subscribed) = tokio::join!(
            multiplexer.unsubscribe("t", None),
            multiplexer.subscribe("t", Callback::new(|_| {})),
        );
        subscribed.unwrap();
        unsubscribed.unwrap();
        assert_consistent(&subscriber, &multiplexer, "t");
    }

    #[tokio::test]
    async fn test_shutdown_forgets_callbacks() {
        let (subscriber, multiplexer) = setup();

        multiplexer.subscribe("lobby", Callback::new(|_| {})).await.unwrap();
        multiplexer.shutdown().await.unwrap();

        assert!(multiplexer.topics().is_empty());
        assert_eq!(subscriber.calls().last().unwrap(), "quit");
    }

    #[test]
    fn test_callback_identity() {
        let a = Callback::new(|_| {});
        let b = Callback::new(|_| {});
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
