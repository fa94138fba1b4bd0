//! # Event Bus
//!
//! Topic-keyed publish/subscribe hub. Every other component notifies and
//! observes through it.
//!
//! Guarantees:
//! - Per-topic FIFO per publisher: publishes fan out under one lock, and each
//!   subscriber is fed through an ordered channel.
//! - Publishing never blocks on subscriber processing; each subscriber has an
//!   unbounded queue, and a dropped receiver is pruned, never propagated to
//!   the publisher.
//! - Delivery is at-least-once per live subscriber; handlers de-duplicate via
//!   `Event::id` where it matters.

pub mod event;

pub use event::{topics, Event};

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// Subscription pattern: an exact topic, or a prefix with a trailing `*`
/// segment matching any remainder (`"a2a.response.*"`, `"*"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    prefix: String,
    wildcard: bool,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self {
                prefix: String::new(),
                wildcard: true,
            }
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self {
                prefix: format!("{prefix}."),
                wildcard: true,
            }
        } else {
            Self {
                prefix: pattern.to_string(),
                wildcard: false,
            }
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.wildcard {
            topic.starts_with(&self.prefix)
        } else {
            topic == self.prefix
        }
    }
}

/// Opaque handle identifying one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(u64);

struct SubscriberEntry {
    id: u64,
    pattern: TopicPattern,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

/// The pub/sub hub
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event. Fire-and-forget: returns once the payload is queued
    /// to every live matching subscriber.
    pub fn publish(&self, topic: &str, source_id: &str, payload: serde_json::Value) {
        let event = Event::new(topic, source_id, payload);
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.subscribers.retain(|sub| {
            if !sub.pattern.matches(topic) {
                return !sub.tx.is_closed();
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    // Receiver went away; isolate and drop the subscriber.
                    tracing::debug!(topic, sub_id = sub.id, "pruning dead subscriber");
                    false
                }
            }
        });
    }

    /// Serialize `payload` and publish it. Serialization failures are logged
    /// and swallowed, consistent with fire-and-forget semantics.
    pub fn publish_json<T: Serialize>(&self, topic: &str, source_id: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.publish(topic, source_id, value),
            Err(e) => tracing::error!(topic, error = %e, "failed to serialize event payload"),
        }
    }

    /// Subscribe to a topic pattern. The returned subscription is a lazy,
    /// unbounded sequence of events; drop it (or call [`unsubscribe`]) to
    /// stop receiving.
    ///
    /// [`unsubscribe`]: EventBus::unsubscribe
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(SubscriberEntry {
            id,
            pattern: TopicPattern::parse(pattern),
            tx,
        });
        Subscription {
            handle: SubscriptionHandle(id),
            rx,
        }
    }

    /// Remove a subscription by handle
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.subscribers.retain(|sub| sub.id != handle.0);
    }

    /// Number of live subscriptions (stale entries are pruned on publish)
    pub fn subscriber_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.subscribers.len(),
            Err(poisoned) => poisoned.into_inner().subscribers.len(),
        }
    }
}

/// One logical subscription: receives many events over its lifetime
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Await the next matching event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-queued event
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
