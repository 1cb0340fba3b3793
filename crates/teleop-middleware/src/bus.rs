//! Typed, topic-based publish/subscribe bus.
//!
//! Every topic keeps only its most recent value (last-value-wins).  Two kinds
//! of subscription are offered:
//!
//! | Subscription | Delivery | Typical consumer |
//! |---|---|---|
//! | [`Subscription`] | latest value only, superseded values are skipped | operator pose input, diagnostics bridge |
//! | [`QueuedSubscription`] / [`MergedSubscription`] | bounded queue, samples dropped when full | recorder |
//!
//! [`MessageBus::publish`] never blocks and never fails the caller: a full
//! queue drops the sample and bumps the topic's `dropped` counter.
//!
//! # Example
//!
//! ```rust
//! use teleop_middleware::bus::{MessageBus, Topic};
//!
//! let bus = MessageBus::new();
//! let topic: Topic<u32> = Topic::new("counter");
//! let sub = bus.subscribe(&topic).unwrap();
//!
//! bus.publish(&topic, 1);
//! bus.publish(&topic, 2);
//! assert_eq!(sub.latest().as_deref(), Some(&2));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::rpc::EndpointSlot;

/// Default capacity of queued subscriptions.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Topic handle
// ────────────────────────────────────────────────────────────────────────────

/// A named channel carrying values of type `T`.
///
/// Identity is `(name, T)`: once a name is bound to a type, subscribing with
/// another type fails with [`ChannelError::TypeMismatch`].
pub struct Topic<T> {
    name: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Envelope
// ────────────────────────────────────────────────────────────────────────────

type Payload = Arc<dyn Any + Send + Sync>;

/// A published value together with its routing metadata.
#[derive(Clone)]
pub struct Envelope {
    topic: Arc<str>,
    seq: u64,
    published_at: DateTime<Utc>,
    payload: Payload,
}

impl Envelope {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Per-topic publish counter, starting at 1.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Advisory wall-clock time of the publish call.
    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Decode the payload if this envelope belongs to `topic`.
    pub fn decode<T: Send + Sync + 'static>(&self, topic: &Topic<T>) -> Option<Arc<T>> {
        if self.topic.as_ref() != topic.name() {
            return None;
        }
        Arc::clone(&self.payload).downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("seq", &self.seq)
            .field("published_at", &self.published_at)
            .finish_non_exhaustive()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct TopicSlot {
    value_type: Option<(TypeId, &'static str)>,
    latest: watch::Sender<Option<Envelope>>,
    queues: Vec<mpsc::Sender<Envelope>>,
    published: u64,
    dropped: u64,
}

impl TopicSlot {
    fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            value_type: None,
            latest,
            queues: Vec::new(),
            published: 0,
            dropped: 0,
        }
    }

    fn bind<T: 'static>(&mut self, name: &str) -> Result<(), ChannelError> {
        let requested = (TypeId::of::<T>(), std::any::type_name::<T>());
        match self.value_type {
            None => {
                self.value_type = Some(requested);
                Ok(())
            }
            Some((id, _)) if id == requested.0 => Ok(()),
            Some((_, bound)) => Err(ChannelError::TypeMismatch {
                name: name.to_string(),
                bound: bound.to_string(),
                requested: requested.1.to_string(),
            }),
        }
    }

    fn attach_queue(&mut self, capacity: usize) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Some(current) = self.latest.borrow().clone() {
            let _ = tx.try_send(current);
        }
        self.queues.push(tx);
        rx
    }
}

#[derive(Default)]
pub(crate) struct BusInner {
    topics: Mutex<HashMap<String, TopicSlot>>,
    pub(crate) endpoints: Mutex<HashMap<String, EndpointSlot>>,
    directory: Mutex<HashMap<String, String>>,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot_for<'a>(topics: &'a mut HashMap<String, TopicSlot>, name: &str) -> &'a mut TopicSlot {
    topics.entry(name.to_string()).or_insert_with(TopicSlot::new)
}

/// Snapshot of one topic's counters, for discovery and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub value_type: Option<String>,
    pub published: u64,
    pub dropped: u64,
    pub latest_subscribers: usize,
    pub queued_subscribers: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// MessageBus
// ────────────────────────────────────────────────────────────────────────────

/// Shared message bus. Clone it cheaply – all clones share the same topics,
/// endpoints and directory.
#[derive(Clone, Default)]
pub struct MessageBus {
    pub(crate) inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &lock(&self.inner.topics).len())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` on `topic`.
    ///
    /// The value replaces the topic's latest value and is offered to every
    /// queued subscriber without waiting. Returns the number of subscribers
    /// the value was handed to; `0` is a normal condition.
    pub fn publish<T: Send + Sync + 'static>(&self, topic: &Topic<T>, value: T) -> usize {
        let mut topics = lock(&self.inner.topics);
        let slot = slot_for(&mut topics, topic.name());
        if let Err(e) = slot.bind::<T>(topic.name()) {
            warn!(topic = topic.name(), error = %e, "dropping sample of mismatched type");
            return 0;
        }

        slot.published += 1;
        let envelope = Envelope {
            topic: Arc::clone(&topic.name),
            seq: slot.published,
            published_at: Utc::now(),
            payload: Arc::new(value),
        };

        let mut delivered = slot.latest.receiver_count();
        let mut dropped = 0u64;
        slot.latest.send_replace(Some(envelope.clone()));
        slot.queues.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if dropped > 0 {
            slot.dropped += dropped;
            debug!(topic = topic.name(), dropped, "queued subscriber full; sample dropped");
        }
        delivered
    }

    /// Subscribe to the latest value of `topic`.
    ///
    /// The returned handle yields the value available right now (if any) and
    /// then every newer latest value; intermediate values published while the
    /// subscriber was busy are skipped.
    pub fn subscribe<T: Send + Sync + 'static>(
        &self,
        topic: &Topic<T>,
    ) -> Result<Subscription<T>, ChannelError> {
        let mut topics = lock(&self.inner.topics);
        let slot = slot_for(&mut topics, topic.name());
        slot.bind::<T>(topic.name())?;
        let mut rx = slot.latest.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        Ok(Subscription {
            topic: topic.clone(),
            rx,
        })
    }

    /// Subscribe to `topic` through a bounded queue of `capacity` samples,
    /// seeded with the current latest value.
    pub fn subscribe_queued<T: Send + Sync + 'static>(
        &self,
        topic: &Topic<T>,
        capacity: usize,
    ) -> Result<QueuedSubscription<T>, ChannelError> {
        let mut topics = lock(&self.inner.topics);
        let slot = slot_for(&mut topics, topic.name());
        slot.bind::<T>(topic.name())?;
        Ok(QueuedSubscription {
            topic: topic.clone(),
            rx: slot.attach_queue(capacity),
        })
    }

    /// Subscribe to several topics through one bounded queue.
    ///
    /// Envelopes arrive in publish order across all listed topics. Use
    /// [`Envelope::decode`] to recover typed values.
    pub fn subscribe_merged(&self, names: &[&str], capacity: usize) -> MergedSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut topics = lock(&self.inner.topics);
        for name in names {
            let slot = slot_for(&mut topics, name);
            if let Some(current) = slot.latest.borrow().clone() {
                let _ = tx.try_send(current);
            }
            slot.queues.push(tx.clone());
        }
        MergedSubscription {
            topics: names.iter().map(|n| n.to_string()).collect(),
            rx,
        }
    }

    /// Counters for every topic known to the bus, sorted by name.
    pub fn topics(&self) -> Vec<TopicInfo> {
        let topics = lock(&self.inner.topics);
        let mut infos: Vec<TopicInfo> = topics
            .iter()
            .map(|(name, slot)| TopicInfo {
                name: name.clone(),
                value_type: slot.value_type.map(|(_, n)| n.to_string()),
                published: slot.published,
                dropped: slot.dropped,
                latest_subscribers: slot.latest.receiver_count(),
                queued_subscribers: slot.queues.iter().filter(|q| !q.is_closed()).count(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // -----------------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------------

    /// Advertise `address` (e.g. `ws://127.0.0.1:9870`) under `name` so other
    /// components can discover it at configuration time.
    pub fn announce(&self, name: impl Into<String>, address: impl Into<String>) {
        lock(&self.inner.directory).insert(name.into(), address.into());
    }

    /// Remove a previously announced entry.
    pub fn withdraw(&self, name: &str) {
        lock(&self.inner.directory).remove(name);
    }

    /// Look up an announced address.
    pub fn resolve(&self, name: &str) -> Option<String> {
        lock(&self.inner.directory).get(name).cloned()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Latest-value subscription
// ────────────────────────────────────────────────────────────────────────────

/// Latest-value handle obtained from [`MessageBus::subscribe`].
pub struct Subscription<T> {
    topic: Topic<T>,
    rx: watch::Receiver<Option<Envelope>>,
}

impl<T: Send + Sync + 'static> Subscription<T> {
    pub fn topic(&self) -> &Topic<T> {
        &self.topic
    }

    /// Peek at the most recent value without marking it seen.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.rx.borrow().as_ref().and_then(|e| e.decode(&self.topic))
    }

    /// Return the latest value if it has not been returned before.
    /// Never blocks.
    pub fn try_next(&mut self) -> Option<Arc<T>> {
        match self.rx.has_changed() {
            Ok(true) => self
                .rx
                .borrow_and_update()
                .as_ref()
                .and_then(|e| e.decode(&self.topic)),
            _ => None,
        }
    }

    /// Wait for a value newer than the last one returned.
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            let value = self
                .rx
                .borrow_and_update()
                .as_ref()
                .and_then(|e| e.decode(&self.topic));
            if value.is_some() {
                return value;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queued subscriptions
// ────────────────────────────────────────────────────────────────────────────

/// Bounded-queue handle obtained from [`MessageBus::subscribe_queued`].
pub struct QueuedSubscription<T> {
    topic: Topic<T>,
    rx: mpsc::Receiver<Envelope>,
}

impl<T: Send + Sync + 'static> QueuedSubscription<T> {
    /// Wait for the next queued value. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        loop {
            let envelope = self.rx.recv().await?;
            if let Some(value) = envelope.decode(&self.topic) {
                return Some(value);
            }
        }
    }

    /// Pop the next queued value without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        while let Ok(envelope) = self.rx.try_recv() {
            if let Some(value) = envelope.decode(&self.topic) {
                return Some(value);
            }
        }
        None
    }
}

/// Multi-topic bounded-queue handle obtained from
/// [`MessageBus::subscribe_merged`].
pub struct MergedSubscription {
    topics: Vec<String>,
    rx: mpsc::Receiver<Envelope>,
}

impl MergedSubscription {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("pose/right_hand");
        assert_eq!(bus.publish(&topic, 1), 0);
        assert_eq!(bus.topics()[0].published, 1);
    }

    #[test]
    fn late_subscriber_sees_current_value() {
        let bus = MessageBus::new();
        let topic: Topic<String> = Topic::new("state/arm");
        bus.publish(&topic, "first".to_string());
        bus.publish(&topic, "second".to_string());

        let mut sub = bus.subscribe(&topic).unwrap();
        assert_eq!(sub.try_next().as_deref().map(String::as_str), Some("second"));
        // Nothing newer yet.
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn latest_value_wins_for_slow_subscriber() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("pose/left_hand");
        let mut sub = bus.subscribe(&topic).unwrap();
        for i in 0..100 {
            bus.publish(&topic, i);
        }
        assert_eq!(sub.try_next().as_deref(), Some(&99));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_newer_value() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("diagnostics/arm");
        let mut sub = bus.subscribe(&topic).unwrap();

        let publisher = bus.clone();
        let t = topic.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&t, 42);
        });

        let value = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("value must arrive");
        assert_eq!(value.as_deref(), Some(&42));
    }

    #[test]
    fn mismatched_type_is_rejected_on_subscribe_and_dropped_on_publish() {
        let bus = MessageBus::new();
        let as_u32: Topic<u32> = Topic::new("command/arm");
        let as_str: Topic<String> = Topic::new("command/arm");
        let _sub = bus.subscribe(&as_u32).unwrap();

        assert!(matches!(
            bus.subscribe(&as_str),
            Err(ChannelError::TypeMismatch { .. })
        ));
        assert_eq!(bus.publish(&as_str, "oops".to_string()), 0);
    }

    #[test]
    fn queued_subscription_drops_when_full_without_blocking() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("camera/wrist");
        let mut queued = bus.subscribe_queued(&topic, 4).unwrap();
        for i in 0..10 {
            bus.publish(&topic, i);
        }
        let mut seen = Vec::new();
        while let Some(v) = queued.try_recv() {
            seen.push(*v);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(bus.topics()[0].dropped, 6);
    }

    #[test]
    fn queued_subscription_is_seeded_with_latest() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("state/hand");
        bus.publish(&topic, 5);
        let mut queued = bus.subscribe_queued(&topic, 8).unwrap();
        assert_eq!(queued.try_recv().as_deref(), Some(&5));
    }

    #[test]
    fn merged_subscription_preserves_publish_order() {
        let bus = MessageBus::new();
        let commands: Topic<u64> = Topic::new("command/arm");
        let states: Topic<String> = Topic::new("state/arm");
        let mut merged = bus.subscribe_merged(&[commands.name(), states.name()], 16);

        bus.publish(&commands, 1);
        bus.publish(&states, "after-1".to_string());
        bus.publish(&commands, 2);

        let first = merged.try_recv().unwrap();
        assert_eq!(first.decode(&commands).as_deref(), Some(&1));
        assert!(first.decode(&states).is_none());
        let second = merged.try_recv().unwrap();
        assert_eq!(
            second.decode(&states).as_deref().map(String::as_str),
            Some("after-1")
        );
        let third = merged.try_recv().unwrap();
        assert_eq!(third.decode(&commands).as_deref(), Some(&2));
        assert_eq!(third.seq(), 2);
    }

    #[test]
    fn dropped_queue_is_released() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("pose/head");
        let queued = bus.subscribe_queued(&topic, 4).unwrap();
        drop(queued);
        bus.publish(&topic, 1);
        assert_eq!(bus.topics()[0].queued_subscribers, 0);
    }

    #[test]
    fn directory_announce_resolve_withdraw() {
        let bus = MessageBus::new();
        assert!(bus.resolve("diagnostics/ws").is_none());
        bus.announce("diagnostics/ws", "ws://127.0.0.1:9870");
        assert_eq!(bus.resolve("diagnostics/ws").as_deref(), Some("ws://127.0.0.1:9870"));
        bus.withdraw("diagnostics/ws");
        assert!(bus.resolve("diagnostics/ws").is_none());
    }
}
