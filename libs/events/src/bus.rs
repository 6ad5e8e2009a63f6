//! In-process publish/subscribe bus.
//!
//! ```text
//! publish(topic, event) ──┬──> [ring 1] ──> Subscription 1 (vm.created, vm.deleted)
//!                         ├──> [ring 2] ──> Subscription 2 (vm.status.*)
//!                         └──> [ring 3] ──> Subscription 3 (all topics)
//! ```
//!
//! Every subscriber owns a bounded ring. Publishing never waits: when a ring
//! is full its oldest entry is dropped and the subscriber's next `recv`
//! returns [`BusError::Lagged`] before delivery resumes, so a slow consumer
//! is visibly degraded rather than silently starved.
//!
//! A subscription ends when its cancellation token fires, when it is
//! dropped, or when the bus is closed. After that `recv` returns `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{BusError, Event, EventEnvelope, EventError};

/// Ring size given to each subscriber by [`EventBus::new`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Which topics a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    /// Exact names, or prefixes written as `prefix.*`.
    Topics(Vec<String>),
}

impl TopicFilter {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topics(topics) => topics.iter().any(|t| match t.strip_suffix(".*") {
                Some(prefix) => topic
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.')),
                None => t == topic,
            }),
        }
    }
}

struct Ring {
    events: VecDeque<Arc<EventEnvelope>>,
    skipped: u64,
}

struct Subscriber {
    id: u64,
    filter: TopicFilter,
    ring: Mutex<Ring>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Subscriber {
    fn push(&self, envelope: Arc<EventEnvelope>, capacity: usize) {
        {
            let mut ring = self.ring.lock();
            if ring.events.len() >= capacity {
                ring.events.pop_front();
                ring.skipped += 1;
            }
            ring.events.push_back(envelope);
        }
        self.notify.notify_one();
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Bus whose subscribers each buffer at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish `event` on `topic` to every matching subscriber.
    pub fn publish(&self, topic: &str, event: Event) -> Result<(), EventError> {
        if topic.trim().is_empty() || topic.ends_with(".*") {
            return Err(EventError::InvalidTopic(topic.to_string()));
        }
        if self.inner.closed.load(Ordering::Acquire) {
            debug!(topic, "Dropping event published on closed bus");
            return Ok(());
        }

        let envelope = Arc::new(EventEnvelope::new(topic, event));
        let subscribers = self.inner.subscribers.read();
        let mut delivered = 0usize;
        for subscriber in subscribers.iter() {
            if subscriber.cancel.is_cancelled() || !subscriber.filter.matches(topic) {
                continue;
            }
            subscriber.push(Arc::clone(&envelope), self.inner.capacity);
            delivered += 1;
        }

        trace!(topic, delivered, "Published event");
        Ok(())
    }

    /// Publish on the event's default topic.
    pub fn publish_event(&self, event: Event) -> Result<(), EventError> {
        let topic = event.default_topic();
        self.publish(topic, event)
    }

    /// Subscribe to one topic.
    pub fn subscribe_topic(&self, cancel: &CancellationToken, topic: &str) -> Subscription {
        self.subscribe_filtered(cancel, TopicFilter::Topics(vec![topic.to_string()]))
    }

    /// Subscribe to a set of topics.
    pub fn subscribe_topics<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        topics: &[S],
    ) -> Subscription {
        let topics = topics.iter().map(|t| t.as_ref().to_string()).collect();
        self.subscribe_filtered(cancel, TopicFilter::Topics(topics))
    }

    /// Subscribe to every topic.
    pub fn subscribe(&self, cancel: &CancellationToken) -> Subscription {
        self.subscribe_filtered(cancel, TopicFilter::All)
    }

    fn subscribe_filtered(&self, cancel: &CancellationToken, filter: TopicFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            filter,
            ring: Mutex::new(Ring {
                events: VecDeque::new(),
                skipped: 0,
            }),
            notify: Notify::new(),
            cancel: cancel.child_token(),
        });

        if self.inner.closed.load(Ordering::Acquire) {
            subscriber.cancel.cancel();
        }

        self.inner.subscribers.write().push(Arc::clone(&subscriber));
        debug!(subscriber_id = id, filter = ?subscriber.filter, "Subscribed to event bus");

        Subscription {
            subscriber,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Stop all deliveries and end every subscription.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let subscribers = std::mem::take(&mut *self.inner.subscribers.write());
        for subscriber in subscribers {
            subscriber.cancel.cancel();
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|s| !s.cancel.is_cancelled())
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription.
///
/// The `Ok` arm of [`Subscription::recv`] is the event channel; the `Err`
/// arm is the error channel on which lag is reported.
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next event or delivery error.
    ///
    /// Returns `None` once the subscription has been cancelled; anything
    /// still buffered at that point is discarded.
    pub async fn recv(&mut self) -> Option<Result<Arc<EventEnvelope>, BusError>> {
        loop {
            if self.subscriber.cancel.is_cancelled() {
                return None;
            }

            {
                let mut ring = self.subscriber.ring.lock();
                if ring.skipped > 0 {
                    let skipped = std::mem::take(&mut ring.skipped);
                    return Some(Err(BusError::Lagged { skipped }));
                }
                if let Some(envelope) = ring.events.pop_front() {
                    return Some(Ok(envelope));
                }
            }

            tokio::select! {
                _ = self.subscriber.cancel.cancelled() => return None,
                _ = self.subscriber.notify.notified() => {}
            }
        }
    }

    /// Take a buffered item without waiting.
    pub fn try_recv(&mut self) -> Option<Result<Arc<EventEnvelope>, BusError>> {
        if self.subscriber.cancel.is_cancelled() {
            return None;
        }
        let mut ring = self.subscriber.ring.lock();
        if ring.skipped > 0 {
            let skipped = std::mem::take(&mut ring.skipped);
            return Some(Err(BusError::Lagged { skipped }));
        }
        ring.events.pop_front().map(Ok)
    }

    /// End the subscription.
    pub fn cancel(&self) {
        self.subscriber.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.subscriber.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriber.cancel.cancel();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.subscriber.id);
        }
    }
}
