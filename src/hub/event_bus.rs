//! C5 — minimal in-process topic-based publish/subscribe.
//!
//! Subscribers are registered as plain closures rather than channels: the
//! specification requires synchronous fan-out ("subscribers MUST NOT
//! block"), so a subscriber that wants asynchronous work enqueues it itself
//! (e.g. by sending on an `mpsc` channel) rather than the bus awaiting
//! anything.

use crate::hub::domain_types::LifecycleEvent;
use crate::hub::traits::{EventBus, SubscriptionHandle};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

type Handler = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct Subscription {
    handle: SubscriptionHandle,
    handler: Handler,
}

/// The default, in-process [`EventBus`] implementation.
pub struct EventBusImpl {
    subscribers: DashMap<String, Vec<Subscription>>,
    next_handle: AtomicU64,
}

impl Default for EventBusImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBusImpl {
    /// An event bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl EventBus for EventBusImpl {
    fn subscribe(&self, topic: &str, handler: Handler) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { handle, handler });
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        for mut topic_subs in self.subscribers.iter_mut() {
            topic_subs.retain(|sub| sub.handle != handle);
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        trace!(topic = %event.topic, "publishing lifecycle event");
        if let Some(subs) = self.subscribers.get(&event.topic) {
            for sub in subs.iter() {
                (sub.handler)(&event);
            }
        }
    }
}
