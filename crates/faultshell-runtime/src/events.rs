/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Publish/subscribe events and point-to-point messages.
//!
//! Both paths share one envelope shape. `publish` fans out to the
//! subscribers of a topic; `post_message` delivers to the listeners of a
//! named channel (a window, a port, a frame).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: &str, listener: Listener) -> SubscriptionId;
    fn on_message(&self, channel: &str, listener: Listener) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
    /// Returns how many listeners were invoked.
    fn publish(&self, event: Envelope) -> usize;
    fn post_message(&self, channel: &str, message: Envelope) -> usize;
}

#[derive(Clone)]
struct Registration {
    key: String,
    listener: Listener,
}

#[derive(Default)]
pub struct MemoryEventBus {
    next_id: AtomicU64,
    topics: RwLock<BTreeMap<SubscriptionId, Registration>>,
    channels: RwLock<BTreeMap<SubscriptionId, Registration>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        table: &RwLock<BTreeMap<SubscriptionId, Registration>>,
        key: &str,
        listener: Listener,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        table.write().insert(
            id,
            Registration {
                key: key.to_string(),
                listener,
            },
        );
        id
    }

    fn dispatch(
        table: &RwLock<BTreeMap<SubscriptionId, Registration>>,
        key: &str,
        envelope: &Envelope,
    ) -> usize {
        // Listeners run outside the lock so they may subscribe or publish.
        let listeners = table
            .read()
            .values()
            .filter(|registration| registration.key == key)
            .map(|registration| registration.listener.clone())
            .collect::<Vec<_>>();
        for listener in &listeners {
            listener(envelope);
        }
        listeners.len()
    }
}

impl EventBus for MemoryEventBus {
    fn subscribe(&self, topic: &str, listener: Listener) -> SubscriptionId {
        self.register(&self.topics, topic, listener)
    }

    fn on_message(&self, channel: &str, listener: Listener) -> SubscriptionId {
        self.register(&self.channels, channel, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.topics.write().remove(&id).is_some() || self.channels.write().remove(&id).is_some()
    }

    fn publish(&self, event: Envelope) -> usize {
        Self::dispatch(&self.topics, &event.topic, &event)
    }

    fn post_message(&self, channel: &str, message: Envelope) -> usize {
        Self::dispatch(&self.channels, channel, &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<Envelope>>>, Listener) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Arc::new(move |event: &Envelope| sink.lock().push(event.clone())))
    }

    #[test]
    fn publish_reaches_only_matching_topic() {
        let bus = MemoryEventBus::new();
        let (clicks, listener) = recorder();
        bus.subscribe("click", listener);

        assert_eq!(bus.publish(Envelope::new("click", json!({"x": 1}))), 1);
        assert_eq!(bus.publish(Envelope::new("scroll", json!({}))), 0);
        assert_eq!(clicks.lock().len(), 1);
    }

    #[test]
    fn messages_and_topics_are_separate_namespaces() {
        let bus = MemoryEventBus::new();
        let (messages, listener) = recorder();
        let id = bus.on_message("frame", listener);

        assert_eq!(bus.publish(Envelope::new("frame", json!(1))), 0);
        assert_eq!(bus.post_message("frame", Envelope::new("message", json!(2))), 1);
        assert!(bus.unsubscribe(id));
        assert_eq!(bus.post_message("frame", Envelope::new("message", json!(3))), 0);
        assert_eq!(messages.lock().len(), 1);
    }

    #[test]
    fn listeners_may_publish_reentrantly() {
        let bus = Arc::new(MemoryEventBus::new());
        let (echoes, listener) = recorder();
        bus.subscribe("echo", listener);
        let inner = bus.clone();
        bus.subscribe(
            "ping",
            Arc::new(move |event: &Envelope| {
                inner.publish(Envelope::new("echo", event.payload.clone()));
            }),
        );

        bus.publish(Envelope::new("ping", json!("hi")));
        assert_eq!(echoes.lock()[0].payload, json!("hi"));
    }
}
