/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Event bus wrapper covering topic dispatch (`event`) and cross-context
//! messaging (`communication`).
//!
//! Reordered events and batched messages are parked in a [`HeldQueue`]
//! until an armed flush fires. Cleanup delivers whatever is still parked.

use std::sync::Arc;

use faultshell_core::{
    ChaosRng, FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value,
};
use faultshell_runtime::{Envelope, EventBus, Listener, SubscriptionId};
use parking_lot::Mutex;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const EVENT: &str = "event";
const COMMUNICATION: &str = "communication";
const PUBLISH: &str = "event.publish";
const POST_MESSAGE: &str = "communication.post_message";

const DISPATCH_DELAY_MS: std::ops::RangeInclusive<u64> = 50..=1500;
const FLUSH_AFTER_MS: std::ops::RangeInclusive<u64> = 100..=800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFault {
    DelayedDispatch,
    DroppedEvent,
    DuplicateDispatch,
    ReorderedEvents,
    CorruptPayload,
    DelayedMessage,
    LostMessage,
    CorruptMessage,
    BatchedMessages,
}

impl FaultVariant for EventFault {
    fn name(self) -> &'static str {
        match self {
            Self::DelayedDispatch => "delayed-dispatch",
            Self::DroppedEvent => "dropped-event",
            Self::DuplicateDispatch => "duplicate-dispatch",
            Self::ReorderedEvents => "reordered-events",
            Self::CorruptPayload => "corrupt-payload",
            Self::DelayedMessage => "delayed-message",
            Self::LostMessage => "lost-message",
            Self::CorruptMessage => "corrupt-message",
            Self::BatchedMessages => "batched-messages",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::DelayedDispatch | Self::DelayedMessage => FaultFamily::Latency,
            Self::DroppedEvent | Self::LostMessage => FaultFamily::Drop,
            Self::DuplicateDispatch => FaultFamily::Duplication,
            Self::ReorderedEvents => FaultFamily::Reorder,
            Self::CorruptPayload | Self::CorruptMessage => FaultFamily::Corruption,
            Self::BatchedMessages => FaultFamily::Batch,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::DroppedEvent => Self::DelayedDispatch,
            Self::LostMessage => Self::DelayedMessage,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<EventFault> {
    use EventFault::*;
    FaultMenu::new()
        .with(
            PUBLISH,
            &[
                DelayedDispatch,
                DroppedEvent,
                DuplicateDispatch,
                ReorderedEvents,
                CorruptPayload,
            ],
        )
        .with(
            POST_MESSAGE,
            &[DelayedMessage, LostMessage, CorruptMessage, BatchedMessages],
        )
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "events",
        categories: &[EVENT, COMMUNICATION],
        catalog,
        fallbacks,
    }
}

/// Where a parked envelope goes when it is released.
#[derive(Debug, Clone, PartialEq)]
enum Route {
    Topic,
    Channel(String),
}

#[derive(Default)]
struct Held {
    items: Vec<(Route, Envelope)>,
    armed: bool,
}

/// Envelopes parked until one flush releases all of them.
#[derive(Clone, Default)]
struct HeldQueue {
    inner: Arc<Mutex<Held>>,
}

impl HeldQueue {
    /// Park `item`. Returns `true` if the caller must arm a flush.
    fn park(&self, route: Route, envelope: Envelope) -> bool {
        let mut held = self.inner.lock();
        held.items.push((route, envelope));
        !std::mem::replace(&mut held.armed, true)
    }

    fn take(&self) -> Vec<(Route, Envelope)> {
        let mut held = self.inner.lock();
        held.armed = false;
        std::mem::take(&mut held.items)
    }

    fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}

fn deliver(real: &dyn EventBus, items: Vec<(Route, Envelope)>) -> usize {
    items
        .into_iter()
        .map(|(route, envelope)| match route {
            Route::Topic => real.publish(envelope),
            Route::Channel(channel) => real.post_message(&channel, envelope),
        })
        .sum()
}

pub struct ChaosEvents {
    real: Arc<dyn EventBus>,
    core: InterceptorCore<EventFault>,
    reordered: HeldQueue,
    batched: HeldQueue,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn EventBus>) -> Arc<ChaosEvents> {
    Arc::new(ChaosEvents {
        real,
        core: InterceptorCore::new(ctx, "events", menu()),
        reordered: HeldQueue::default(),
        batched: HeldQueue::default(),
    })
}

impl ChaosEvents {
    fn delay(&self, category: &str, variant: EventFault, route: Route, envelope: Envelope) -> usize {
        let delay_ms = self.core.draw_ms(DISPATCH_DELAY_MS);
        self.core.emit(
            category,
            variant,
            format!("{:?} held for {delay_ms}ms", envelope.topic),
            delay_ms,
        );
        let real = self.real.clone();
        self.core.defer(delay_ms, move || {
            deliver(real.as_ref(), vec![(route, envelope)]);
        });
        0
    }

    /// Park `envelope` in `queue`, arming a flush if none is pending. The
    /// reorder queue is shuffled on release; batches keep their order.
    fn park(&self, queue: &HeldQueue, shuffle: bool, route: Route, envelope: Envelope) {
        if !queue.park(route, envelope) {
            return;
        }
        let after_ms = self.core.draw_ms(FLUSH_AFTER_MS);
        let (real, queue_handle) = (self.real.clone(), queue.clone());
        let rng: Option<ChaosRng> = shuffle.then(|| self.core.rng().clone());
        let armed = self.core.scheduler().schedule_fn(
            std::time::Duration::from_millis(after_ms),
            move || {
                let mut items = queue_handle.take();
                if let Some(rng) = rng {
                    rng.shuffle(&mut items);
                }
                deliver(real.as_ref(), items);
            },
        );
        if !armed {
            deliver(self.real.as_ref(), queue.take());
        }
    }

    fn corrupt(&self, envelope: &mut Envelope) -> Option<String> {
        self.core
            .rng()
            .with(|rng| corrupt_value(&mut envelope.payload, rng))
            .map(|corruption| corruption.to_string())
    }

    /// Envelopes currently parked in reorder or batch queues.
    pub fn held(&self) -> usize {
        self.reordered.len() + self.batched.len()
    }
}

impl EventBus for ChaosEvents {
    fn subscribe(&self, topic: &str, listener: Listener) -> SubscriptionId {
        self.real.subscribe(topic, listener)
    }

    fn on_message(&self, channel: &str, listener: Listener) -> SubscriptionId {
        self.real.on_message(channel, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.real.unsubscribe(id)
    }

    fn publish(&self, mut event: Envelope) -> usize {
        let Some(fault) = self.core.decide(EVENT, PUBLISH) else {
            return self.real.publish(event);
        };
        match fault {
            EventFault::DroppedEvent => {
                self.core
                    .emit(EVENT, fault, format!("{:?} dropped", event.topic), 0);
                0
            }
            EventFault::DuplicateDispatch => {
                let copies = self.core.draw_copies();
                self.core.emit(
                    EVENT,
                    fault,
                    format!("{:?} dispatched {copies} extra times", event.topic),
                    0,
                );
                for offset in self.core.stagger(copies) {
                    let (real, copy) = (self.real.clone(), event.clone());
                    self.core.defer(offset.as_millis() as u64, move || {
                        real.publish(copy);
                    });
                }
                self.real.publish(event)
            }
            EventFault::ReorderedEvents => {
                self.core.emit(
                    EVENT,
                    fault,
                    format!("{:?} parked for out-of-order release", event.topic),
                    0,
                );
                self.park(&self.reordered, true, Route::Topic, event);
                0
            }
            EventFault::CorruptPayload => match self.corrupt(&mut event) {
                Some(corruption) => {
                    self.core.emit(
                        EVENT,
                        fault,
                        format!("{:?} payload corrupted at {corruption}", event.topic),
                        0,
                    );
                    self.real.publish(event)
                }
                None => self.delay(EVENT, EventFault::DelayedDispatch, Route::Topic, event),
            },
            _ => self.delay(EVENT, EventFault::DelayedDispatch, Route::Topic, event),
        }
    }

    fn post_message(&self, channel: &str, mut message: Envelope) -> usize {
        let Some(fault) = self.core.decide(COMMUNICATION, POST_MESSAGE) else {
            return self.real.post_message(channel, message);
        };
        let route = Route::Channel(channel.to_string());
        match fault {
            EventFault::LostMessage => {
                self.core.emit(
                    COMMUNICATION,
                    fault,
                    format!("message to {channel:?} lost"),
                    0,
                );
                0
            }
            EventFault::BatchedMessages => {
                self.core.emit(
                    COMMUNICATION,
                    fault,
                    format!("message to {channel:?} held for a batch"),
                    0,
                );
                self.park(&self.batched, false, route, message);
                0
            }
            EventFault::CorruptMessage => match self.corrupt(&mut message) {
                Some(corruption) => {
                    self.core.emit(
                        COMMUNICATION,
                        fault,
                        format!("message to {channel:?} corrupted at {corruption}"),
                        0,
                    );
                    self.real.post_message(channel, message)
                }
                None => self.delay(COMMUNICATION, EventFault::DelayedMessage, route, message),
            },
            _ => self.delay(COMMUNICATION, EventFault::DelayedMessage, route, message),
        }
    }
}

impl InterceptorHandle for ChaosEvents {
    fn name(&self) -> &'static str {
        "events"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        deliver(self.real.as_ref(), self.reordered.take());
        deliver(self.real.as_ref(), self.batched.take());
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending() + self.held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::testing::Harness;
    use faultshell_core::ChaosConfig;
    use faultshell_runtime::MemoryEventBus;
    use serde_json::json;
    use std::time::Duration;

    fn recorder(bus: &dyn EventBus, topic: &str) -> Arc<Mutex<Vec<Envelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(topic, Arc::new(move |event: &Envelope| sink.lock().push(event.clone())));
        seen
    }

    fn channel_recorder(bus: &dyn EventBus, channel: &str) -> Arc<Mutex<Vec<Envelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_message(channel, Arc::new(move |event: &Envelope| sink.lock().push(event.clone())));
        seen
    }

    #[test]
    fn pass_through_delivers_synchronously() {
        let harness = Harness::never();
        let chaos = install(&harness.ctx, Arc::new(MemoryEventBus::new()));
        let seen = recorder(chaos.as_ref(), "saved");

        assert_eq!(chaos.publish(Envelope::new("saved", json!({"id": 1}))), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(harness.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_mode_delivers_every_event_eventually() {
        let harness = Harness::always(true, 12);
        let chaos = install(&harness.ctx, Arc::new(MemoryEventBus::new()));
        let seen = recorder(chaos.as_ref(), "tick");

        for index in 0..25 {
            chaos.publish(Envelope::new("tick", json!({"index": index})));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(seen.lock().len() >= 25);
        assert_eq!(chaos.held(), 0);
        harness.assert_all_recoverable();
    }

    #[tokio::test(start_paused = true)]
    async fn batched_messages_arrive_together_in_order() {
        let harness = Harness::new(
            ChaosConfig::default()
                .with_enabled(true)
                .with_probability(1.0)
                .with_categories(["communication"]),
            30,
        );
        let chaos = install(&harness.ctx, Arc::new(MemoryEventBus::new()));
        let seen = channel_recorder(chaos.as_ref(), "port");

        let mut batched = Vec::new();
        for index in 0..40 {
            let topic = format!("step-{index}");
            chaos.post_message("port", Envelope::new(topic.clone(), json!({"index": index})));
            if harness.kinds().last().map(String::as_str) == Some("communication.batched-messages") {
                batched.push(topic);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let delivered = seen
            .lock()
            .iter()
            .map(|message| message.topic.clone())
            .filter(|topic| batched.contains(topic))
            .collect::<Vec<_>>();
        assert!(!batched.is_empty());
        assert_eq!(delivered, batched);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_flushes_parked_envelopes() {
        let harness = Harness::always(true, 8);
        let chaos = install(&harness.ctx, Arc::new(MemoryEventBus::new()));
        let seen = recorder(chaos.as_ref(), "t");

        let mut attempts = 0;
        while chaos.held() == 0 && attempts < 100 {
            chaos.publish(Envelope::new("t", json!({"n": attempts})));
            attempts += 1;
        }
        assert!(chaos.held() > 0);
        let before = seen.lock().len();

        chaos.cleanup().unwrap();
        assert_eq!(chaos.held(), 0);
        assert!(seen.lock().len() > before);
        assert_eq!(chaos.active_resources(), 0);

        assert_eq!(chaos.publish(Envelope::new("t", json!({"n": -1}))), 1);
    }

    #[tokio::test]
    async fn scalar_payloads_are_delayed_instead_of_corrupted() {
        let harness = Harness::always(false, 2);
        let chaos = install(&harness.ctx, Arc::new(MemoryEventBus::new()));
        for _ in 0..40 {
            chaos.post_message("port", Envelope::new("ping", json!("plain")));
        }
        assert!(
            harness
                .kinds()
                .iter()
                .all(|kind| kind != "communication.corrupt-message")
        );
    }
}
