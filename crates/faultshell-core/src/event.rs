/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChaosImpact {
    Low,
    Medium,
    High,
}

/// What an interceptor reports about one triggered fault. The logger
/// stamps it with an id and a timestamp to produce a [`ChaosEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosEventInput {
    pub kind: String,
    pub description: String,
    pub duration_ms: u64,
    pub impact: ChaosImpact,
    pub recoverable: bool,
}

impl ChaosEventInput {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            duration_ms: 0,
            impact: ChaosImpact::Low,
            recoverable: true,
        }
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn impact(mut self, impact: ChaosImpact) -> Self {
        self.impact = impact;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

/// Immutable record of one injected fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosEvent {
    id: Uuid,
    timestamp: u64,
    #[serde(rename = "type")]
    kind: String,
    description: String,
    duration_ms: u64,
    impact: ChaosImpact,
    recoverable: bool,
}

impl ChaosEvent {
    pub fn from_input(input: ChaosEventInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_unix_ms(),
            kind: input.kind,
            description: input.description,
            duration_ms: input.duration_ms,
            impact: input.impact,
            recoverable: input.recoverable,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Dot-namespaced type, e.g. `network.delay`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Category prefix of [`Self::kind`].
    pub fn category(&self) -> &str {
        self.kind.split('.').next().unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn impact(&self) -> ChaosImpact {
        self.impact
    }

    pub fn recoverable(&self) -> bool {
        self.recoverable
    }
}

/// Shape forwarded to external log sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosLogEntry {
    pub id: Uuid,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub category: String,
    pub summary: String,
    pub details: ChaosEvent,
}

impl From<&ChaosEvent> for ChaosLogEntry {
    fn from(event: &ChaosEvent) -> Self {
        Self {
            id: event.id,
            timestamp: event.timestamp,
            kind: event.kind.clone(),
            category: format!("chaos.{}", event.kind),
            summary: event.description.clone(),
            details: event.clone(),
        }
    }
}

/// Logging callback handed to every interceptor.
#[derive(Clone)]
pub struct ChaosLog {
    sink: Arc<dyn Fn(ChaosEventInput) + Send + Sync>,
}

impl ChaosLog {
    pub fn new(sink: impl Fn(ChaosEventInput) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, input: ChaosEventInput) {
        (self.sink)(input);
    }
}

impl std::fmt::Debug for ChaosLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosLog").finish_non_exhaustive()
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn event_stamps_unique_ids_and_keeps_input_fields() {
        let input = ChaosEventInput::new("network.delay", "delayed fetch by 700ms")
            .duration_ms(700)
            .impact(ChaosImpact::Medium);
        let first = ChaosEvent::from_input(input.clone());
        let second = ChaosEvent::from_input(input);

        assert_ne!(first.id(), second.id());
        assert_eq!(first.kind(), "network.delay");
        assert_eq!(first.category(), "network");
        assert_eq!(first.duration_ms(), 700);
        assert_eq!(first.impact(), ChaosImpact::Medium);
        assert!(first.recoverable());
        assert!(first.timestamp() > 0);
    }

    #[test]
    fn log_entry_wire_shape_uses_chaos_prefix() {
        let event = ChaosEvent::from_input(
            ChaosEventInput::new("storage.quota-exceeded", "rejected write to 'cart'")
                .impact(ChaosImpact::High)
                .recoverable(false),
        );
        let entry = ChaosLogEntry::from(&event);
        let json = serde_json::to_value(&entry).expect("serialize");

        assert_eq!(json["type"], "storage.quota-exceeded");
        assert_eq!(json["category"], "chaos.storage.quota-exceeded");
        assert_eq!(json["summary"], "rejected write to 'cart'");
        assert_eq!(json["details"]["type"], "storage.quota-exceeded");
        assert_eq!(json["details"]["durationMs"], 0);
        assert_eq!(json["details"]["impact"], "high");
        assert_eq!(json["details"]["recoverable"], false);
        assert_eq!(json["id"], json["details"]["id"]);
    }

    #[test]
    fn chaos_log_forwards_to_sink() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let log = ChaosLog::new(move |input| sink.lock().push(input.kind));

        log.emit(ChaosEventInput::new("dom.delayed-mutation", "x"));
        ChaosLog::discard().emit(ChaosEventInput::new("dom.delayed-mutation", "y"));

        assert_eq!(seen.lock().as_slice(), ["dom.delayed-mutation"]);
    }
}
