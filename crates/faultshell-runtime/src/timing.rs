/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTimingEntry {
    pub name: String,
    pub initiator_type: String,
    /// Milliseconds since the timeline origin.
    pub start_time: f64,
    pub duration: f64,
    pub transfer_size: u64,
}

impl ResourceTimingEntry {
    pub fn new(name: impl Into<String>, initiator_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initiator_type: initiator_type.into(),
            start_time: 0.0,
            duration: 0.0,
            transfer_size: 0,
        }
    }
}

/// Resource timing buffer plus the high-resolution clock it is measured on.
pub trait PerformanceTimeline: Send + Sync {
    /// Milliseconds since the timeline origin.
    fn now(&self) -> f64;
    fn record(&self, entry: ResourceTimingEntry);
    fn entries(&self) -> Vec<ResourceTimingEntry>;
    fn entries_by_name(&self, name: &str) -> Vec<ResourceTimingEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.name == name)
            .collect()
    }
    fn clear(&self);
}

#[derive(Debug)]
pub struct MemoryTimeline {
    origin: Instant,
    entries: RwLock<Vec<ResourceTimingEntry>>,
}

impl Default for MemoryTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTimeline {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            entries: RwLock::default(),
        }
    }
}

impl PerformanceTimeline for MemoryTimeline {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    fn record(&self, entry: ResourceTimingEntry) {
        self.entries.write().push(entry);
    }

    fn entries(&self) -> Vec<ResourceTimingEntry> {
        let mut entries = self.entries.read().clone();
        entries.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        entries
    }

    fn clear(&self) {
        self.entries.write().clear();
    }
}
