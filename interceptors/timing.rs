/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Resource timing wrapper.

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription};
use faultshell_runtime::{PerformanceTimeline, ResourceTimingEntry};

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "resourceTiming";
const ENTRIES: &str = "resourceTiming.entries";
const RECORD: &str = "resourceTiming.record";
const NOW: &str = "resourceTiming.now";

const DEFER_MS: std::ops::RangeInclusive<u64> = 100..=2000;
const JITTER_MS: std::ops::RangeInclusive<u64> = 1..=250;
/// Largest relative skew applied to a timing field, in percent.
const MAX_SKEW_PERCENT: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingFault {
    SkewedTiming,
    MissingEntry,
    ShuffledEntries,
    DelayedRecord,
    DroppedRecord,
    ClockJitter,
}

impl FaultVariant for TimingFault {
    fn name(self) -> &'static str {
        match self {
            Self::SkewedTiming => "skewed-timing",
            Self::MissingEntry => "missing-entry",
            Self::ShuffledEntries => "shuffled-entries",
            Self::DelayedRecord => "delayed-record",
            Self::DroppedRecord => "dropped-record",
            Self::ClockJitter => "clock-jitter",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::SkewedTiming => FaultFamily::Corruption,
            Self::MissingEntry | Self::DroppedRecord => FaultFamily::Drop,
            Self::ShuffledEntries => FaultFamily::Reorder,
            Self::DelayedRecord | Self::ClockJitter => FaultFamily::Latency,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::MissingEntry => Self::ShuffledEntries,
            Self::DroppedRecord => Self::DelayedRecord,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<TimingFault> {
    use TimingFault::*;
    FaultMenu::new()
        .with(ENTRIES, &[SkewedTiming, MissingEntry, ShuffledEntries])
        .with(RECORD, &[DelayedRecord, DroppedRecord])
        .with(NOW, &[ClockJitter])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "resource-timing",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

pub struct ChaosTimeline {
    real: Arc<dyn PerformanceTimeline>,
    core: InterceptorCore<TimingFault>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn PerformanceTimeline>) -> Arc<ChaosTimeline> {
    Arc::new(ChaosTimeline {
        real,
        core: InterceptorCore::new(ctx, "resource-timing", menu()),
    })
}

impl ChaosTimeline {
    fn perturb(&self, mut entries: Vec<ResourceTimingEntry>) -> Vec<ResourceTimingEntry> {
        let Some(fault) = self.core.decide(CATEGORY, ENTRIES) else {
            return entries;
        };
        if entries.is_empty() {
            self.core.emit(
                CATEGORY,
                TimingFault::ShuffledEntries,
                "no entries to disturb; buffer returned as is",
                0,
            );
            return entries;
        }
        match fault {
            TimingFault::SkewedTiming => {
                let index = self.core.rng().index(entries.len());
                let description = skew(&mut entries[index], self.core.rng().range(0..3), |max| {
                    self.core.rng().range(1..max.max(2))
                });
                self.core.emit(CATEGORY, fault, description, 0);
            }
            TimingFault::MissingEntry => {
                let index = self.core.rng().index(entries.len());
                let removed = entries.remove(index);
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("entry for {} left out of {} entries", removed.name, entries.len() + 1),
                    0,
                );
            }
            _ => {
                self.core.rng().shuffle(&mut entries);
                self.core.emit(
                    CATEGORY,
                    TimingFault::ShuffledEntries,
                    format!("{} entries returned out of start-time order", entries.len()),
                    0,
                );
            }
        }
        entries
    }
}

/// Skew one timing field of `entry`. `field` selects start time, duration or
/// transfer size; `draw(max)` yields a skew percentage in `1..max`.
fn skew(entry: &mut ResourceTimingEntry, field: u64, draw: impl Fn(u64) -> u64) -> String {
    let percent = draw(MAX_SKEW_PERCENT + 1) as f64 / 100.0;
    match field {
        0 => {
            let shift = (entry.start_time * percent).max(1.0);
            entry.start_time += shift;
            format!("{} startTime skewed by +{shift:.1}ms", entry.name)
        }
        1 => {
            let shift = (entry.duration * percent).max(1.0);
            entry.duration += shift;
            format!("{} duration skewed by +{shift:.1}ms", entry.name)
        }
        _ => {
            let shift = ((entry.transfer_size as f64 * percent) as u64).max(1);
            entry.transfer_size = entry.transfer_size.saturating_add(shift);
            format!("{} transferSize skewed by +{shift} bytes", entry.name)
        }
    }
}

impl PerformanceTimeline for ChaosTimeline {
    fn now(&self) -> f64 {
        let now = self.real.now();
        let Some(fault) = self.core.decide(CATEGORY, NOW) else {
            return now;
        };
        let jitter_ms = self.core.draw_ms(JITTER_MS);
        self.core.emit(
            CATEGORY,
            fault,
            format!("clock read {jitter_ms}ms ahead"),
            jitter_ms,
        );
        now + jitter_ms as f64
    }

    fn record(&self, entry: ResourceTimingEntry) {
        let Some(fault) = self.core.decide(CATEGORY, RECORD) else {
            return self.real.record(entry);
        };
        match fault {
            TimingFault::DroppedRecord => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("entry for {} never recorded", entry.name),
                    0,
                );
            }
            _ => {
                let delay_ms = self.core.draw_ms(DEFER_MS);
                self.core.emit(
                    CATEGORY,
                    TimingFault::DelayedRecord,
                    format!("entry for {} recorded {delay_ms}ms late", entry.name),
                    delay_ms,
                );
                let real = self.real.clone();
                self.core.defer(delay_ms, move || real.record(entry));
            }
        }
    }

    fn entries(&self) -> Vec<ResourceTimingEntry> {
        self.perturb(self.real.entries())
    }

    fn entries_by_name(&self, name: &str) -> Vec<ResourceTimingEntry> {
        self.perturb(self.real.entries_by_name(name))
    }

    fn clear(&self) {
        self.real.clear();
    }
}

impl InterceptorHandle for ChaosTimeline {
    fn name(&self) -> &'static str {
        "resource-timing"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}
