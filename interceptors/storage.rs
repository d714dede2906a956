/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Key/value storage wrapper.
//!
//! Reads are synchronous, so their latency-class variant is `stale-read`:
//! the value that was current before the latest write through this wrapper.
//! Writes and removals can be deferred on the scheduler instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_json_text};
use faultshell_runtime::{KeyValueStorage, StorageError};
use log::warn;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    WriteShadow, fallback_table,
};

const CATEGORY: &str = "storage";
const READ: &str = "storage.read";
const WRITE: &str = "storage.write";
const REMOVE: &str = "storage.remove";

const DEFER_MS: std::ops::RangeInclusive<u64> = 100..=2000;
const QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFault {
    StaleRead,
    CorruptValue,
    PhantomMiss,
    DeferredWrite,
    QuotaExceeded,
    DuplicateWrite,
    RemovedKey,
    SpuriousKey,
    DeferredRemove,
    IgnoredRemove,
}

impl FaultVariant for StorageFault {
    fn name(self) -> &'static str {
        match self {
            Self::StaleRead => "stale-read",
            Self::CorruptValue => "corrupt-value",
            Self::PhantomMiss => "phantom-miss",
            Self::DeferredWrite => "deferred-write",
            Self::QuotaExceeded => "quota-exceeded",
            Self::DuplicateWrite => "duplicate-write",
            Self::RemovedKey => "removed-key",
            Self::SpuriousKey => "spurious-key",
            Self::DeferredRemove => "deferred-remove",
            Self::IgnoredRemove => "ignored-remove",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::StaleRead | Self::DeferredWrite | Self::DeferredRemove => FaultFamily::Latency,
            Self::CorruptValue => FaultFamily::Corruption,
            Self::DuplicateWrite => FaultFamily::Duplication,
            Self::PhantomMiss | Self::QuotaExceeded | Self::IgnoredRemove => FaultFamily::Error,
            Self::RemovedKey | Self::SpuriousKey => FaultFamily::Structural,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::CorruptValue | Self::PhantomMiss => Self::StaleRead,
            Self::QuotaExceeded | Self::RemovedKey | Self::SpuriousKey => Self::DeferredWrite,
            Self::IgnoredRemove => Self::DeferredRemove,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<StorageFault> {
    use StorageFault::*;
    FaultMenu::new()
        .with(READ, &[StaleRead, CorruptValue, PhantomMiss])
        .with(
            WRITE,
            &[DeferredWrite, QuotaExceeded, DuplicateWrite, RemovedKey, SpuriousKey],
        )
        .with(REMOVE, &[DeferredRemove, IgnoredRemove])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "storage",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

pub struct ChaosStorage {
    real: Arc<dyn KeyValueStorage>,
    core: InterceptorCore<StorageFault>,
    shadow: WriteShadow<String, Option<String>>,
    spurious: AtomicU64,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn KeyValueStorage>) -> Arc<ChaosStorage> {
    Arc::new(ChaosStorage {
        real,
        core: InterceptorCore::new(ctx, "storage", menu()),
        shadow: WriteShadow::new(),
        spurious: AtomicU64::new(0),
    })
}

impl ChaosStorage {
    fn observe(&self, key: &str, value: Option<&str>) {
        if !self.core.is_detached() {
            self.shadow
                .observe(key.to_string(), value.map(str::to_string));
        }
    }

    fn stale_read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.shadow.previous(&key.to_string()) {
            Some(previous) => {
                self.core.emit(
                    CATEGORY,
                    StorageFault::StaleRead,
                    format!("read of {key:?} served the value before the latest write"),
                    0,
                );
                Ok(previous)
            }
            None => {
                self.core.emit(
                    CATEGORY,
                    StorageFault::StaleRead,
                    format!("read of {key:?} had no older value; served current"),
                    0,
                );
                self.real.get(key)
            }
        }
    }

    fn deferred_write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let delay_ms = self.core.draw_ms(DEFER_MS);
        self.core.emit(
            CATEGORY,
            StorageFault::DeferredWrite,
            format!("write of {key:?} deferred by {delay_ms}ms"),
            delay_ms,
        );
        let (real, key, value) = (self.real.clone(), key.to_string(), value.to_string());
        self.core.defer(delay_ms, move || {
            if let Err(error) = real.set(&key, &value) {
                warn!("storage: deferred write of {key:?} failed: {error}");
            }
        });
        Ok(())
    }

    /// Another key to remove, if any.
    fn victim(&self, key: &str) -> Option<String> {
        let others = self
            .real
            .keys()
            .into_iter()
            .filter(|candidate| candidate != key)
            .collect::<Vec<_>>();
        self.core.rng().pick(&others).cloned()
    }
}

impl KeyValueStorage for ChaosStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let Some(fault) = self.core.decide(CATEGORY, READ) else {
            return self.real.get(key);
        };
        match fault {
            StorageFault::CorruptValue => {
                let current = match self.real.get(key) {
                    Ok(current) => current,
                    Err(error) => {
                        self.core.emit(
                            CATEGORY,
                            fault,
                            format!("read of {key:?} failed before it could be corrupted: {error}"),
                            0,
                        );
                        return Err(error);
                    }
                };
                let corrupted = current
                    .as_deref()
                    .and_then(|raw| self.core.rng().with(|rng| corrupt_json_text(raw, rng)));
                match corrupted {
                    Some((text, corruption)) => {
                        self.core.emit(
                            CATEGORY,
                            fault,
                            format!("value of {key:?} corrupted at {corruption}"),
                            0,
                        );
                        Ok(Some(text))
                    }
                    None => self.stale_read(key),
                }
            }
            StorageFault::PhantomMiss => {
                self.core
                    .emit(CATEGORY, fault, format!("{key:?} reported missing"), 0);
                Ok(None)
            }
            _ => self.stale_read(key),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let Some(fault) = self.core.decide(CATEGORY, WRITE) else {
            self.real.set(key, value)?;
            self.observe(key, Some(value));
            return Ok(());
        };
        match fault {
            StorageFault::QuotaExceeded => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("write of {key:?} rejected: quota exceeded"),
                    0,
                );
                Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    limit_bytes: QUOTA_BYTES,
                })
            }
            StorageFault::DuplicateWrite => {
                let copies = self.core.draw_copies();
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("write of {key:?} repeated {copies} extra times"),
                    0,
                );
                self.real.set(key, value)?;
                self.observe(key, Some(value));
                for offset in self.core.stagger(copies) {
                    let (real, key, value) = (self.real.clone(), key.to_string(), value.to_string());
                    self.core.defer(offset.as_millis() as u64, move || {
                        if let Err(error) = real.set(&key, &value) {
                            warn!("storage: repeated write of {key:?} failed: {error}");
                        }
                    });
                }
                Ok(())
            }
            StorageFault::RemovedKey => match self.victim(key) {
                Some(victim) => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("write of {key:?} also removed {victim:?}"),
                        0,
                    );
                    self.real.set(key, value)?;
                    self.observe(key, Some(value));
                    self.real.remove(&victim)?;
                    self.shadow.forget(&victim);
                    Ok(())
                }
                None => self.deferred_write(key, value),
            },
            StorageFault::SpuriousKey => {
                let spurious = format!(
                    "__chaos_{}",
                    self.spurious.fetch_add(1, Ordering::Relaxed)
                );
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("write of {key:?} also created {spurious:?}"),
                    0,
                );
                self.real.set(key, value)?;
                self.observe(key, Some(value));
                self.real.set(&spurious, value)
            }
            _ => {
                self.observe(key, Some(value));
                self.deferred_write(key, value)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let Some(fault) = self.core.decide(CATEGORY, REMOVE) else {
            self.real.remove(key)?;
            self.observe(key, None);
            return Ok(());
        };
        match fault {
            StorageFault::IgnoredRemove => {
                self.core
                    .emit(CATEGORY, fault, format!("removal of {key:?} ignored"), 0);
                Ok(())
            }
            _ => {
                let delay_ms = self.core.draw_ms(DEFER_MS);
                self.core.emit(
                    CATEGORY,
                    StorageFault::DeferredRemove,
                    format!("removal of {key:?} deferred by {delay_ms}ms"),
                    delay_ms,
                );
                self.observe(key, None);
                let (real, key) = (self.real.clone(), key.to_string());
                self.core.defer(delay_ms, move || {
                    if let Err(error) = real.remove(&key) {
                        warn!("storage: deferred removal of {key:?} failed: {error}");
                    }
                });
                Ok(())
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        self.real.keys()
    }

    fn clear(&self) {
        self.real.clear();
        self.shadow.clear();
    }
}

impl InterceptorHandle for ChaosStorage {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        self.shadow.clear();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::testing::Harness;
    use faultshell_core::ChaosConfig;
    use faultshell_runtime::MemoryStorage;
    use std::time::Duration;

    #[test]
    fn pass_through_matches_the_real_store() {
        let harness = Harness::never();
        let real = Arc::new(MemoryStorage::new());
        let chaos = install(&harness.ctx, real.clone());

        chaos.set("a", "1").unwrap();
        chaos.set("b", "2").unwrap();
        chaos.remove("a").unwrap();

        assert_eq!(chaos.get("b").unwrap(), real.get("b").unwrap());
        assert_eq!(chaos.keys(), vec!["b".to_string()]);
        assert_eq!(harness.event_count(), 0);
    }

    struct UnavailableStorage;

    impl KeyValueStorage for UnavailableStorage {
        fn get(&self, _: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn set(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn remove(&self, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".into()))
        }
        fn keys(&self) -> Vec<String> {
            Vec::new()
        }
        fn clear(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_still_logs_every_triggered_fault() {
        let harness = Harness::always(false, 9);
        let chaos = install(&harness.ctx, Arc::new(UnavailableStorage));
        for _ in 0..40 {
            let _ = chaos.get("profile");
            let _ = chaos.set("profile", "{}");
            let _ = chaos.remove("profile");
        }
        assert_eq!(harness.event_count(), 120);
        assert!(harness.kinds().iter().any(|kind| kind == "storage.corrupt-value"));
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_writes_land_after_the_delay() {
        let harness = Harness::new(
            ChaosConfig::default()
                .with_enabled(true)
                .with_probability(1.0)
                .with_safe_mode(true),
            4,
        );
        let real = Arc::new(MemoryStorage::new());
        let chaos = install(&harness.ctx, real.clone());

        for attempt in 0..20 {
            chaos.set("counter", &attempt.to_string()).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(real.get("counter").unwrap().is_some());
        assert_eq!(chaos.active_resources(), 0);
        harness.assert_all_recoverable();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_read_returns_the_value_before_the_latest_write() {
        let harness = Harness::never();
        let real = Arc::new(MemoryStorage::new());
        let chaos = install(&harness.ctx, real.clone());
        chaos.set("theme", "light").unwrap();
        chaos.set("theme", "dark").unwrap();

        harness.ctx.config.set_enabled(true);
        harness.ctx.config.set_probability(1.0);
        let seen = (0..30)
            .map(|_| chaos.get("theme").unwrap())
            .collect::<Vec<_>>();

        assert!(seen.contains(&Some("light".to_string())));
        assert_eq!(real.get("theme").unwrap().as_deref(), Some("dark"));
        harness.assert_all_recoverable();
    }

    #[tokio::test]
    async fn json_values_are_corrupted_one_field_at_a_time() {
        let harness = Harness::always(true, 8);
        let real = Arc::new(MemoryStorage::new());
        real.set("prefs", r#"{"volume": 7, "muted": false}"#).unwrap();
        let chaos = install(&harness.ctx, real.clone());

        for _ in 0..40 {
            let raw = chaos.get("prefs").unwrap().expect("present");
            let parsed: serde_json::Value = serde_json::from_str(&raw).expect("still json");
            assert!(parsed["volume"].is_i64());
            assert!(parsed["muted"].is_boolean());
        }
        assert!(harness.kinds().iter().any(|kind| kind == "storage.corrupt-value"));
    }

    #[tokio::test]
    async fn structural_faults_change_the_key_set_in_unsafe_mode() {
        let harness = Harness::always(false, 21);
        let real = Arc::new(MemoryStorage::new());
        let chaos = install(&harness.ctx, real.clone());
        for index in 0..40 {
            let _ = chaos.set(&format!("k{index}"), "v");
        }
        let kinds = harness.kinds();
        assert!(kinds.iter().any(|kind| kind == "storage.spurious-key"));
        assert!(kinds.iter().any(|kind| kind == "storage.quota-exceeded"));
        assert!(real.keys().iter().any(|key| key.starts_with("__chaos_")));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_deferred_writes() {
        let harness = Harness::always(true, 4);
        let real = Arc::new(MemoryStorage::new());
        let chaos = install(&harness.ctx, real.clone());
        for attempt in 0..10 {
            chaos.set("k", &attempt.to_string()).unwrap();
        }
        let pending = chaos.active_resources();
        chaos.cleanup().unwrap();
        assert_eq!(chaos.active_resources(), 0);
        let settled = real.get("k").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(real.get("k").unwrap(), settled);
        assert!(pending > 0);

        chaos.set("k", "final").unwrap();
        assert_eq!(real.get("k").unwrap().as_deref(), Some("final"));
    }
}
