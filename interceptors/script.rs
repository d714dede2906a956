/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Script host wrapper, plus the memory and cpu pressure ticker.
//!
//! The ticker is owned by the script interceptor because both pressures
//! degrade script execution; it runs on the interceptor's scheduler, so
//! cleanup stops it and releases any ballast still held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value};
use faultshell_runtime::{ScriptError, ScriptHost, TimerCallback, TimerId};
use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    WriteShadow, fallback_table,
};

const CATEGORY: &str = "script";
const MEMORY: &str = "memory";
const CPU: &str = "cpu";

const READ_GLOBAL: &str = "script.read_global";
const WRITE_GLOBAL: &str = "script.write_global";
const EVALUATE: &str = "script.evaluate";
const TIMER: &str = "script.timer";
const MEMORY_PRESSURE: &str = "memory.pressure";
const CPU_PRESSURE: &str = "cpu.pressure";

const PRESSURE_PERIOD: Duration = Duration::from_secs(1);
const BALLAST_MIB: std::ops::RangeInclusive<u64> = 1..=16;
const BALLAST_HOLD_MS: std::ops::RangeInclusive<u64> = 1000..=5000;
const BURN_MS: std::ops::RangeInclusive<u64> = 50..=250;

/// Dropped timers get ids from the top of the range so they never collide
/// with ids handed out by the real host.
const DROPPED_TIMER_BASE: u64 = u64::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptFault {
    CorruptGlobal,
    StaleGlobal,
    UndefinedGlobal,
    DeferredAssignment,
    ReadonlyViolation,
    SlowExecution,
    ExecutionTimeout,
    TimerDrift,
    TimerDrop,
    Ballast,
    Burn,
}

impl FaultVariant for ScriptFault {
    fn name(self) -> &'static str {
        match self {
            Self::CorruptGlobal => "corrupt-global",
            Self::StaleGlobal => "stale-global",
            Self::UndefinedGlobal => "undefined-global",
            Self::DeferredAssignment => "deferred-assignment",
            Self::ReadonlyViolation => "readonly-violation",
            Self::SlowExecution => "slow-execution",
            Self::ExecutionTimeout => "execution-timeout",
            Self::TimerDrift => "timer-drift",
            Self::TimerDrop => "timer-drop",
            Self::Ballast => "ballast",
            Self::Burn => "burn",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::CorruptGlobal => FaultFamily::Corruption,
            Self::StaleGlobal
            | Self::DeferredAssignment
            | Self::SlowExecution
            | Self::TimerDrift
            | Self::Ballast
            | Self::Burn => FaultFamily::Latency,
            Self::UndefinedGlobal | Self::ReadonlyViolation | Self::ExecutionTimeout => {
                FaultFamily::Error
            }
            Self::TimerDrop => FaultFamily::Drop,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::UndefinedGlobal => Self::StaleGlobal,
            Self::ReadonlyViolation => Self::DeferredAssignment,
            Self::ExecutionTimeout => Self::SlowExecution,
            Self::TimerDrop => Self::TimerDrift,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<ScriptFault> {
    use ScriptFault::*;
    FaultMenu::new()
        .with(READ_GLOBAL, &[CorruptGlobal, StaleGlobal, UndefinedGlobal])
        .with(WRITE_GLOBAL, &[DeferredAssignment, ReadonlyViolation])
        .with(EVALUATE, &[SlowExecution, ExecutionTimeout])
        .with(TIMER, &[TimerDrift, TimerDrop])
        .with(MEMORY_PRESSURE, &[Ballast])
        .with(CPU_PRESSURE, &[Burn])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "script",
        categories: &[CATEGORY, MEMORY, CPU],
        catalog,
        fallbacks,
    }
}

/// Memory held on purpose. Dropping it releases the bytes and the count.
struct Ballast {
    bytes: Vec<u8>,
    held: Arc<AtomicUsize>,
}

impl Ballast {
    fn allocate(len: usize, held: Arc<AtomicUsize>) -> Self {
        held.fetch_add(len, Ordering::SeqCst);
        Self {
            bytes: vec![0xA5; len],
            held,
        }
    }
}

impl Drop for Ballast {
    fn drop(&mut self) {
        self.held.fetch_sub(self.bytes.len(), Ordering::SeqCst);
    }
}

fn burn(duration: Duration) -> u64 {
    let started = Instant::now();
    let mut spins = 0u64;
    while started.elapsed() < duration {
        spins = std::hint::black_box(spins.wrapping_add(1));
    }
    spins
}

pub struct ChaosScript {
    real: Arc<dyn ScriptHost>,
    core: Arc<InterceptorCore<ScriptFault>>,
    shadow: WriteShadow<String, Value>,
    /// Dropped timers by the instant they would have fired.
    dropped_timers: Mutex<HashMap<TimerId, tokio::time::Instant>>,
    next_dropped: AtomicU64,
    ballast_bytes: Arc<AtomicUsize>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn ScriptHost>) -> Arc<ChaosScript> {
    let chaos = Arc::new(ChaosScript {
        real,
        core: Arc::new(InterceptorCore::new(ctx, "script", menu())),
        shadow: WriteShadow::new(),
        dropped_timers: Mutex::new(HashMap::new()),
        next_dropped: AtomicU64::new(DROPPED_TIMER_BASE),
        ballast_bytes: Arc::new(AtomicUsize::new(0)),
    });
    let weak: Weak<ChaosScript> = Arc::downgrade(&chaos);
    let started = chaos
        .core
        .scheduler()
        .schedule_interval(PRESSURE_PERIOD, move || {
            if let Some(chaos) = weak.upgrade() {
                chaos.pressure_tick();
            }
        });
    if !started {
        debug!("script: pressure ticker not started");
    }
    chaos
}

impl ChaosScript {
    /// Bytes of ballast currently held.
    pub fn ballast_bytes(&self) -> usize {
        self.ballast_bytes.load(Ordering::SeqCst)
    }

    fn pressure_tick(&self) {
        if let Some(fault) = self.core.decide(MEMORY, MEMORY_PRESSURE) {
            let mib = self.core.draw_ms(BALLAST_MIB) as usize;
            let hold_ms = self.core.draw_ms(BALLAST_HOLD_MS);
            self.core.emit(
                MEMORY,
                fault,
                format!("holding {mib} MiB of ballast for {hold_ms}ms"),
                hold_ms,
            );
            let ballast = Ballast::allocate(mib * 1024 * 1024, self.ballast_bytes.clone());
            self.core.defer(hold_ms, move || drop(ballast));
        }
        if let Some(fault) = self.core.decide(CPU, CPU_PRESSURE) {
            let burn_ms = self.core.draw_ms(BURN_MS);
            self.core.emit(
                CPU,
                fault,
                format!("burning a blocking thread for {burn_ms}ms"),
                burn_ms,
            );
            let scheduled = self.core.scheduler().schedule(Duration::ZERO, async move {
                let spun = tokio::task::spawn_blocking(move || burn(Duration::from_millis(burn_ms)));
                if let Err(error) = spun.await {
                    warn!("script: cpu burn failed: {error}");
                }
            });
            if !scheduled {
                debug!("script: cpu burn skipped");
            }
        }
    }

    fn stale_global(&self, name: &str) -> Result<Value, ScriptError> {
        let previous = self.shadow.previous(&name.to_string());
        let description = match previous {
            Some(_) => format!("{name} served its value before the latest assignment"),
            None => format!("{name} had no older value; served current"),
        };
        self.core
            .emit(CATEGORY, ScriptFault::StaleGlobal, description, 0);
        match previous {
            Some(value) => Ok(value),
            None => self.real.global(name),
        }
    }
}

impl ScriptHost for ChaosScript {
    fn global(&self, name: &str) -> Result<Value, ScriptError> {
        let Some(fault) = self.core.decide(CATEGORY, READ_GLOBAL) else {
            return self.real.global(name);
        };
        match fault {
            ScriptFault::CorruptGlobal => {
                let mut value = self.real.global(name)?;
                match self.core.rng().with(|rng| corrupt_value(&mut value, rng)) {
                    Some(corruption) => {
                        self.core.emit(
                            CATEGORY,
                            fault,
                            format!("{name} corrupted at {corruption}"),
                            0,
                        );
                        Ok(value)
                    }
                    None => self.stale_global(name),
                }
            }
            ScriptFault::UndefinedGlobal => {
                self.core
                    .emit(CATEGORY, fault, format!("{name} reported undefined"), 0);
                Err(ScriptError::Reference(name.to_string()))
            }
            _ => self.stale_global(name),
        }
    }

    fn set_global(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        let Some(fault) = self.core.decide(CATEGORY, WRITE_GLOBAL) else {
            self.real.set_global(name, value.clone())?;
            if !self.core.is_detached() {
                self.shadow.observe(name.to_string(), value);
            }
            return Ok(());
        };
        match fault {
            ScriptFault::ReadonlyViolation => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("assignment to {name} rejected as read-only"),
                    0,
                );
                Err(ScriptError::ReadOnly(name.to_string()))
            }
            _ => {
                let delay_ms = self.core.draw_ms(100..=1500);
                self.core.emit(
                    CATEGORY,
                    ScriptFault::DeferredAssignment,
                    format!("assignment to {name} deferred by {delay_ms}ms"),
                    delay_ms,
                );
                self.shadow.observe(name.to_string(), value.clone());
                let (real, name) = (self.real.clone(), name.to_string());
                self.core.defer(delay_ms, move || {
                    if let Err(error) = real.set_global(&name, value) {
                        warn!("script: deferred assignment to {name} failed: {error}");
                    }
                });
                Ok(())
            }
        }
    }

    fn global_names(&self) -> Vec<String> {
        self.real.global_names()
    }

    fn evaluate(&self, source: String) -> BoxFuture<'static, Result<Value, ScriptError>> {
        let Some(fault) = self.core.decide(CATEGORY, EVALUATE) else {
            return self.real.evaluate(source);
        };
        let (core, real) = (self.core.clone(), self.real.clone());
        match fault {
            ScriptFault::ExecutionTimeout => {
                let after_ms = core.draw_ms(1000..=5000);
                core.emit(
                    CATEGORY,
                    fault,
                    format!("evaluation timed out after {after_ms}ms"),
                    after_ms,
                );
                async move {
                    core.pause(after_ms).await;
                    Err(ScriptError::Timeout { after_ms })
                }
                .boxed()
            }
            _ => {
                let delay_ms = core.draw_ms(100..=2000);
                core.emit(
                    CATEGORY,
                    ScriptFault::SlowExecution,
                    format!("evaluation slowed by {delay_ms}ms"),
                    delay_ms,
                );
                async move {
                    core.pause(delay_ms).await;
                    real.evaluate(source).await
                }
                .boxed()
            }
        }
    }

    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId, ScriptError> {
        let Some(fault) = self.core.decide(CATEGORY, TIMER) else {
            return self.real.set_timeout(delay, callback);
        };
        match fault {
            ScriptFault::TimerDrop => {
                let id = TimerId(self.next_dropped.fetch_add(1, Ordering::Relaxed));
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("timer of {}ms never fires", delay.as_millis()),
                    0,
                );
                let now = tokio::time::Instant::now();
                let mut dropped = self.dropped_timers.lock();
                // Like a real timer, a dropped one is forgotten once its delay passes.
                dropped.retain(|_, due| *due > now);
                dropped.insert(id, now + delay);
                drop(dropped);
                drop(callback);
                Ok(id)
            }
            _ => {
                let drift_ms = self.core.draw_ms(50..=500);
                self.core.emit(
                    CATEGORY,
                    ScriptFault::TimerDrift,
                    format!(
                        "timer of {}ms drifts by {drift_ms}ms",
                        delay.as_millis()
                    ),
                    drift_ms,
                );
                self.real
                    .set_timeout(delay + Duration::from_millis(drift_ms), callback)
            }
        }
    }

    fn clear_timeout(&self, id: TimerId) -> bool {
        if let Some(due) = self.dropped_timers.lock().remove(&id) {
            return due > tokio::time::Instant::now();
        }
        self.real.clear_timeout(id)
    }
}

impl InterceptorHandle for ChaosScript {
    fn name(&self) -> &'static str {
        "script"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        self.shadow.clear();
        self.dropped_timers.lock().clear();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}
