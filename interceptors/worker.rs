/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Background worker wrapper.
//!
//! A slow startup spawns the real worker right away but parks every message
//! posted to it until the startup delay elapses, then delivers them in order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value};
use faultshell_runtime::{WorkerError, WorkerHost, WorkerId, WorkerSpec};
use log::warn;
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "worker";
const SPAWN: &str = "worker.spawn";
const POST: &str = "worker.post";

const STARTUP_MS: std::ops::RangeInclusive<u64> = 200..=2000;
const MESSAGE_DELAY_MS: std::ops::RangeInclusive<u64> = 50..=1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerFault {
    SlowStartup,
    SpawnFailure,
    DelayedMessage,
    LostMessage,
    CorruptMessage,
    DuplicateMessage,
    UnexpectedTermination,
}

impl FaultVariant for WorkerFault {
    fn name(self) -> &'static str {
        match self {
            Self::SlowStartup => "slow-startup",
            Self::SpawnFailure => "spawn-failure",
            Self::DelayedMessage => "delayed-message",
            Self::LostMessage => "lost-message",
            Self::CorruptMessage => "corrupt-message",
            Self::DuplicateMessage => "duplicate-message",
            Self::UnexpectedTermination => "unexpected-termination",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::SlowStartup | Self::DelayedMessage => FaultFamily::Latency,
            Self::SpawnFailure | Self::UnexpectedTermination => FaultFamily::Error,
            Self::LostMessage => FaultFamily::Drop,
            Self::CorruptMessage => FaultFamily::Corruption,
            Self::DuplicateMessage => FaultFamily::Duplication,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::SpawnFailure => Self::SlowStartup,
            Self::LostMessage | Self::UnexpectedTermination => Self::DelayedMessage,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<WorkerFault> {
    use WorkerFault::*;
    FaultMenu::new()
        .with(SPAWN, &[SlowStartup, SpawnFailure])
        .with(
            POST,
            &[
                DelayedMessage,
                LostMessage,
                CorruptMessage,
                DuplicateMessage,
                UnexpectedTermination,
            ],
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
        name: "worker",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

type Starting = Arc<Mutex<BTreeMap<WorkerId, Vec<Value>>>>;

/// Post everything parked for `id`, in order. Returns the first failure.
fn release(real: &dyn WorkerHost, starting: &Starting, id: WorkerId) -> Result<(), WorkerError> {
    let parked = starting.lock().remove(&id).unwrap_or_default();
    let mut outcome = Ok(());
    for message in parked {
        if let Err(error) = real.post(id, message) {
            outcome = outcome.and(Err(error));
        }
    }
    outcome
}

pub struct ChaosWorkers {
    real: Arc<dyn WorkerHost>,
    core: InterceptorCore<WorkerFault>,
    starting: Starting,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn WorkerHost>) -> Arc<ChaosWorkers> {
    Arc::new(ChaosWorkers {
        real,
        core: InterceptorCore::new(ctx, "worker", menu()),
        starting: Arc::new(Mutex::new(BTreeMap::new())),
    })
}

impl ChaosWorkers {
    /// Workers whose startup is still being held back.
    pub fn starting(&self) -> usize {
        self.starting.lock().len()
    }

    fn slow_start(&self, spec: WorkerSpec) -> Result<WorkerId, WorkerError> {
        let delay_ms = self.core.draw_ms(STARTUP_MS);
        self.core.emit(
            CATEGORY,
            WorkerFault::SlowStartup,
            format!("{} starts after {delay_ms}ms", spec.name),
            delay_ms,
        );
        let id = self.real.spawn(spec)?;
        self.starting.lock().insert(id, Vec::new());
        let (real, starting) = (self.real.clone(), self.starting.clone());
        let scheduled = self
            .core
            .scheduler()
            .schedule_fn(Duration::from_millis(delay_ms), move || {
                if let Err(error) = release(real.as_ref(), &starting, id) {
                    warn!("worker: releasing messages for {id} failed: {error}");
                }
            });
        if !scheduled {
            release(self.real.as_ref(), &self.starting, id)?;
        }
        Ok(id)
    }

    fn delay(&self, id: WorkerId, message: Value) -> Result<(), WorkerError> {
        let delay_ms = self.core.draw_ms(MESSAGE_DELAY_MS);
        self.core.emit(
            CATEGORY,
            WorkerFault::DelayedMessage,
            format!("message to {id} delayed by {delay_ms}ms"),
            delay_ms,
        );
        let real = self.real.clone();
        self.core.defer(delay_ms, move || {
            if let Err(error) = real.post(id, message) {
                warn!("worker: delayed message failed: {error}");
            }
        });
        Ok(())
    }
}

impl WorkerHost for ChaosWorkers {
    fn spawn(&self, spec: WorkerSpec) -> Result<WorkerId, WorkerError> {
        let Some(fault) = self.core.decide(CATEGORY, SPAWN) else {
            return self.real.spawn(spec);
        };
        match fault {
            WorkerFault::SpawnFailure => {
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{} failed to start", spec.name),
                    0,
                );
                Err(WorkerError::SpawnFailed(spec.name))
            }
            _ => self.slow_start(spec),
        }
    }

    fn post(&self, id: WorkerId, mut message: Value) -> Result<(), WorkerError> {
        if let Some(parked) = self.starting.lock().get_mut(&id) {
            parked.push(message);
            return Ok(());
        }
        let Some(fault) = self.core.decide(CATEGORY, POST) else {
            return self.real.post(id, message);
        };
        match fault {
            WorkerFault::LostMessage => {
                self.core
                    .emit(CATEGORY, fault, format!("message to {id} lost"), 0);
                Ok(())
            }
            WorkerFault::UnexpectedTermination => {
                self.core
                    .emit(CATEGORY, fault, format!("{id} terminated"), 0);
                self.real.terminate(id);
                Err(WorkerError::Terminated(id))
            }
            WorkerFault::CorruptMessage => {
                match self.core.rng().with(|rng| corrupt_value(&mut message, rng)) {
                    Some(corruption) => {
                        self.core.emit(
                            CATEGORY,
                            fault,
                            format!("message to {id} corrupted at {corruption}"),
                            0,
                        );
                        self.real.post(id, message)
                    }
                    None => self.delay(id, message),
                }
            }
            WorkerFault::DuplicateMessage => {
                let copies = self.core.draw_copies();
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("message to {id} delivered {copies} extra times"),
                    0,
                );
                self.real.post(id, message.clone())?;
                for offset in self.core.stagger(copies) {
                    let (real, copy) = (self.real.clone(), message.clone());
                    self.core.defer(offset.as_millis() as u64, move || {
                        if let Err(error) = real.post(id, copy) {
                            warn!("worker: repeated message to {id} failed: {error}");
                        }
                    });
                }
                Ok(())
            }
            _ => self.delay(id, message),
        }
    }

    fn terminate(&self, id: WorkerId) -> bool {
        self.starting.lock().remove(&id);
        self.real.terminate(id)
    }

    fn running(&self) -> Vec<WorkerId> {
        self.real.running()
    }
}

impl InterceptorHandle for ChaosWorkers {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        let held = self.starting.lock().keys().copied().collect::<Vec<_>>();
        let mut failures = Vec::new();
        for id in held {
            if let Err(error) = release(self.real.as_ref(), &self.starting, id) {
                failures.push(error.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::FlushFailed {
                interceptor: "worker",
                message: failures.join("; "),
            })
        }
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending() + self.starting()
    }
}
