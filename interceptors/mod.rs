/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Chaos wrappers, one per subsystem trait.
//!
//! Every wrapper follows the same contract:
//!
//! 1. The gate is consulted once at the top of each wrapped entry point. A
//!    negative answer (or a detached wrapper) calls the captured real
//!    implementation with the caller's arguments and returns its result.
//! 2. Otherwise one variant is drawn from the surface's [`FaultMenu`], the
//!    safe-mode policy is applied, exactly one event is emitted, and the
//!    variant executes.
//! 3. `cleanup()` detaches the wrapper, cancels its scheduled tasks and
//!    flushes anything it was holding back to the real implementation.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use faultshell_core::{
    ChaosEventInput, ChaosLog, ChaosRng, ChaosScheduler, DecisionGate, FaultMenu, FaultVariant,
    MenuDescription, SharedConfig,
};
use faultshell_runtime::Platform;
use log::debug;
use parking_lot::Mutex;

pub mod cookie;
pub mod database;
pub mod dom;
pub mod events;
pub mod navigation;
pub mod network;
pub mod script;
pub mod service_worker;
pub mod storage;
pub mod timing;
pub mod websocket;
pub mod worker;

const STAGGER_MIN: Duration = Duration::from_millis(40);
const STAGGER_MAX: Duration = Duration::from_millis(1500);

/// What the orchestrator hands every interceptor at install time.
#[derive(Clone, Debug)]
pub struct InterceptorContext {
    pub log: ChaosLog,
    pub gate: DecisionGate,
    pub config: SharedConfig,
    pub rng: ChaosRng,
    pub scheduler: ChaosScheduler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupError {
    FlushFailed {
        interceptor: &'static str,
        message: String,
    },
    Panicked {
        interceptor: &'static str,
        message: String,
    },
}

impl std::fmt::Display for CleanupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlushFailed {
                interceptor,
                message,
            } => write!(f, "{interceptor}: failed to flush held work: {message}"),
            Self::Panicked {
                interceptor,
                message,
            } => write!(f, "{interceptor}: cleanup panicked: {message}"),
        }
    }
}

impl std::error::Error for CleanupError {}

/// Teardown and introspection side of an installed wrapper.
pub trait InterceptorHandle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detach, cancel scheduled work, flush held work. Idempotent.
    fn cleanup(&self) -> Result<(), CleanupError>;

    fn is_detached(&self) -> bool;

    /// Scheduled tasks plus anything held back (buffered events, starting
    /// workers, open sockets).
    fn active_resources(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorStatus {
    pub name: &'static str,
    pub detached: bool,
    pub active_resources: usize,
}

impl InterceptorStatus {
    pub fn of(handle: &dyn InterceptorHandle) -> Self {
        Self {
            name: handle.name(),
            detached: handle.is_detached(),
            active_resources: handle.active_resources(),
        }
    }
}

/// Shared machinery of every wrapper: gate, menu, event emission, the
/// interceptor's own scheduler and its detach flag.
pub(crate) struct InterceptorCore<V: FaultVariant> {
    name: &'static str,
    log: ChaosLog,
    gate: DecisionGate,
    config: SharedConfig,
    rng: ChaosRng,
    scheduler: ChaosScheduler,
    menu: FaultMenu<V>,
    detached: AtomicBool,
}

impl<V: FaultVariant> InterceptorCore<V> {
    pub(crate) fn new(ctx: &InterceptorContext, name: &'static str, menu: FaultMenu<V>) -> Self {
        Self {
            name,
            log: ctx.log.clone(),
            gate: ctx.gate.clone(),
            config: ctx.config.clone(),
            rng: ctx.rng.clone(),
            scheduler: ctx.scheduler.child(name),
            menu,
            detached: AtomicBool::new(false),
        }
    }

    /// One gate evaluation followed, on success, by one variant draw with
    /// safe mode applied. `None` means "pass through".
    pub(crate) fn decide(&self, category: &str, surface: &str) -> Option<V> {
        if self.is_detached() || !self.gate.should_trigger(category) {
            return None;
        }
        self.menu.choose(surface, &self.rng, self.config.safe_mode())
    }

    pub(crate) fn emit(&self, category: &str, variant: V, description: impl Into<String>, duration_ms: u64) {
        let family = variant.family();
        self.log.emit(
            ChaosEventInput::new(format!("{category}.{}", variant.name()), description)
                .duration_ms(duration_ms)
                .impact(family.impact())
                .recoverable(family.recoverable()),
        );
    }

    pub(crate) fn rng(&self) -> &ChaosRng {
        &self.rng
    }

    pub(crate) fn scheduler(&self) -> &ChaosScheduler {
        &self.scheduler
    }

    /// Uniform draw in `range`, inclusive.
    pub(crate) fn draw_ms(&self, range: RangeInclusive<u64>) -> u64 {
        self.rng.range(*range.start()..range.end().saturating_add(1))
    }

    pub(crate) fn draw_copies(&self) -> usize {
        self.draw_ms(1..=3) as usize
    }

    /// Offsets for `copies` repeated deliveries: exponential steps with a
    /// jitter of up to half a step drawn from the shared rng.
    pub(crate) fn stagger(&self, copies: usize) -> Vec<Duration> {
        ExponentialBuilder::default()
            .with_min_delay(STAGGER_MIN)
            .with_max_delay(STAGGER_MAX)
            .with_factor(2.0)
            .with_max_times(copies)
            .build()
            .map(|step| {
                let jitter = self.rng.range(0..(step.as_millis() as u64 / 2).max(1));
                step + Duration::from_millis(jitter)
            })
            .collect()
    }

    /// Sleep inline; returns early if the interceptor is torn down.
    pub(crate) async fn pause(&self, duration_ms: u64) {
        self.scheduler.delay(Duration::from_millis(duration_ms)).await;
    }

    /// Run `f` after `duration_ms` on this interceptor's scheduler.
    pub(crate) fn defer(&self, duration_ms: u64, f: impl FnOnce() + Send + 'static) {
        if !self
            .scheduler
            .schedule_fn(Duration::from_millis(duration_ms), f)
        {
            debug!("{}: deferred work dropped, scheduler unavailable", self.name);
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Detach and cancel scheduled work. Returns `false` if already detached.
    pub(crate) fn shutdown(&self) -> bool {
        let was_attached = !self.detached.swap(true, Ordering::SeqCst);
        self.scheduler.cancel_all();
        if was_attached {
            debug!("{}: detached", self.name);
        }
        was_attached
    }

    pub(crate) fn pending(&self) -> usize {
        self.scheduler.pending()
    }
}

/// Previous and latest value written through a wrapper, per key. Serves
/// stale reads without touching the real implementation.
pub(crate) struct WriteShadow<K, V> {
    entries: Mutex<HashMap<K, (Option<V>, V)>>,
}

impl<K: Eq + Hash, V: Clone> WriteShadow<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn observe(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        let previous = entries.remove(&key).map(|(_, latest)| latest);
        entries.insert(key, (previous, value));
    }

    pub(crate) fn forget(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// The value that was current before the latest write, if any.
    pub(crate) fn previous(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).and_then(|(previous, _)| previous.clone())
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Variant catalog of one interceptor, collected for `--list-variants` and
/// coverage tests.
#[derive(Debug, Clone)]
pub struct InterceptorRegistration {
    pub name: &'static str,
    pub categories: &'static [&'static str],
    pub catalog: fn() -> Vec<MenuDescription>,
    /// Every (variant, safe fallback) pair as (name, fallback name, fallback
    /// guarded).
    pub fallbacks: fn() -> Vec<(&'static str, &'static str, bool)>,
}

inventory::collect!(InterceptorRegistration);

pub fn registered_interceptors() -> Vec<&'static InterceptorRegistration> {
    let mut registrations = inventory::iter::<InterceptorRegistration>
        .into_iter()
        .collect::<Vec<_>>();
    registrations.sort_by_key(|registration| registration.name);
    registrations
}

pub(crate) fn fallback_table<V: FaultVariant>(menu: &FaultMenu<V>) -> Vec<(&'static str, &'static str, bool)> {
    menu.fallback_pairs()
        .into_iter()
        .map(|(variant, fallback)| {
            (
                variant.name(),
                fallback.name(),
                fallback.family().is_guarded(),
            )
        })
        .collect()
}

/// Wrap every subsystem of `real`. Returns the wrapped bundle and the
/// teardown handles in install order.
pub fn install_all(
    ctx: &InterceptorContext,
    real: Platform,
) -> (Platform, Vec<Arc<dyn InterceptorHandle>>) {
    let network = network::install(ctx, real.network);
    let storage = storage::install(ctx, real.storage);
    let dom = dom::install(ctx, real.dom);
    let script = script::install(ctx, real.script);
    let events = events::install(ctx, real.events);
    let websocket = websocket::install(ctx, real.websocket);
    let history = navigation::install(ctx, real.history);
    let cookies = cookie::install(ctx, real.cookies);
    let workers = worker::install(ctx, real.workers);
    let (service_workers, caches) =
        service_worker::install(ctx, real.service_workers, real.caches);
    let timing = timing::install(ctx, real.timing);
    let database = database::install(ctx, real.database);

    let handles: Vec<Arc<dyn InterceptorHandle>> = vec![
        network.clone(),
        storage.clone(),
        dom.clone(),
        script.clone(),
        events.clone(),
        websocket.clone(),
        history.clone(),
        cookies.clone(),
        workers.clone(),
        service_workers.clone(),
        timing.clone(),
        database.clone(),
    ];
    let platform = Platform {
        network,
        storage,
        dom,
        script,
        events,
        websocket,
        history,
        cookies,
        workers,
        service_workers,
        caches,
        timing,
        database,
    };
    (platform, handles)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use faultshell_core::{ChaosConfig, ChaosEvent};

    /// Context with a capturing log; the scheduler binds to the current
    /// runtime when there is one.
    pub(crate) struct Harness {
        pub(crate) ctx: InterceptorContext,
        pub(crate) events: Arc<Mutex<Vec<ChaosEvent>>>,
    }

    impl Harness {
        pub(crate) fn new(config: ChaosConfig, seed: u64) -> Self {
            let config = SharedConfig::new(config);
            let rng = ChaosRng::seeded(seed);
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            let ctx = InterceptorContext {
                log: ChaosLog::new(move |input| sink.lock().push(ChaosEvent::from_input(input))),
                gate: DecisionGate::new(config.clone(), rng.clone()),
                config,
                rng,
                scheduler: ChaosScheduler::new("test"),
            };
            Self { ctx, events }
        }

        /// Every call triggers; safe mode as given.
        pub(crate) fn always(safe_mode: bool, seed: u64) -> Self {
            Self::new(
                ChaosConfig::default()
                    .with_enabled(true)
                    .with_probability(1.0)
                    .with_safe_mode(safe_mode),
                seed,
            )
        }

        pub(crate) fn never() -> Self {
            Self::new(ChaosConfig::default(), 0)
        }

        pub(crate) fn kinds(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .map(|event| event.kind().to_string())
                .collect()
        }

        pub(crate) fn event_count(&self) -> usize {
            self.events.lock().len()
        }

        pub(crate) fn assert_all_recoverable(&self) {
            for event in self.events.lock().iter() {
                assert!(event.recoverable(), "unrecoverable event in safe mode: {}", event.kind());
            }
        }
    }
}
