/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Chaos orchestrator: setup and teardown of every interceptor.
//!
//! Owns:
//! - the live [`SharedConfig`] every gate and interceptor reads
//! - the bounded [`ChaosHistory`] fed by the shared [`ChaosLog`]
//! - the root [`ChaosScheduler`]; each interceptor gets a child of it
//! - the wrapped [`Platform`] and the teardown handles, in install order
//!
//! Setup is the only way to reach `Active`; [`ChaosOrchestrator::destroy`]
//! moves to `Destroyed`, which is terminal.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use faultshell_core::{
    ChaosConfig, ChaosEvent, ChaosHistory, ChaosLog, ChaosLogEntry, ChaosRng, ChaosScheduler,
    ChaosSettings, DEFAULT_HISTORY_CAPACITY, DecisionGate, SharedConfig,
};
use faultshell_runtime::Platform;
use log::{debug, info, warn};

use super::controls::{ChaosControls, ControlSurface};
use super::diagnostics::{LogSink, NullSink};
use crate::interceptors::{
    CleanupError, InterceptorContext, InterceptorHandle, InterceptorStatus, install_all,
};

pub struct SetupOptions {
    pub sink: Arc<dyn LogSink>,
    pub mount: Option<Arc<dyn ControlSurface>>,
    pub config: ChaosConfig,
    /// Fixed seed for reproducible fault sequences.
    pub seed: Option<u64>,
    pub history_capacity: usize,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            sink: Arc::new(NullSink),
            mount: None,
            config: ChaosConfig::default(),
            seed: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl SetupOptions {
    pub fn from_settings(settings: ChaosSettings) -> Self {
        Self {
            config: settings.chaos,
            seed: settings.seed,
            history_capacity: settings
                .history_capacity
                .unwrap_or(DEFAULT_HISTORY_CAPACITY),
            ..Self::default()
        }
    }

    pub fn with_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_mount(mut self, surface: Arc<dyn ControlSurface>) -> Self {
        self.mount = Some(surface);
        self
    }

    pub fn with_config(mut self, config: ChaosConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Destroyed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DestroyReport {
    pub already_destroyed: bool,
    /// Interceptors whose cleanup succeeded, in teardown order.
    pub cleaned: Vec<&'static str>,
    pub failures: Vec<CleanupError>,
}

impl DestroyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ChaosOrchestrator {
    config: SharedConfig,
    history: ChaosHistory,
    scheduler: ChaosScheduler,
    platform: Platform,
    handles: Vec<Arc<dyn InterceptorHandle>>,
    surface: Option<Arc<dyn ControlSurface>>,
    controls: ChaosControls,
    destroyed: AtomicBool,
}

impl ChaosOrchestrator {
    /// Wrap every subsystem of `real` and mount the control surface. Must be
    /// called inside a tokio runtime; otherwise deferred faults are disabled.
    pub fn setup(real: Platform, options: SetupOptions) -> Self {
        let SetupOptions {
            sink,
            mount,
            config,
            seed,
            history_capacity,
        } = options;
        let config = SharedConfig::new(config);
        let history = ChaosHistory::new(history_capacity);
        let rng = match seed {
            Some(seed) => ChaosRng::seeded(seed),
            None => ChaosRng::from_entropy(),
        };
        let scheduler = ChaosScheduler::new("chaos");
        let ctx = InterceptorContext {
            log: chaos_log(history.clone(), sink),
            gate: DecisionGate::new(config.clone(), rng.clone()),
            config: config.clone(),
            rng,
            scheduler: scheduler.clone(),
        };
        let (platform, handles) = install_all(&ctx, real);
        let controls = ChaosControls::new(config.clone(), history.clone(), mount.clone());
        if let Some(surface) = &mount {
            surface.mount(controls.clone());
        }
        info!(
            "orchestrator: active with {} interceptors (enabled={}, probability={}, safe_mode={})",
            handles.len(),
            config.is_enabled(),
            config.probability(),
            config.safe_mode()
        );
        Self {
            config,
            history,
            scheduler,
            platform,
            handles,
            surface: mount,
            controls,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn get_config(&self) -> ChaosConfig {
        self.config.snapshot()
    }

    pub fn get_history(&self) -> Vec<ChaosEvent> {
        self.history.snapshot()
    }

    pub fn clear_history(&self) {
        self.controls.clear_history();
    }

    pub fn controls(&self) -> ChaosControls {
        self.controls.clone()
    }

    /// The wrapped subsystems. After [`Self::destroy`] every entry point
    /// passes straight through.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn handles(&self) -> Vec<InterceptorStatus> {
        self.handles
            .iter()
            .map(|handle| InterceptorStatus::of(handle.as_ref()))
            .collect()
    }

    pub fn state(&self) -> LifecycleState {
        if self.destroyed.load(Ordering::SeqCst) {
            LifecycleState::Destroyed
        } else {
            LifecycleState::Active
        }
    }

    /// Disable chaos, clean up every interceptor once, cancel every scheduled
    /// fault and unmount the control surface. A second call does nothing.
    pub fn destroy(&self) -> DestroyReport {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("orchestrator: destroy called again, ignoring");
            return DestroyReport {
                already_destroyed: true,
                ..DestroyReport::default()
            };
        }
        self.config.set_enabled(false);

        let mut report = DestroyReport::default();
        for handle in &self.handles {
            let name = handle.name();
            match panic::catch_unwind(AssertUnwindSafe(|| handle.cleanup())) {
                Ok(Ok(())) => report.cleaned.push(name),
                Ok(Err(error)) => {
                    warn!("orchestrator: {error}");
                    report.failures.push(error);
                }
                Err(payload) => {
                    let error = CleanupError::Panicked {
                        interceptor: name,
                        message: panic_message(payload.as_ref()),
                    };
                    warn!("orchestrator: {error}");
                    report.failures.push(error);
                }
            }
        }
        self.scheduler.cancel_all();

        if let Some(surface) = &self.surface
            && panic::catch_unwind(AssertUnwindSafe(|| surface.unmount())).is_err()
        {
            warn!("orchestrator: control surface panicked while unmounting");
        }
        info!(
            "orchestrator: destroyed ({} cleaned, {} failed)",
            report.cleaned.len(),
            report.failures.len()
        );
        report
    }

    #[cfg(test)]
    pub(crate) fn push_handle(&mut self, handle: Arc<dyn InterceptorHandle>) {
        self.handles.push(handle);
    }
}

impl Drop for ChaosOrchestrator {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Active {
            self.destroy();
        }
    }
}

impl std::fmt::Debug for ChaosOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosOrchestrator")
            .field("state", &self.state())
            .field("config", &self.config.snapshot())
            .field("history_len", &self.history.len())
            .field("interceptors", &self.handles.len())
            .finish()
    }
}

/// Logger shared by every interceptor: stamp, append to history, forward.
/// A panicking sink is contained so the intercepted call still completes.
fn chaos_log(history: ChaosHistory, sink: Arc<dyn LogSink>) -> ChaosLog {
    ChaosLog::new(move |input| {
        let event = ChaosEvent::from_input(input);
        let entry = ChaosLogEntry::from(&event);
        history.push(event);
        if panic::catch_unwind(AssertUnwindSafe(|| sink.record(&entry))).is_err() {
            warn!("orchestrator: log sink panicked on {}", entry.kind);
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::diagnostics::ChannelSink;
    use faultshell_runtime::{FetchRequest, FetchResponse, StaticNetwork};
    use serde_json::json;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    fn platform() -> Platform {
        let network = StaticNetwork::new();
        network.route("https://app.test/api", FetchResponse::json(&json!({"ok": true})));
        Platform::in_memory(Url::parse("https://app.test/").unwrap()).with_network(Arc::new(network))
    }

    fn chaotic(categories: &[&str]) -> ChaosConfig {
        ChaosConfig::default()
            .with_enabled(true)
            .with_probability(1.0)
            .with_categories(categories.iter().copied())
    }

    #[derive(Default)]
    struct RecordingSurface {
        calls: Mutex<Vec<&'static str>>,
    }

    impl ControlSurface for RecordingSurface {
        fn mount(&self, _controls: ChaosControls) {
            self.calls.lock().push("mount");
        }

        fn history_cleared(&self) {
            self.calls.lock().push("history_cleared");
        }

        fn unmount(&self) {
            self.calls.lock().push("unmount");
        }
    }

    struct CountingHandle {
        cleanups: AtomicUsize,
        panics: bool,
    }

    impl InterceptorHandle for CountingHandle {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn cleanup(&self) -> Result<(), CleanupError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("teardown exploded");
            }
            Ok(())
        }

        fn is_detached(&self) -> bool {
            self.cleanups.load(Ordering::SeqCst) > 0
        }

        fn active_resources(&self) -> usize {
            0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_history_and_sink() {
        let (sink, rx) = ChannelSink::unbounded();
        let chaos = ChaosOrchestrator::setup(
            platform(),
            SetupOptions::default()
                .with_sink(sink)
                .with_config(chaotic(&["network"]))
                .with_seed(1),
        );
        let _ = chaos
            .platform()
            .network
            .fetch(FetchRequest::get(Url::parse("https://app.test/api").unwrap()))
            .await;

        let history = chaos.get_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].kind().starts_with("network."));
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.id, history[0].id());
        assert_eq!(entry.category, format!("chaos.{}", history[0].kind()));
    }

    #[tokio::test]
    async fn clear_history_then_one_event() {
        let surface = Arc::new(RecordingSurface::default());
        let chaos = ChaosOrchestrator::setup(
            platform(),
            SetupOptions::default()
                .with_mount(surface.clone())
                .with_config(chaotic(&["storage"]))
                .with_seed(3),
        );
        let storage = chaos.platform().storage.clone();
        let _ = storage.get("a");
        let _ = storage.get("b");
        assert_eq!(chaos.get_history().len(), 2);

        chaos.clear_history();
        assert!(chaos.get_history().is_empty());
        let _ = storage.get("c");
        assert_eq!(chaos.get_history().len(), 1);
        assert_eq!(*surface.calls.lock(), vec!["mount", "history_cleared"]);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let chaos = ChaosOrchestrator::setup(
            platform(),
            SetupOptions {
                history_capacity: 3,
                ..SetupOptions::default().with_config(chaotic(&["storage"]))
            },
        );
        for key in 0..10 {
            let _ = chaos.platform().storage.get(&key.to_string());
        }
        assert_eq!(chaos.get_history().len(), 3);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_disables_chaos() {
        let surface = Arc::new(RecordingSurface::default());
        let mut chaos = ChaosOrchestrator::setup(
            platform(),
            SetupOptions::default()
                .with_mount(surface.clone())
                .with_config(chaotic(&["storage", "network"])),
        );
        let counting = Arc::new(CountingHandle {
            cleanups: AtomicUsize::new(0),
            panics: false,
        });
        chaos.push_handle(counting.clone());

        let first = chaos.destroy();
        assert!(!first.already_destroyed);
        assert!(first.is_clean());
        assert_eq!(first.cleaned.len(), 13);
        assert_eq!(chaos.state(), LifecycleState::Destroyed);
        assert!(!chaos.get_config().enabled);
        assert!(chaos.handles().iter().all(|status| status.detached));

        let second = chaos.destroy();
        assert!(second.already_destroyed);
        assert!(second.cleaned.is_empty());
        assert_eq!(counting.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(*surface.calls.lock(), vec!["mount", "unmount"]);
    }

    #[tokio::test]
    async fn a_panicking_cleanup_does_not_stop_the_rest() {
        let mut chaos = ChaosOrchestrator::setup(platform(), SetupOptions::default());
        chaos.push_handle(Arc::new(CountingHandle {
            cleanups: AtomicUsize::new(0),
            panics: true,
        }));
        let report = chaos.destroy();
        assert_eq!(report.cleaned.len(), 12);
        assert_eq!(
            report.failures,
            vec![CleanupError::Panicked {
                interceptor: "counting",
                message: "teardown exploded".into(),
            }]
        );
    }

    #[tokio::test]
    async fn after_destroy_storage_behaves_like_the_real_one() {
        let chaos = ChaosOrchestrator::setup(
            platform(),
            SetupOptions::default().with_config(chaotic(&["storage"])),
        );
        chaos.destroy();
        chaos.controls().set_enabled(true);
        let storage = chaos.platform().storage.clone();
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k"), Ok(Some("v".to_string())));
        assert!(chaos.get_history().is_empty());
    }

    #[test]
    fn settings_carry_seed_and_capacity() {
        let options = SetupOptions::from_settings(ChaosSettings {
            chaos: ChaosConfig::default().with_enabled(true),
            seed: Some(9),
            history_capacity: Some(42),
        });
        assert!(options.config.enabled);
        assert_eq!(options.seed, Some(9));
        assert_eq!(options.history_capacity, 42);
    }
}
