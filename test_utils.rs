/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Helpers for the scenario binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use faultshell_core::{ChaosConfig, ChaosLogEntry};
use faultshell_runtime::Platform;
use parking_lot::Mutex;
use url::Url;

use crate::runtime::{ChaosControls, ChaosOrchestrator, ControlSurface, LogSink, SetupOptions};

pub const TEST_ORIGIN: &str = "https://app.faultshell.test/";

/// Keeps every entry it is handed.
#[derive(Clone, Default)]
pub struct CapturingSink {
    entries: Arc<Mutex<Vec<ChaosLogEntry>>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ChaosLogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for CapturingSink {
    fn record(&self, entry: &ChaosLogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// Counts lifecycle notifications and keeps the mounted controls.
#[derive(Default)]
pub struct RecordingSurface {
    pub mounts: AtomicUsize,
    pub clears: AtomicUsize,
    pub unmounts: AtomicUsize,
    controls: Mutex<Option<ChaosControls>>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn controls(&self) -> Option<ChaosControls> {
        self.controls.lock().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl ControlSurface for RecordingSurface {
    fn mount(&self, controls: ChaosControls) {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        *self.controls.lock() = Some(controls);
    }

    fn history_cleared(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn unmount(&self) {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        self.controls.lock().take();
    }
}

pub fn test_platform() -> Platform {
    match Url::parse(TEST_ORIGIN) {
        Ok(origin) => Platform::in_memory(origin),
        Err(error) => panic!("test origin does not parse: {error}"),
    }
}

/// Orchestrator over `real` with a fixed seed and a capturing sink.
pub fn orchestrate(real: Platform, config: ChaosConfig, seed: u64) -> (ChaosOrchestrator, CapturingSink) {
    let sink = CapturingSink::new();
    let orchestrator = ChaosOrchestrator::setup(
        real,
        SetupOptions::default()
            .with_config(config)
            .with_seed(seed)
            .with_sink(sink.clone()),
    );
    (orchestrator, sink)
}

/// Every call triggers.
pub fn always(safe_mode: bool) -> ChaosConfig {
    ChaosConfig::default()
        .with_enabled(true)
        .with_probability(1.0)
        .with_safe_mode(safe_mode)
}
