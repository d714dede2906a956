/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Everything above the interceptors: lifecycle, control panel, log sinks
//! and the drill binary's plumbing.

pub mod cli;
pub mod controls;
pub mod diagnostics;
pub mod drill;
pub mod orchestrator;

pub use controls::{ChaosControls, ControlAction, ControlSurface};
pub use diagnostics::{ChannelSink, LogFacadeSink, LogSink, NullSink};
pub use orchestrator::{ChaosOrchestrator, DestroyReport, LifecycleState, SetupOptions};
