/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Client-side fault injection.
//!
//! [`ChaosOrchestrator::setup`] wraps every subsystem of a [`Platform`] in a
//! chaos interceptor. While chaos is enabled each wrapped call may be
//! delayed, corrupted, dropped, duplicated or failed; every injected fault is
//! recorded as a [`ChaosEvent`] in a bounded history and forwarded to a
//! [`LogSink`]. [`ChaosOrchestrator::destroy`] restores pass-through
//! behaviour and cancels anything still scheduled.

pub mod interceptors;
pub mod net;
pub mod runtime;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use faultshell_core::{
    ChaosCategory, ChaosConfig, ChaosEvent, ChaosImpact, ChaosLogEntry, ChaosSettings,
    FaultFamily, SharedConfig,
};
pub use faultshell_runtime::Platform;
pub use interceptors::{InterceptorHandle, InterceptorStatus, registered_interceptors};
pub use runtime::{
    ChaosControls, ChaosOrchestrator, ControlAction, ControlSurface, DestroyReport,
    LifecycleState, LogSink, SetupOptions,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
