/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Portable kernel for faultshell.
//!
//! Everything an interceptor needs to decide and describe a fault lives here:
//! the shared [`SharedConfig`], the [`DecisionGate`], the seedable
//! [`ChaosRng`], the per-interceptor [`FaultMenu`] tables, the
//! [`ChaosEvent`] record and its bounded [`ChaosHistory`], payload
//! corruption helpers, and the [`ChaosScheduler`] that owns every deferred
//! fault so teardown can cancel them deterministically.

pub mod category;
pub mod config;
pub mod corruption;
pub mod event;
pub mod gate;
pub mod history;
pub mod menu;
pub mod rng;
pub mod scheduler;

pub use category::{ChaosCategory, KNOWN_CATEGORIES};
pub use config::{ChaosConfig, ChaosSettings, ConfigError, DEFAULT_PROBABILITY, SharedConfig};
pub use corruption::{Corruption, corrupt_json_text, corrupt_value};
pub use event::{ChaosEvent, ChaosEventInput, ChaosImpact, ChaosLog, ChaosLogEntry, now_unix_ms};
pub use gate::DecisionGate;
pub use history::{ChaosHistory, DEFAULT_HISTORY_CAPACITY};
pub use menu::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, apply_safe_mode, pick_one};
pub use rng::ChaosRng;
pub use scheduler::ChaosScheduler;
