/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The narrow interface an external control panel gets.
//!
//! A panel never sees interceptors. It reads config and history copies and
//! mutates the live config through [`ChaosControls`], either directly or by
//! dispatching serialized [`ControlAction`] messages.

use std::sync::Arc;

use faultshell_core::{ChaosConfig, ChaosEvent, ChaosHistory, SharedConfig};
use log::debug;
use serde::{Deserialize, Serialize};

/// Where a control panel is mounted. The orchestrator calls `mount` once at
/// setup, `history_cleared` after each clear, and `unmount` at teardown.
pub trait ControlSurface: Send + Sync {
    fn mount(&self, controls: ChaosControls);
    fn history_cleared(&self) {}
    fn unmount(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    SetEnabled { enabled: bool },
    ToggleEnabled,
    /// Slider position in percent.
    SetProbabilityPercent { percent: f64 },
    SetProbability { probability: f64 },
    SetSafeMode { safe_mode: bool },
    AllowCategory { category: String },
    DenyCategory { category: String },
    ClearHistory,
}

#[derive(Clone)]
pub struct ChaosControls {
    config: SharedConfig,
    history: ChaosHistory,
    surface: Option<Arc<dyn ControlSurface>>,
}

impl ChaosControls {
    pub(crate) fn new(
        config: SharedConfig,
        history: ChaosHistory,
        surface: Option<Arc<dyn ControlSurface>>,
    ) -> Self {
        Self {
            config,
            history,
            surface,
        }
    }

    pub fn config(&self) -> ChaosConfig {
        self.config.snapshot()
    }

    pub fn history(&self) -> Vec<ChaosEvent> {
        self.history.snapshot()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.config.set_enabled(enabled);
    }

    /// Returns the new value.
    pub fn toggle_enabled(&self) -> bool {
        self.config.toggle_enabled()
    }

    pub fn set_probability_percent(&self, slider: f64) {
        self.config.set_probability_percent(slider);
    }

    pub fn set_probability(&self, probability: f64) {
        self.config.set_probability(probability);
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.config.set_safe_mode(safe_mode);
    }

    pub fn allow_category(&self, category: impl Into<String>) -> bool {
        self.config.allow_category(category)
    }

    pub fn deny_category(&self, category: &str) -> bool {
        self.config.deny_category(category)
    }

    /// Truncate the shared history in place and tell the mounted surface.
    pub fn clear_history(&self) {
        self.history.clear();
        if let Some(surface) = &self.surface {
            surface.history_cleared();
        }
    }

    pub fn apply(&self, action: ControlAction) {
        debug!("controls: {action:?}");
        match action {
            ControlAction::SetEnabled { enabled } => self.set_enabled(enabled),
            ControlAction::ToggleEnabled => {
                self.toggle_enabled();
            }
            ControlAction::SetProbabilityPercent { percent } => {
                self.set_probability_percent(percent)
            }
            ControlAction::SetProbability { probability } => self.set_probability(probability),
            ControlAction::SetSafeMode { safe_mode } => self.set_safe_mode(safe_mode),
            ControlAction::AllowCategory { category } => {
                self.allow_category(category);
            }
            ControlAction::DenyCategory { category } => {
                self.deny_category(&category);
            }
            ControlAction::ClearHistory => self.clear_history(),
        }
    }
}

impl std::fmt::Debug for ChaosControls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosControls")
            .field("config", &self.config.snapshot())
            .field("history_len", &self.history.len())
            .field("mounted", &self.surface.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultshell_core::ChaosEventInput;
    use rstest::rstest;

    fn controls() -> ChaosControls {
        ChaosControls::new(
            SharedConfig::new(ChaosConfig::default()),
            ChaosHistory::new(10),
            None,
        )
    }

    #[rstest]
    #[case(r#"{"action":"set_enabled","enabled":true}"#, ControlAction::SetEnabled { enabled: true })]
    #[case(r#"{"action":"toggle_enabled"}"#, ControlAction::ToggleEnabled)]
    #[case(
        r#"{"action":"set_probability_percent","percent":35.0}"#,
        ControlAction::SetProbabilityPercent { percent: 35.0 }
    )]
    #[case(
        r#"{"action":"deny_category","category":"dom"}"#,
        ControlAction::DenyCategory { category: "dom".into() }
    )]
    fn actions_decode_from_panel_messages(#[case] raw: &str, #[case] expected: ControlAction) {
        assert_eq!(serde_json::from_str::<ControlAction>(raw).unwrap(), expected);
    }

    #[test]
    fn slider_percent_becomes_probability() {
        let controls = controls();
        controls.apply(ControlAction::SetProbabilityPercent { percent: 35.0 });
        assert!((controls.config().probability - 0.35).abs() < 1e-9);
    }

    #[test]
    fn category_actions_edit_the_allowed_set() {
        let controls = controls();
        controls.apply(ControlAction::DenyCategory {
            category: "network".into(),
        });
        assert!(!controls.config().allows("network"));
        controls.apply(ControlAction::AllowCategory {
            category: "network".into(),
        });
        assert!(controls.config().allows("network"));
    }

    #[test]
    fn toggle_flips_enabled() {
        let controls = controls();
        controls.apply(ControlAction::ToggleEnabled);
        assert!(controls.config().enabled);
        controls.apply(ControlAction::ToggleEnabled);
        assert!(!controls.config().enabled);
    }

    proptest::proptest! {
        #[test]
        fn slider_positions_land_in_the_unit_interval(slider in -500.0f64..500.0) {
            let controls = controls();
            controls.set_probability_percent(slider);
            let probability = controls.config().probability;
            proptest::prop_assert!((0.0..=1.0).contains(&probability));
        }
    }

    #[test]
    fn clear_history_truncates_the_shared_store() {
        let history = ChaosHistory::new(10);
        let controls = ChaosControls::new(SharedConfig::default(), history.clone(), None);
        history.push(ChaosEvent::from_input(ChaosEventInput::new("dom.missing-node", "x")));
        assert_eq!(controls.history().len(), 1);
        controls.apply(ControlAction::ClearHistory);
        assert!(history.is_empty());
    }
}
