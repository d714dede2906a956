/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::config::SharedConfig;
use crate::rng::ChaosRng;

/// Answers "should this call be chaotic?" for a category tag.
///
/// True iff chaos is enabled, the category is allowed, and a fresh draw in
/// `[0, 1)` falls below the configured probability. The draw is only taken
/// once the cheap checks pass.
#[derive(Clone, Debug)]
pub struct DecisionGate {
    config: SharedConfig,
    rng: ChaosRng,
}

impl DecisionGate {
    pub fn new(config: SharedConfig, rng: ChaosRng) -> Self {
        Self { config, rng }
    }

    pub fn should_trigger(&self, category: &str) -> bool {
        let (enabled, allowed, probability) = self.config.gate_inputs(category);
        if !enabled || !allowed {
            return false;
        }
        self.rng.unit() < probability
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::KNOWN_CATEGORIES;
    use crate::config::ChaosConfig;
    use proptest::prelude::*;

    fn gate(config: ChaosConfig, seed: u64) -> DecisionGate {
        DecisionGate::new(SharedConfig::new(config), ChaosRng::seeded(seed))
    }

    #[test]
    fn probability_one_always_triggers() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(1.0),
            5,
        );
        let hits = (0..1000).filter(|_| gate.should_trigger("network")).count();
        assert_eq!(hits, 1000);
    }

    #[test]
    fn probability_zero_never_triggers() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(0.0),
            5,
        );
        assert!((0..5000).all(|_| !gate.should_trigger("network")));
    }

    #[test]
    fn rate_tracks_probability() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(0.3),
            99,
        );
        let hits = (0..10_000).filter(|_| gate.should_trigger("dom")).count();
        assert!((2_600..3_400).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn disabling_mid_session_stops_triggering_immediately() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(1.0),
            1,
        );
        assert!(gate.should_trigger("cookie"));
        gate.config().set_enabled(false);
        assert!((0..100).all(|_| !gate.should_trigger("cookie")));
    }

    #[test]
    fn unknown_category_is_never_triggered() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(1.0),
            1,
        );
        assert!(!gate.should_trigger("teleport"));
        assert!(!gate.should_trigger(""));
    }

    #[test]
    fn custom_category_triggers_once_allowed() {
        let gate = gate(
            ChaosConfig::default().with_enabled(true).with_probability(1.0),
            1,
        );
        assert!(!gate.should_trigger("gpu"));
        gate.config().allow_category("gpu");
        assert!(gate.should_trigger("gpu"));
    }

    proptest! {
        #[test]
        fn proptest_disallowed_categories_never_trigger(
            probability in 0.0_f64..=1.0,
            enabled in any::<bool>(),
            index in 0_usize..KNOWN_CATEGORIES.len(),
            seed in any::<u64>(),
        ) {
            let category = KNOWN_CATEGORIES[index];
            let config = ChaosConfig::default()
                .with_enabled(enabled)
                .with_probability(probability)
                .with_categories(KNOWN_CATEGORIES.iter().filter(|tag| **tag != category).copied());
            let gate = gate(config, seed);
            for _ in 0..50 {
                prop_assert!(!gate.should_trigger(category));
            }
        }

        #[test]
        fn proptest_disabled_config_never_triggers(
            probability in 0.0_f64..=1.0,
            index in 0_usize..KNOWN_CATEGORIES.len(),
            seed in any::<u64>(),
        ) {
            let config = ChaosConfig::default()
                .with_enabled(false)
                .with_probability(probability);
            let gate = gate(config, seed);
            for _ in 0..50 {
                prop_assert!(!gate.should_trigger(KNOWN_CATEGORIES[index]));
            }
        }
    }
}
