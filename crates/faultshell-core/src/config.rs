/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Chaos configuration.
//!
//! [`ChaosConfig`] is the plain value (what a settings file or a snapshot
//! holds). [`SharedConfig`] is the single live instance an orchestrator
//! hands to its gate and interceptors; it only exposes accessors and the
//! mutation points external controls are allowed to use.
//!
//! Every read fails closed: a probability that is not a finite number in
//! `[0, 1]` is treated as "no chaos" rather than "always chaos".

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::category::KNOWN_CATEGORIES;

pub const DEFAULT_PROBABILITY: f64 = 0.2;

const ENV_ENABLED: &str = "FAULTSHELL_CHAOS_ENABLED";
const ENV_PROBABILITY: &str = "FAULTSHELL_CHAOS_PROBABILITY";
const ENV_SAFE_MODE: &str = "FAULTSHELL_CHAOS_SAFE_MODE";
const ENV_CATEGORIES: &str = "FAULTSHELL_CHAOS_CATEGORIES";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub probability: f64,
    pub safe_mode: bool,
    pub allowed_categories: BTreeSet<String>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: DEFAULT_PROBABILITY,
            safe_mode: true,
            allowed_categories: KNOWN_CATEGORIES.iter().map(|tag| (*tag).to_string()).collect(),
        }
    }
}

impl ChaosConfig {
    pub fn allows(&self, category: &str) -> bool {
        self.allowed_categories.contains(category)
    }

    /// Probability actually used by the gate: clamped to `[0, 1]`, and `0`
    /// for anything that is not a finite number.
    pub fn effective_probability(&self) -> f64 {
        sanitize_probability(self.probability).unwrap_or(0.0)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    /// Apply `FAULTSHELL_CHAOS_*` overrides. Values that do not parse are
    /// ignored with a warning so a typo never turns chaos on by accident.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_ENABLED => match parse_flag(&value) {
                    Some(flag) => self.enabled = flag,
                    None => warn!("config: ignoring {ENV_ENABLED}={value:?}"),
                },
                ENV_SAFE_MODE => match parse_flag(&value) {
                    Some(flag) => self.safe_mode = flag,
                    None => warn!("config: ignoring {ENV_SAFE_MODE}={value:?}"),
                },
                ENV_PROBABILITY => {
                    match value
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|p| p.is_finite() && (0.0..=1.0).contains(p))
                    {
                        Some(probability) => self.probability = probability,
                        None => warn!("config: ignoring {ENV_PROBABILITY}={value:?}"),
                    }
                }
                ENV_CATEGORIES => {
                    self.allowed_categories = value
                        .split([',', ';'])
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }
    }
}

/// Settings file shape: the chaos config plus orchestrator options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosSettings {
    #[serde(flatten)]
    pub chaos: ChaosConfig,
    pub seed: Option<u64>,
    pub history_capacity: Option<usize>,
}

impl ChaosSettings {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: ChaosSettings =
            toml::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;
        let probability = settings.chaos.probability;
        if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
            return Err(ConfigError::InvalidProbability(probability));
        }
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Io(format!("{}: {error}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Like [`Self::load`], but a missing or malformed file yields the
    /// defaults (chaos disabled).
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(error) => {
                warn!("config: falling back to defaults ({error})");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidProbability(f64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "Parse error: {e}"),
            ConfigError::InvalidProbability(p) => {
                write!(f, "probability {p} is outside [0, 1]")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn sanitize_probability(probability: f64) -> Option<f64> {
    probability.is_finite().then(|| probability.clamp(0.0, 1.0))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// The live configuration shared by a gate and every interceptor.
#[derive(Clone, Debug, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<ChaosConfig>>,
}

impl SharedConfig {
    pub fn new(config: ChaosConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current configuration. Mutating it has no effect here.
    pub fn snapshot(&self) -> ChaosConfig {
        self.inner.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    pub fn safe_mode(&self) -> bool {
        self.inner.read().safe_mode
    }

    pub fn probability(&self) -> f64 {
        self.inner.read().effective_probability()
    }

    pub fn allows(&self, category: &str) -> bool {
        self.inner.read().allows(category)
    }

    /// Reads `(enabled, allowed, probability)` under one lock acquisition.
    pub(crate) fn gate_inputs(&self, category: &str) -> (bool, bool, f64) {
        let config = self.inner.read();
        (
            config.enabled,
            config.allows(category),
            config.effective_probability(),
        )
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.write().enabled = enabled;
    }

    /// Flip `enabled`, returning the new value.
    pub fn toggle_enabled(&self) -> bool {
        let mut config = self.inner.write();
        config.enabled = !config.enabled;
        config.enabled
    }

    pub fn set_probability(&self, probability: f64) {
        let sanitized = match sanitize_probability(probability) {
            Some(value) => value,
            None => {
                warn!("config: rejecting non-finite probability {probability}, using 0");
                0.0
            }
        };
        self.inner.write().probability = sanitized;
    }

    /// Slider mutation point: `probability = slider / 100`.
    pub fn set_probability_percent(&self, slider: f64) {
        self.set_probability(slider / 100.0);
    }

    pub fn set_safe_mode(&self, safe_mode: bool) {
        self.inner.write().safe_mode = safe_mode;
    }

    /// Returns `true` if the category was newly allowed.
    pub fn allow_category(&self, category: impl Into<String>) -> bool {
        self.inner.write().allowed_categories.insert(category.into())
    }

    /// Returns `true` if the category had been allowed.
    pub fn deny_category(&self, category: &str) -> bool {
        self.inner.write().allowed_categories.remove(category)
    }

    pub fn replace(&self, config: ChaosConfig) {
        *self.inner.write() = config;
    }
}
