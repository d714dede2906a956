/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Command line of the `faultshell` drill binary.
//!
//! Settings are layered: the TOML file (explicit `--config`, else the
//! per-user default location), then `FAULTSHELL_CHAOS_*` variables, then
//! flags.

use std::path::PathBuf;

use bpaf::Bpaf;
use faultshell_core::ChaosSettings;
use log::{debug, warn};
use url::Url;

use crate::interceptors::registered_interceptors;
use crate::runtime::drill::DrillTargets;

/// Run a synthetic workload against an in-memory platform with chaos
/// installed and print every injected fault.
#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
pub struct DrillOptions {
    /// Settings file (TOML)
    #[bpaf(long, argument("PATH"))]
    pub config: Option<PathBuf>,
    /// Turn chaos on regardless of the settings file
    #[bpaf(long)]
    pub enable: bool,
    /// Trigger probability in percent
    #[bpaf(long, argument("PCT"))]
    pub probability: Option<f64>,
    /// Allow error, drop and structural faults
    #[bpaf(long("unsafe"))]
    pub unsafe_mode: bool,
    /// Restrict chaos to this category; repeatable
    #[bpaf(long("category"), argument("TAG"))]
    pub categories: Vec<String>,
    /// Seed for a reproducible fault sequence
    #[bpaf(long, argument("SEED"))]
    pub seed: Option<u64>,
    /// Fetch the profile from this URL over HTTP instead of the built-in route
    #[bpaf(long, argument("URL"))]
    pub api: Option<Url>,
    /// Open the workload socket to this ws:// echo server
    #[bpaf(long, argument("URL"))]
    pub socket: Option<Url>,
    /// Workload rounds
    #[bpaf(long, argument("N"), fallback(20), display_fallback)]
    pub rounds: usize,
    /// Print chaos log entries as JSON lines
    #[bpaf(long)]
    pub json: bool,
    /// List every interceptor's fault variants and exit
    #[bpaf(long)]
    pub list_variants: bool,
    /// Print the effective settings as TOML and exit
    #[bpaf(long)]
    pub dump_config: bool,
}

/// `<config dir>/faultshell/chaos.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("faultshell").join("chaos.toml"))
}

/// Resolve the effective settings. A missing default file is not an
/// error; a missing or malformed explicit file falls back to defaults.
pub fn resolve_settings<I>(options: &DrillOptions, env: I) -> ChaosSettings
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut settings = match &options.config {
        Some(path) => ChaosSettings::load_or_default(path),
        None => match default_config_path().filter(|path| path.exists()) {
            Some(path) => {
                debug!("cli: loading {}", path.display());
                ChaosSettings::load_or_default(&path)
            }
            None => ChaosSettings::default(),
        },
    };
    settings.chaos.apply_env_overrides(env);

    if options.enable {
        settings.chaos.enabled = true;
    }
    if let Some(percent) = options.probability {
        if percent.is_finite() && (0.0..=100.0).contains(&percent) {
            settings.chaos.probability = percent / 100.0;
        } else {
            warn!("cli: ignoring --probability {percent}, expected 0-100");
        }
    }
    if options.unsafe_mode {
        settings.chaos.safe_mode = false;
    }
    if !options.categories.is_empty() {
        settings.chaos.allowed_categories = options.categories.iter().cloned().collect();
    }
    if options.seed.is_some() {
        settings.seed = options.seed;
    }
    settings
}

/// Built-in targets, overridden by `--api` and `--socket`.
pub fn resolve_targets(options: &DrillOptions) -> Result<DrillTargets, url::ParseError> {
    let mut targets = DrillTargets::in_memory()?;
    if let Some(api) = &options.api {
        targets.api = api.clone();
    }
    if let Some(socket) = &options.socket {
        targets.socket = socket.clone();
    }
    Ok(targets)
}

pub fn dump_settings(settings: &ChaosSettings) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(settings)
}

/// One block per interceptor: surfaces, variants, family and safe fallback.
pub fn variant_listing() -> String {
    let mut out = String::new();
    for registration in registered_interceptors() {
        out.push_str(&format!(
            "{} [{}]\n",
            registration.name,
            registration.categories.join(", ")
        ));
        let fallbacks = (registration.fallbacks)();
        for menu in (registration.catalog)() {
            out.push_str(&format!("  {}\n", menu.surface));
            for (variant, family) in &menu.variants {
                let fallback = fallbacks
                    .iter()
                    .find(|(name, _, _)| name == variant)
                    .map(|(_, fallback, _)| *fallback)
                    .filter(|fallback| fallback != variant);
                match fallback {
                    Some(fallback) => out.push_str(&format!(
                        "    {variant:<24} {:<12} safe: {fallback}\n",
                        family.label()
                    )),
                    None => out.push_str(&format!("    {variant:<24} {}\n", family.label())),
                }
            }
        }
    }
    out
}

#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_err()
    {
        debug!("cli: a global subscriber was already installed");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn init_tracing() {}
