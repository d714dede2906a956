/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Session history (`history`) and location (`url`) wrapper.

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value};
use faultshell_runtime::{HistoryEntry, NavigationError, NavigationHistory};
use log::warn;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const HISTORY: &str = "history";
const URL: &str = "url";
const PUSH: &str = "history.push";
const TRAVERSE: &str = "history.traverse";
const LOCATION: &str = "url.location";
const ASSIGN: &str = "url.assign";

const NAV_DELAY_MS: std::ops::RangeInclusive<u64> = 100..=2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationFault {
    DelayedPush,
    DroppedPush,
    CorruptState,
    DuplicateEntry,
    DelayedTraversal,
    IgnoredTraversal,
    Overshoot,
    MangledQuery,
    StaleLocation,
    DelayedNavigation,
    BlockedNavigation,
}

impl FaultVariant for NavigationFault {
    fn name(self) -> &'static str {
        match self {
            Self::DelayedPush => "delayed-push",
            Self::DroppedPush => "dropped-push",
            Self::CorruptState => "corrupt-state",
            Self::DuplicateEntry => "duplicate-entry",
            Self::DelayedTraversal => "delayed-traversal",
            Self::IgnoredTraversal => "ignored-traversal",
            Self::Overshoot => "overshoot",
            Self::MangledQuery => "mangled-query",
            Self::StaleLocation => "stale-location",
            Self::DelayedNavigation => "delayed-navigation",
            Self::BlockedNavigation => "blocked-navigation",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::DelayedPush
            | Self::DelayedTraversal
            | Self::StaleLocation
            | Self::DelayedNavigation => FaultFamily::Latency,
            Self::DroppedPush => FaultFamily::Drop,
            Self::CorruptState | Self::MangledQuery => FaultFamily::Corruption,
            Self::DuplicateEntry => FaultFamily::Duplication,
            Self::IgnoredTraversal | Self::Overshoot | Self::BlockedNavigation => {
                FaultFamily::Error
            }
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::DroppedPush => Self::DelayedPush,
            Self::IgnoredTraversal | Self::Overshoot => Self::DelayedTraversal,
            Self::BlockedNavigation => Self::DelayedNavigation,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<NavigationFault> {
    use NavigationFault::*;
    FaultMenu::new()
        .with(PUSH, &[DelayedPush, DroppedPush, CorruptState, DuplicateEntry])
        .with(TRAVERSE, &[DelayedTraversal, IgnoredTraversal, Overshoot])
        .with(LOCATION, &[MangledQuery, StaleLocation])
        .with(ASSIGN, &[DelayedNavigation, BlockedNavigation])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "navigation",
        categories: &[HISTORY, URL],
        catalog,
        fallbacks,
    }
}

/// Reverse the value of one query pair. `None` when there is no query.
fn mangle_query(url: &Url, pick: impl FnOnce(usize) -> usize) -> Option<(Url, String)> {
    let mut pairs = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        return None;
    }
    let index = pick(pairs.len());
    let (key, value) = &mut pairs[index];
    *value = value.chars().rev().collect();
    let key = key.clone();
    let mut mangled = url.clone();
    mangled.query_pairs_mut().clear().extend_pairs(pairs);
    Some((mangled, key))
}

#[derive(Clone, Copy)]
enum PushKind {
    Push,
    Replace,
}

impl PushKind {
    fn label(self) -> &'static str {
        match self {
            Self::Push => "pushState",
            Self::Replace => "replaceState",
        }
    }

    fn apply(
        self,
        real: &dyn NavigationHistory,
        state: Value,
        url: Option<&str>,
    ) -> Result<(), NavigationError> {
        match self {
            Self::Push => real.push_state(state, url),
            Self::Replace => real.replace_state(state, url),
        }
    }
}

pub struct ChaosHistory {
    real: Arc<dyn NavigationHistory>,
    core: InterceptorCore<NavigationFault>,
    /// Location before the latest navigation made through this wrapper.
    previous_location: Mutex<Option<Url>>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn NavigationHistory>) -> Arc<ChaosHistory> {
    Arc::new(ChaosHistory {
        real,
        core: InterceptorCore::new(ctx, "navigation", menu()),
        previous_location: Mutex::new(None),
    })
}

impl ChaosHistory {
    /// Run a navigation against the real history, remembering where it
    /// started from if it moved the location.
    fn navigate(
        &self,
        apply: impl FnOnce(&dyn NavigationHistory) -> Result<(), NavigationError>,
    ) -> Result<(), NavigationError> {
        if self.core.is_detached() {
            return apply(self.real.as_ref());
        }
        let before = self.real.location();
        apply(self.real.as_ref())?;
        if self.real.location() != before {
            *self.previous_location.lock() = Some(before);
        }
        Ok(())
    }

    fn delayed(
        &self,
        category: &str,
        variant: NavigationFault,
        what: String,
        apply: impl FnOnce(&dyn NavigationHistory) -> Result<(), NavigationError> + Send + 'static,
    ) -> Result<(), NavigationError> {
        let delay_ms = self.core.draw_ms(NAV_DELAY_MS);
        self.core.emit(
            category,
            variant,
            format!("{what} delayed by {delay_ms}ms"),
            delay_ms,
        );
        let real = self.real.clone();
        self.core.defer(delay_ms, move || {
            if let Err(error) = apply(real.as_ref()) {
                warn!("navigation: delayed {what} failed: {error}");
            }
        });
        Ok(())
    }

    fn push_or_replace(
        &self,
        kind: PushKind,
        mut state: Value,
        url: Option<&str>,
    ) -> Result<(), NavigationError> {
        let Some(fault) = self.core.decide(HISTORY, PUSH) else {
            return self.navigate(|real| kind.apply(real, state, url));
        };
        let label = kind.label();
        match fault {
            NavigationFault::DroppedPush => {
                self.core
                    .emit(HISTORY, fault, format!("{label} silently dropped"), 0);
                Ok(())
            }
            NavigationFault::CorruptState => {
                match self.core.rng().with(|rng| corrupt_value(&mut state, rng)) {
                    Some(corruption) => {
                        self.core.emit(
                            HISTORY,
                            fault,
                            format!("{label} state corrupted at {corruption}"),
                            0,
                        );
                        self.navigate(|real| kind.apply(real, state, url))
                    }
                    None => self.delay_push(kind, state, url),
                }
            }
            NavigationFault::DuplicateEntry if matches!(kind, PushKind::Push) => {
                self.core.emit(
                    HISTORY,
                    fault,
                    format!("{label} recorded twice"),
                    0,
                );
                self.navigate(|real| {
                    real.push_state(state.clone(), url)?;
                    real.push_state(state, url)
                })
            }
            _ => self.delay_push(kind, state, url),
        }
    }

    fn delay_push(&self, kind: PushKind, state: Value, url: Option<&str>) -> Result<(), NavigationError> {
        let url = url.map(str::to_string);
        self.delayed(
            HISTORY,
            NavigationFault::DelayedPush,
            kind.label().to_string(),
            move |real| kind.apply(real, state, url.as_deref()),
        )
    }

    fn stale_location(&self) -> Url {
        let previous = self.previous_location.lock().clone();
        match previous {
            Some(url) => {
                self.core.emit(
                    URL,
                    NavigationFault::StaleLocation,
                    format!("location reported as {url} from before the latest navigation"),
                    0,
                );
                url
            }
            None => {
                self.core.emit(
                    URL,
                    NavigationFault::StaleLocation,
                    "no earlier location; reported current",
                    0,
                );
                self.real.location()
            }
        }
    }
}

impl NavigationHistory for ChaosHistory {
    fn push_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError> {
        self.push_or_replace(PushKind::Push, state, url)
    }

    fn replace_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError> {
        self.push_or_replace(PushKind::Replace, state, url)
    }

    fn go(&self, delta: i64) -> Result<(), NavigationError> {
        let Some(fault) = self.core.decide(HISTORY, TRAVERSE) else {
            return self.navigate(|real| real.go(delta));
        };
        match fault {
            NavigationFault::IgnoredTraversal => {
                self.core
                    .emit(HISTORY, fault, format!("go({delta}) ignored"), 0);
                Ok(())
            }
            NavigationFault::Overshoot => {
                let overshot = delta.saturating_add(if delta < 0 { -1 } else { 1 });
                self.core.emit(
                    HISTORY,
                    fault,
                    format!("go({delta}) overshot to go({overshot})"),
                    0,
                );
                self.navigate(|real| real.go(overshot))
            }
            _ => self.delayed(
                HISTORY,
                NavigationFault::DelayedTraversal,
                format!("go({delta})"),
                move |real| real.go(delta),
            ),
        }
    }

    fn current(&self) -> HistoryEntry {
        self.real.current()
    }

    fn length(&self) -> usize {
        self.real.length()
    }

    fn location(&self) -> Url {
        let Some(fault) = self.core.decide(URL, LOCATION) else {
            return self.real.location();
        };
        if fault == NavigationFault::MangledQuery {
            let current = self.real.location();
            let rng = self.core.rng();
            if let Some((mangled, key)) = mangle_query(&current, |len| rng.index(len)) {
                self.core.emit(
                    URL,
                    fault,
                    format!("query parameter {key:?} reversed"),
                    0,
                );
                return mangled;
            }
        }
        self.stale_location()
    }

    fn assign(&self, url: &str) -> Result<(), NavigationError> {
        let Some(fault) = self.core.decide(URL, ASSIGN) else {
            return self.navigate(|real| real.assign(url));
        };
        match fault {
            NavigationFault::BlockedNavigation => {
                self.core
                    .emit(URL, fault, format!("navigation to {url} blocked"), 0);
                Err(NavigationError::Blocked(url.to_string()))
            }
            _ => {
                let target = url.to_string();
                self.delayed(
                    URL,
                    NavigationFault::DelayedNavigation,
                    format!("navigation to {url}"),
                    move |real| real.assign(&target),
                )
            }
        }
    }
}

impl InterceptorHandle for ChaosHistory {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        self.previous_location.lock().take();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::testing::Harness;
    use faultshell_core::ChaosConfig;
    use faultshell_runtime::MemoryHistory;
    use serde_json::json;
    use std::time::Duration;

    fn start() -> Url {
        Url::parse("https://app.test/inbox?folder=work&page=2").unwrap()
    }

    fn only(category: &str, safe_mode: bool, seed: u64) -> Harness {
        Harness::new(
            ChaosConfig::default()
                .with_enabled(true)
                .with_probability(1.0)
                .with_safe_mode(safe_mode)
                .with_categories([category]),
            seed,
        )
    }

    #[test]
    fn mangling_reverses_exactly_one_value() {
        let (mangled, key) = mangle_query(&start(), |_| 0).unwrap();
        assert_eq!(key, "folder");
        assert_eq!(mangled.query(), Some("folder=krow&page=2"));
        assert_eq!(mangle_query(&Url::parse("https://app.test/").unwrap(), |_| 0), None);
    }

    #[test]
    fn pass_through_navigation() {
        let harness = Harness::never();
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());

        chaos.push_state(json!({"tab": 1}), Some("/sent")).unwrap();
        chaos.back().unwrap();
        assert_eq!(chaos.location(), start());
        assert_eq!(chaos.length(), 2);
        assert_eq!(harness.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extreme_traversals_are_refused_without_overflow() {
        let harness = only("history", false, 8);
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());
        chaos.push_state(json!({"tab": 1}), Some("/sent")).ok();
        let pushes = harness.event_count();

        for _ in 0..30 {
            let _ = chaos.go(i64::MAX);
            let _ = chaos.go(i64::MIN);
        }
        assert_eq!(harness.event_count(), pushes + 60);
        assert!(harness.kinds().iter().any(|kind| kind == "history.overshoot"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(real.length() <= 2);
        assert!(real.go(i64::MAX).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn safe_mode_pushes_land_eventually() {
        let harness = only("history", true, 14);
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());

        for page in 0..10 {
            chaos
                .push_state(json!({"page": page}), Some(&format!("/page/{page}")))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(real.length() >= 11);
        harness.assert_all_recoverable();
    }

    #[tokio::test]
    async fn stale_location_reports_where_the_app_came_from() {
        let harness = Harness::never();
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());
        chaos.assign("https://app.test/settings").unwrap();

        harness.ctx.config.replace(
            ChaosConfig::default()
                .with_enabled(true)
                .with_probability(1.0)
                .with_categories(["url"]),
        );
        let seen = (0..20).map(|_| chaos.location()).collect::<Vec<_>>();
        assert!(seen.contains(&start()));
        assert!(seen.iter().all(|url| url.path() == "/inbox"));
    }

    #[tokio::test]
    async fn unsafe_traversal_can_overshoot_or_be_ignored() {
        let harness = Harness::never();
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());
        for page in 0..3 {
            chaos.push_state(Value::Null, Some(&format!("/p{page}"))).unwrap();
        }
        harness.ctx.config.replace(
            ChaosConfig::default()
                .with_enabled(true)
                .with_probability(1.0)
                .with_safe_mode(false)
                .with_categories(["history"]),
        );

        let mut outcomes = Vec::new();
        for _ in 0..20 {
            let before = real.index();
            let result = chaos.go(-1);
            outcomes.push((before, real.index(), result.is_ok()));
            harness.ctx.config.set_enabled(false);
            chaos.go(3).ok();
            while real.index() + 1 < real.length() {
                chaos.forward().unwrap();
            }
            harness.ctx.config.set_enabled(true);
        }
        assert!(outcomes.iter().any(|(before, after, _)| before == after));
        assert!(outcomes.iter().any(|(before, after, _)| before - after == 2));
    }

    #[tokio::test]
    async fn blocked_navigation_surfaces_an_error() {
        let harness = only("url", false, 3);
        let real = Arc::new(MemoryHistory::new(start()));
        let chaos = install(&harness.ctx, real.clone());
        let blocked = (0..20)
            .filter(|_| {
                matches!(
                    chaos.assign("https://elsewhere.test/"),
                    Err(NavigationError::Blocked(_))
                )
            })
            .count();
        assert!(blocked > 0);
    }
}
