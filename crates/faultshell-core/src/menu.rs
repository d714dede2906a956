/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fault variant tables.
//!
//! Each interceptor owns a [`FaultMenu`] mapping the surfaces it wraps
//! (`"storage.write"`, `"network.fetch"`, ...) to an ordered list of its own
//! variant enum. Selection is one uniform pick followed by the safe-mode
//! policy: guarded families are swapped for the variant's declared fallback.

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::event::ChaosImpact;
use crate::rng::ChaosRng;

/// Pick one element uniformly at random.
pub fn pick_one<'a, T, R: Rng + ?Sized>(rng: &mut R, items: &'a [T]) -> Option<&'a T> {
    items.choose(rng)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultFamily {
    Latency,
    Error,
    Corruption,
    Duplication,
    Reorder,
    Batch,
    Drop,
    Structural,
}

impl FaultFamily {
    /// Families that safe mode never lets through.
    pub fn is_guarded(self) -> bool {
        matches!(
            self,
            FaultFamily::Error | FaultFamily::Drop | FaultFamily::Structural
        )
    }

    pub fn impact(self) -> ChaosImpact {
        match self {
            FaultFamily::Latency | FaultFamily::Duplication => ChaosImpact::Low,
            FaultFamily::Corruption | FaultFamily::Reorder | FaultFamily::Batch => {
                ChaosImpact::Medium
            }
            FaultFamily::Error | FaultFamily::Drop | FaultFamily::Structural => ChaosImpact::High,
        }
    }

    pub fn recoverable(self) -> bool {
        !self.is_guarded()
    }

    pub fn label(self) -> &'static str {
        match self {
            FaultFamily::Latency => "latency",
            FaultFamily::Error => "error",
            FaultFamily::Corruption => "corruption",
            FaultFamily::Duplication => "duplication",
            FaultFamily::Reorder => "reorder",
            FaultFamily::Batch => "batch",
            FaultFamily::Drop => "drop",
            FaultFamily::Structural => "structural",
        }
    }
}

pub trait FaultVariant: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Event type suffix, e.g. `delay` in `network.delay`.
    fn name(self) -> &'static str;

    fn family(self) -> FaultFamily;

    /// Variant executed instead when safe mode rejects this one. Must not be
    /// guarded itself.
    fn safe_fallback(self) -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuDescription {
    pub surface: &'static str,
    pub variants: Vec<(&'static str, FaultFamily)>,
}

#[derive(Debug, Clone)]
pub struct FaultMenu<V> {
    table: BTreeMap<&'static str, Vec<V>>,
}

impl<V: FaultVariant> FaultMenu<V> {
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    pub fn with(mut self, surface: &'static str, variants: &[V]) -> Self {
        self.table.insert(surface, variants.to_vec());
        self
    }

    pub fn variants(&self, surface: &str) -> &[V] {
        self.table.get(surface).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn surfaces(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.keys().copied()
    }

    /// Uniform pick from `surface`, then the safe-mode downgrade.
    pub fn choose(&self, surface: &str, rng: &ChaosRng, safe_mode: bool) -> Option<V> {
        let picked = *rng.pick(self.variants(surface))?;
        Some(apply_safe_mode(picked, safe_mode))
    }

    pub fn describe(&self) -> Vec<MenuDescription> {
        self.table
            .iter()
            .map(|(surface, variants)| MenuDescription {
                surface,
                variants: variants
                    .iter()
                    .map(|variant| (variant.name(), variant.family()))
                    .collect(),
            })
            .collect()
    }

    /// Every variant of every surface, each paired with its safe fallback.
    pub fn fallback_pairs(&self) -> Vec<(V, V)> {
        self.table
            .values()
            .flatten()
            .map(|variant| (*variant, variant.safe_fallback()))
            .collect()
    }
}

impl<V: FaultVariant> Default for FaultMenu<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn apply_safe_mode<V: FaultVariant>(variant: V, safe_mode: bool) -> V {
    if safe_mode && variant.family().is_guarded() {
        variant.safe_fallback()
    } else {
        variant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Demo {
        Delay,
        Fail,
        Wipe,
    }

    impl FaultVariant for Demo {
        fn name(self) -> &'static str {
            match self {
                Demo::Delay => "delay",
                Demo::Fail => "fail",
                Demo::Wipe => "wipe",
            }
        }

        fn family(self) -> FaultFamily {
            match self {
                Demo::Delay => FaultFamily::Latency,
                Demo::Fail => FaultFamily::Error,
                Demo::Wipe => FaultFamily::Structural,
            }
        }

        fn safe_fallback(self) -> Self {
            Demo::Delay
        }
    }

    fn menu() -> FaultMenu<Demo> {
        FaultMenu::new()
            .with("demo.write", &[Demo::Delay, Demo::Fail, Demo::Wipe])
            .with("demo.read", &[Demo::Delay])
    }

    #[test]
    fn pick_one_is_uniform_enough() {
        let mut rng = StdRng::seed_from_u64(17);
        let items = [0_usize, 1, 2, 3];
        let mut counts = [0_usize; 4];
        for _ in 0..8000 {
            counts[*pick_one(&mut rng, &items).expect("non-empty")] += 1;
        }
        for count in counts {
            assert!((1700..2300).contains(&count), "counts = {counts:?}");
        }
    }

    #[test]
    fn pick_one_on_empty_is_none() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(pick_one::<u8, _>(&mut rng, &[]).is_none());
    }

    #[test]
    fn safe_mode_never_yields_guarded_variants() {
        let menu = menu();
        let rng = ChaosRng::seeded(4);
        for _ in 0..500 {
            let variant = menu.choose("demo.write", &rng, true).expect("variant");
            assert!(!variant.family().is_guarded());
        }
    }

    #[test]
    fn unsafe_mode_reaches_every_variant() {
        let menu = menu();
        let rng = ChaosRng::seeded(4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(menu.choose("demo.write", &rng, false).expect("variant"));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn unknown_surface_has_no_variants() {
        let rng = ChaosRng::seeded(4);
        assert!(menu().choose("demo.nothing", &rng, false).is_none());
    }

    #[test]
    fn describe_lists_surfaces_in_order() {
        let described = menu().describe();
        assert_eq!(described[0].surface, "demo.read");
        assert_eq!(described[1].surface, "demo.write");
        assert_eq!(described[1].variants[2], ("wipe", FaultFamily::Structural));
    }

    #[test]
    fn guarded_families_are_high_impact_and_unrecoverable() {
        for family in [FaultFamily::Error, FaultFamily::Drop, FaultFamily::Structural] {
            assert_eq!(family.impact(), ChaosImpact::High);
            assert!(!family.recoverable());
        }
        assert!(FaultFamily::Latency.recoverable());
    }
}
