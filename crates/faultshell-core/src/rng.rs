/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Shared random source for the gate and every interceptor.
///
/// Seeding it makes a whole session's fault sequence reproducible as long as
/// calls arrive in the same order.
#[derive(Clone, Debug)]
pub struct ChaosRng {
    inner: Arc<Mutex<StdRng>>,
}

impl ChaosRng {
    pub fn from_entropy() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rng)),
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn unit(&self) -> f64 {
        self.inner.lock().gen_range(0.0..1.0)
    }

    /// Uniform draw in `range`; an empty range yields its start.
    pub fn range(&self, range: Range<u64>) -> u64 {
        if range.is_empty() {
            return range.start;
        }
        self.inner.lock().gen_range(range)
    }

    /// Uniform index below `len`; `0` when `len` is `0`.
    pub fn index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.inner.lock().gen_range(0..len)
    }

    pub fn chance(&self, probability: f64) -> bool {
        probability.is_finite() && self.unit() < probability
    }

    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut *self.inner.lock())
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.inner.lock());
    }

    /// Run `f` with exclusive access to the underlying generator.
    pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl Default for ChaosRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
