/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::ChaosEvent;

pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Bounded, append-only log of chaos events.
///
/// Clones share the same backing store, so [`Self::clear`] is observed by
/// every holder.
#[derive(Clone, Debug)]
pub struct ChaosHistory {
    entries: Arc<Mutex<VecDeque<ChaosEvent>>>,
    capacity: usize,
}

impl ChaosHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, event: ChaosEvent) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<ChaosEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ChaosHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChaosEventInput;

    fn event(kind: &str) -> ChaosEvent {
        ChaosEvent::from_input(ChaosEventInput::new(kind, kind))
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let history = ChaosHistory::new(2);
        history.push(event("a.one"));
        history.push(event("a.two"));
        history.push(event("a.three"));

        let kinds = history
            .snapshot()
            .iter()
            .map(|event| event.kind().to_string())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["a.two", "a.three"]);
    }

    #[test]
    fn clear_is_visible_through_every_clone() {
        let history = ChaosHistory::default();
        let observer = history.clone();
        history.push(event("a.one"));
        history.push(event("a.two"));
        assert_eq!(observer.len(), 2);

        observer.clear();
        assert!(history.is_empty());

        history.push(event("a.three"));
        let snapshot = observer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind(), "a.three");
    }

    #[test]
    fn snapshot_is_a_copy() {
        let history = ChaosHistory::default();
        history.push(event("a.one"));
        let mut snapshot = history.snapshot();
        snapshot.clear();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let history = ChaosHistory::new(0);
        history.push(event("a.one"));
        history.push(event("a.two"));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.snapshot()[0].kind(), "a.two");
    }
}
