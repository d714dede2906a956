/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Delayed-task queue for deferred faults.
//!
//! Every latency, duplication, reorder and pressure fault that outlives the
//! intercepted call is spawned here instead of on a bare `tokio::spawn`, so
//! teardown can enumerate and cancel all of them at once.
//!
//! Owns:
//! - a [`CancellationToken`] (children are cancelled with their parent)
//! - a [`JoinSet`] supervising the scheduled tasks
//! - the runtime [`Handle`] captured at construction

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ChaosScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    label: &'static str,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    handle: Option<Handle>,
}

impl ChaosScheduler {
    /// Scheduler bound to the current tokio runtime. Outside a runtime every
    /// `schedule*` call is refused.
    pub fn new(label: &'static str) -> Self {
        let handle = Handle::try_current().ok();
        if handle.is_none() {
            warn!("scheduler[{label}]: created outside a tokio runtime; deferred faults disabled");
        }
        Self::build(label, CancellationToken::new(), handle)
    }

    pub fn with_handle(label: &'static str, handle: Handle) -> Self {
        Self::build(label, CancellationToken::new(), Some(handle))
    }

    fn build(label: &'static str, cancel: CancellationToken, handle: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                label,
                cancel,
                tasks: Mutex::new(JoinSet::new()),
                handle,
            }),
        }
    }

    /// Scheduler with its own task set whose token is cancelled together with
    /// this one.
    pub fn child(&self, label: &'static str) -> Self {
        Self::build(
            label,
            self.inner.cancel.child_token(),
            self.inner.handle.clone(),
        )
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Run `task` after `delay`. Returns `false` if the scheduler has been
    /// cancelled or has no runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            debug!("scheduler[{}]: refusing task after cancellation", self.inner.label);
            return false;
        }
        let Some(handle) = self.inner.handle.as_ref() else {
            return false;
        };
        let cancel = self.inner.cancel.clone();
        let mut tasks = self.inner.tasks.lock();
        reap_finished(&mut tasks);
        tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = async {
                        tokio::time::sleep(delay).await;
                        task.await;
                    } => {}
                }
            },
            handle,
        );
        true
    }

    pub fn schedule_fn(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> bool {
        self.schedule(delay, async move { f() })
    }

    /// Call `tick` every `period` (first call after one period) until cancelled.
    pub fn schedule_interval(&self, period: Duration, mut tick: impl FnMut() + Send + 'static) -> bool {
        self.schedule(Duration::ZERO, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                tick();
            }
        })
    }

    /// Sleep for `duration` inline, returning early once the scheduler is
    /// cancelled. Returns `false` if cut short.
    pub async fn delay(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// Cancel every outstanding task (and every child's). Idempotent.
    pub fn cancel_all(&self) {
        let was_cancelled = self.inner.cancel.is_cancelled();
        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks.lock();
        if !was_cancelled {
            debug!(
                "scheduler[{}]: cancelling {} tasks",
                self.inner.label,
                tasks.len()
            );
        }
        // Dropping the set aborts whatever is still in it.
        drop(std::mem::take(&mut *tasks));
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ChaosScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosScheduler")
            .field("label", &self.inner.label)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while tasks.try_join_next().is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_runs_after_delay() {
        let scheduler = ChaosScheduler::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        assert!(scheduler.schedule_fn(Duration::from_millis(500), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_prevents_pending_tasks_from_running() {
        let scheduler = ChaosScheduler::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        for delay in [100_u64, 200, 300] {
            let counter = hits.clone();
            scheduler.schedule_fn(Duration::from_millis(delay), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
        assert!(!scheduler.schedule_fn(Duration::ZERO, || {}));
        scheduler.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_children() {
        let parent = ChaosScheduler::new("parent");
        let child = parent.child("child");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        child.schedule_fn(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        parent.cancel_all();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(child.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn child_cancellation_leaves_parent_running() {
        let parent = ChaosScheduler::new("parent");
        let child = parent.child("child");
        child.cancel_all();
        assert!(!parent.is_cancelled());
        assert!(parent.schedule_fn(Duration::ZERO, || {}));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticks_until_cancelled() {
        let scheduler = ChaosScheduler::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        scheduler.schedule_interval(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn inline_delay_is_cut_short_by_cancellation() {
        let scheduler = ChaosScheduler::new("test");
        assert!(scheduler.delay(Duration::from_millis(10)).await);

        let canceller = scheduler.clone();
        let started = tokio::time::Instant::now();
        let (finished, ()) = tokio::join!(scheduler.delay(Duration::from_secs(60)), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel_all();
        });
        assert!(!finished);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn scheduler_without_runtime_refuses_work() {
        let scheduler = ChaosScheduler::new("orphan");
        assert!(!scheduler.schedule_fn(Duration::ZERO, || {}));
        assert_eq!(scheduler.pending(), 0);
    }
}
