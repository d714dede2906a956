/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Background worker lifecycle.
//!
//! A worker is a task that receives JSON messages, hands each one to its
//! behavior, and forwards any reply to the spawner's reply sink.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type WorkerBehavior = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;
pub type ReplySink = Arc<dyn Fn(WorkerId, Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

#[derive(Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub behavior: WorkerBehavior,
    pub replies: ReplySink,
}

impl WorkerSpec {
    pub fn new(
        name: impl Into<String>,
        behavior: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
        replies: impl Fn(WorkerId, Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            behavior: Arc::new(behavior),
            replies: Arc::new(replies),
        }
    }
}

impl std::fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    SpawnFailed(String),
    NotRunning(WorkerId),
    Terminated(WorkerId),
    NoRuntime,
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed(message) => write!(f, "worker failed to start: {message}"),
            Self::NotRunning(id) => write!(f, "{id} is not running"),
            Self::Terminated(id) => write!(f, "{id} terminated unexpectedly"),
            Self::NoRuntime => write!(f, "no async runtime available for workers"),
        }
    }
}

impl std::error::Error for WorkerError {}

pub trait WorkerHost: Send + Sync {
    fn spawn(&self, spec: WorkerSpec) -> Result<WorkerId, WorkerError>;
    fn post(&self, id: WorkerId, message: Value) -> Result<(), WorkerError>;
    /// Returns `false` if the worker was not running.
    fn terminate(&self, id: WorkerId) -> bool;
    fn running(&self) -> Vec<WorkerId>;
}

struct WorkerSlot {
    inbox: mpsc::UnboundedSender<Value>,
    task: AbortHandle,
}

#[derive(Default)]
pub struct TokioWorkerHost {
    next_id: AtomicU64,
    workers: Mutex<BTreeMap<WorkerId, WorkerSlot>>,
}

impl TokioWorkerHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerHost for TokioWorkerHost {
    fn spawn(&self, spec: WorkerSpec) -> Result<WorkerId, WorkerError> {
        let handle = Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (inbox, mut rx) = mpsc::unbounded_channel::<Value>();
        let task = handle.spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Some(reply) = (spec.behavior)(message) {
                    (spec.replies)(id, reply);
                }
            }
            debug!("worker: {} ({id}) inbox closed", spec.name);
        });
        self.workers.lock().insert(
            id,
            WorkerSlot {
                inbox,
                task: task.abort_handle(),
            },
        );
        Ok(id)
    }

    fn post(&self, id: WorkerId, message: Value) -> Result<(), WorkerError> {
        let workers = self.workers.lock();
        let slot = workers.get(&id).ok_or(WorkerError::NotRunning(id))?;
        slot.inbox
            .send(message)
            .map_err(|_| WorkerError::NotRunning(id))
    }

    fn terminate(&self, id: WorkerId) -> bool {
        match self.workers.lock().remove(&id) {
            Some(slot) => {
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    fn running(&self) -> Vec<WorkerId> {
        self.workers.lock().keys().copied().collect()
    }
}
