/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Global state, evaluation and timers of the script host.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptError {
    Reference(String),
    Syntax(String),
    ReadOnly(String),
    Timeout { after_ms: u64 },
    NoRuntime,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reference(name) => write!(f, "{name} is not defined"),
            Self::Syntax(message) => write!(f, "syntax error: {message}"),
            Self::ReadOnly(name) => write!(f, "cannot assign to read-only global {name}"),
            Self::Timeout { after_ms } => write!(f, "script timed out after {after_ms}ms"),
            Self::NoRuntime => write!(f, "no async runtime available for timers"),
        }
    }
}

impl std::error::Error for ScriptError {}

pub trait ScriptHost: Send + Sync {
    /// Value of a global; [`ScriptError::Reference`] when it is not defined.
    fn global(&self, name: &str) -> Result<Value, ScriptError>;
    fn set_global(&self, name: &str, value: Value) -> Result<(), ScriptError>;
    fn global_names(&self) -> Vec<String>;
    fn evaluate(&self, source: String) -> BoxFuture<'static, Result<Value, ScriptError>>;
    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId, ScriptError>;
    /// Returns `false` if the timer already fired or never existed.
    fn clear_timeout(&self, id: TimerId) -> bool;
}

/// Evaluates JSON literals and bare global names; anything else is a
/// syntax error.
#[derive(Default)]
pub struct MemoryScriptHost {
    globals: Arc<RwLock<BTreeMap<String, Value>>>,
    frozen: RwLock<BTreeSet<String>>,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
    next_timer: AtomicU64,
}

impl MemoryScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` reject further assignments.
    pub fn freeze(&self, name: &str) {
        self.frozen.write().insert(name.to_string());
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }
}

fn is_identifier(source: &str) -> bool {
    let mut chars = source.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

impl ScriptHost for MemoryScriptHost {
    fn global(&self, name: &str) -> Result<Value, ScriptError> {
        self.globals
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::Reference(name.to_string()))
    }

    fn set_global(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        if self.frozen.read().contains(name) {
            return Err(ScriptError::ReadOnly(name.to_string()));
        }
        self.globals.write().insert(name.to_string(), value);
        Ok(())
    }

    fn global_names(&self) -> Vec<String> {
        self.globals.read().keys().cloned().collect()
    }

    fn evaluate(&self, source: String) -> BoxFuture<'static, Result<Value, ScriptError>> {
        let globals = self.globals.clone();
        async move {
            let source = source.trim();
            if let Ok(value) = serde_json::from_str::<Value>(source) {
                return Ok(value);
            }
            if is_identifier(source) {
                return globals
                    .read()
                    .get(source)
                    .cloned()
                    .ok_or_else(|| ScriptError::Reference(source.to_string()));
            }
            Err(ScriptError::Syntax(format!("unsupported expression {source:?}")))
        }
        .boxed()
    }

    fn set_timeout(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId, ScriptError> {
        let handle = Handle::try_current().map_err(|_| ScriptError::NoRuntime)?;
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let timers = self.timers.clone();
        let mut registry = self.timers.lock();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().remove(&id);
            callback();
        });
        registry.insert(id, task.abort_handle());
        Ok(id)
    }

    fn clear_timeout(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}
