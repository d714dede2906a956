/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Session history and location.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: Url,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    OutOfRange { delta: i64, index: usize, length: usize },
    InvalidUrl(String),
    Blocked(String),
    CrossOrigin { from: String, to: String },
}

impl std::fmt::Display for NavigationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange {
                delta,
                index,
                length,
            } => write!(f, "cannot move {delta} from entry {index} of {length}"),
            Self::InvalidUrl(message) => write!(f, "invalid url: {message}"),
            Self::Blocked(message) => write!(f, "navigation blocked: {message}"),
            Self::CrossOrigin { from, to } => {
                write!(f, "history entry for {to} is not same-origin with {from}")
            }
        }
    }
}

impl std::error::Error for NavigationError {}

pub trait NavigationHistory: Send + Sync {
    /// `url` is resolved against the current location and must stay
    /// same-origin.
    fn push_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError>;
    fn replace_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError>;
    fn go(&self, delta: i64) -> Result<(), NavigationError>;
    fn back(&self) -> Result<(), NavigationError> {
        self.go(-1)
    }
    fn forward(&self) -> Result<(), NavigationError> {
        self.go(1)
    }
    fn current(&self) -> HistoryEntry;
    fn length(&self) -> usize;
    fn location(&self) -> Url;
    /// Navigate to `url` (any origin), adding a history entry with null state.
    fn assign(&self, url: &str) -> Result<(), NavigationError>;
}

#[derive(Debug)]
struct Session {
    entries: Vec<HistoryEntry>,
    index: usize,
}

impl Session {
    fn current(&self) -> &HistoryEntry {
        &self.entries[self.index]
    }

    fn resolve(&self, url: Option<&str>, same_origin: bool) -> Result<Url, NavigationError> {
        let base = &self.current().url;
        let Some(raw) = url else {
            return Ok(base.clone());
        };
        let resolved = base
            .join(raw)
            .map_err(|error| NavigationError::InvalidUrl(error.to_string()))?;
        if same_origin && resolved.origin() != base.origin() {
            return Err(NavigationError::CrossOrigin {
                from: base.to_string(),
                to: resolved.to_string(),
            });
        }
        Ok(resolved)
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.entries.truncate(self.index + 1);
        self.entries.push(entry);
        self.index = self.entries.len() - 1;
    }
}

#[derive(Debug)]
pub struct MemoryHistory {
    session: RwLock<Session>,
}

impl MemoryHistory {
    pub fn new(start: Url) -> Self {
        Self {
            session: RwLock::new(Session {
                entries: vec![HistoryEntry {
                    url: start,
                    state: Value::Null,
                }],
                index: 0,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.session.read().index
    }
}

impl NavigationHistory for MemoryHistory {
    fn push_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError> {
        let mut session = self.session.write();
        let url = session.resolve(url, true)?;
        session.push(HistoryEntry { url, state });
        Ok(())
    }

    fn replace_state(&self, state: Value, url: Option<&str>) -> Result<(), NavigationError> {
        let mut session = self.session.write();
        let url = session.resolve(url, true)?;
        let index = session.index;
        session.entries[index] = HistoryEntry { url, state };
        Ok(())
    }

    fn go(&self, delta: i64) -> Result<(), NavigationError> {
        let mut session = self.session.write();
        let length = session.entries.len();
        let target = (session.index as i64).checked_add(delta).unwrap_or(-1);
        if target < 0 || target >= length as i64 {
            return Err(NavigationError::OutOfRange {
                delta,
                index: session.index,
                length,
            });
        }
        session.index = target as usize;
        Ok(())
    }

    fn current(&self) -> HistoryEntry {
        self.session.read().current().clone()
    }

    fn length(&self) -> usize {
        self.session.read().entries.len()
    }

    fn location(&self) -> Url {
        self.session.read().current().url.clone()
    }

    fn assign(&self, url: &str) -> Result<(), NavigationError> {
        let mut session = self.session.write();
        let url = session.resolve(Some(url), false)?;
        session.push(HistoryEntry {
            url,
            state: Value::Null,
        });
        Ok(())
    }
}
