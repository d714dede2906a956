/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Service worker registrations and the response cache they manage.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub scope: String,
    pub script_url: String,
    pub state: RegistrationState,
    pub update_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    InvalidScope(String),
    RegistrationFailed(String),
}

impl std::fmt::Display for ServiceWorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidScope(scope) => write!(f, "invalid service worker scope {scope:?}"),
            Self::RegistrationFailed(message) => write!(f, "registration failed: {message}"),
        }
    }
}

impl std::error::Error for ServiceWorkerError {}

pub trait ServiceWorkerContainer: Send + Sync {
    fn register(
        &self,
        script_url: &str,
        scope: &str,
    ) -> BoxFuture<'static, Result<Registration, ServiceWorkerError>>;
    fn registration(&self, scope: &str) -> Option<Registration>;
    fn registrations(&self) -> Vec<Registration>;
    fn unregister(&self, scope: &str) -> bool;
}

/// Registrations activate immediately; re-registering a scope bumps its
/// update count.
#[derive(Clone, Default)]
pub struct MemoryServiceWorkers {
    registrations: Arc<RwLock<BTreeMap<String, Registration>>>,
}

impl MemoryServiceWorkers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceWorkerContainer for MemoryServiceWorkers {
    fn register(
        &self,
        script_url: &str,
        scope: &str,
    ) -> BoxFuture<'static, Result<Registration, ServiceWorkerError>> {
        let registrations = self.registrations.clone();
        let script_url = script_url.to_string();
        let scope = scope.to_string();
        async move {
            if !scope.starts_with('/') {
                return Err(ServiceWorkerError::InvalidScope(scope));
            }
            let mut registrations = registrations.write();
            let update_count = registrations
                .get(&scope)
                .map(|existing| existing.update_count + 1)
                .unwrap_or(0);
            let registration = Registration {
                scope: scope.clone(),
                script_url,
                state: RegistrationState::Activated,
                update_count,
            };
            registrations.insert(scope, registration.clone());
            Ok(registration)
        }
        .boxed()
    }

    fn registration(&self, scope: &str) -> Option<Registration> {
        self.registrations.read().get(scope).cloned()
    }

    fn registrations(&self) -> Vec<Registration> {
        self.registrations.read().values().cloned().collect()
    }

    fn unregister(&self, scope: &str) -> bool {
        self.registrations.write().remove(scope).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: String,
    pub stored_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    QuotaExceeded { cache: String, limit_entries: usize },
    InvalidRequest(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotaExceeded {
                cache,
                limit_entries,
            } => write!(f, "cache {cache:?} is full ({limit_entries} entries)"),
            Self::InvalidRequest(message) => write!(f, "invalid cache request: {message}"),
        }
    }
}

impl std::error::Error for CacheError {}

pub trait CacheStorage: Send + Sync {
    fn match_request(
        &self,
        cache: &str,
        url: &str,
    ) -> BoxFuture<'static, Result<Option<CachedResponse>, CacheError>>;
    fn put(
        &self,
        cache: &str,
        url: &str,
        response: CachedResponse,
    ) -> BoxFuture<'static, Result<(), CacheError>>;
    fn delete(&self, cache: &str, url: &str) -> BoxFuture<'static, bool>;
    fn keys(&self, cache: &str) -> Vec<String>;
    fn cache_names(&self) -> Vec<String>;
}

type CacheTable = BTreeMap<String, BTreeMap<String, CachedResponse>>;

#[derive(Clone, Default)]
pub struct MemoryCacheStorage {
    caches: Arc<RwLock<CacheTable>>,
    max_entries: Option<usize>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            caches: Arc::default(),
            max_entries: Some(max_entries),
        }
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn match_request(
        &self,
        cache: &str,
        url: &str,
    ) -> BoxFuture<'static, Result<Option<CachedResponse>, CacheError>> {
        let found = self
            .caches
            .read()
            .get(cache)
            .and_then(|entries| entries.get(url))
            .cloned();
        async move { Ok(found) }.boxed()
    }

    fn put(
        &self,
        cache: &str,
        url: &str,
        response: CachedResponse,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        let result = if url.is_empty() {
            Err(CacheError::InvalidRequest("empty url".to_string()))
        } else {
            let mut caches = self.caches.write();
            let entries = caches.entry(cache.to_string()).or_default();
            match self.max_entries {
                Some(limit) if entries.len() >= limit && !entries.contains_key(url) => {
                    Err(CacheError::QuotaExceeded {
                        cache: cache.to_string(),
                        limit_entries: limit,
                    })
                }
                _ => {
                    entries.insert(url.to_string(), response);
                    Ok(())
                }
            }
        };
        async move { result }.boxed()
    }

    fn delete(&self, cache: &str, url: &str) -> BoxFuture<'static, bool> {
        let removed = self
            .caches
            .write()
            .get_mut(cache)
            .and_then(|entries| entries.remove(url))
            .is_some();
        async move { removed }.boxed()
    }

    fn keys(&self, cache: &str) -> Vec<String> {
        self.caches
            .read()
            .get(cache)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn cache_names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }
}
