/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Runtime boundary traits for the subsystems faultshell can degrade.
//!
//! Application code talks to these traits only. The orchestrator swaps each
//! implementation in a [`Platform`] for a chaos wrapper and hands the
//! wrapped bundle back; tearing chaos down restores pass-through behavior
//! without the application re-resolving anything.

use std::sync::Arc;

use url::Url;

pub mod cookie;
pub mod database;
pub mod dom;
pub mod events;
pub mod navigation;
pub mod network;
pub mod script;
pub mod service_worker;
pub mod storage;
pub mod timing;
pub mod websocket;
pub mod worker;

pub use cookie::{Cookie, CookieError, CookieStore, MemoryCookieJar};
pub use database::{Database, DbError, IndexHits, MemoryDatabase};
pub use dom::{DomError, DomTree, MemoryDom, NodeId};
pub use events::{Envelope, EventBus, Listener, MemoryEventBus, SubscriptionId};
pub use navigation::{HistoryEntry, MemoryHistory, NavigationError, NavigationHistory};
pub use network::{FetchRequest, FetchResponse, NetworkClient, NetworkError, StaticNetwork};
pub use script::{MemoryScriptHost, ScriptError, ScriptHost, TimerCallback, TimerId};
pub use service_worker::{
    CacheError, CacheStorage, CachedResponse, MemoryCacheStorage, MemoryServiceWorkers,
    Registration, RegistrationState, ServiceWorkerContainer, ServiceWorkerError,
};
pub use storage::{KeyValueStorage, MemoryStorage, StorageError};
pub use timing::{MemoryTimeline, PerformanceTimeline, ResourceTimingEntry};
pub use websocket::{LoopbackConnector, SocketError, SocketMessage, WebSocketConnection, WebSocketConnector};
pub use worker::{ReplySink, TokioWorkerHost, WorkerBehavior, WorkerError, WorkerHost, WorkerId, WorkerSpec};

/// One implementation per subsystem.
#[derive(Clone)]
pub struct Platform {
    pub network: Arc<dyn NetworkClient>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub dom: Arc<dyn DomTree>,
    pub script: Arc<dyn ScriptHost>,
    pub events: Arc<dyn EventBus>,
    pub websocket: Arc<dyn WebSocketConnector>,
    pub history: Arc<dyn NavigationHistory>,
    pub cookies: Arc<dyn CookieStore>,
    pub workers: Arc<dyn WorkerHost>,
    pub service_workers: Arc<dyn ServiceWorkerContainer>,
    pub caches: Arc<dyn CacheStorage>,
    pub timing: Arc<dyn PerformanceTimeline>,
    pub database: Arc<dyn Database>,
}

impl Platform {
    /// Fully in-memory platform rooted at `origin`.
    pub fn in_memory(origin: Url) -> Self {
        Self {
            network: Arc::new(StaticNetwork::new()),
            storage: Arc::new(MemoryStorage::new()),
            dom: Arc::new(MemoryDom::new()),
            script: Arc::new(MemoryScriptHost::new()),
            events: Arc::new(MemoryEventBus::new()),
            websocket: Arc::new(LoopbackConnector::new()),
            history: Arc::new(MemoryHistory::new(origin)),
            cookies: Arc::new(MemoryCookieJar::new()),
            workers: Arc::new(TokioWorkerHost::new()),
            service_workers: Arc::new(MemoryServiceWorkers::new()),
            caches: Arc::new(MemoryCacheStorage::new()),
            timing: Arc::new(MemoryTimeline::new()),
            database: Arc::new(MemoryDatabase::new()),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.network = network;
        self
    }

    pub fn with_websocket(mut self, websocket: Arc<dyn WebSocketConnector>) -> Self {
        self.websocket = websocket;
        self
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("origin", &self.history.location().origin())
            .finish_non_exhaustive()
    }
}
