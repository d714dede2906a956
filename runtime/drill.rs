/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Synthetic workload for chaos drills.
//!
//! One round touches every subsystem once or twice, the way a small client
//! application would: fetch, persist, render, script, message, navigate,
//! cache. Failures are counted, never propagated; the point of a drill is to
//! watch the application side survive them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use faultshell_core::ChaosLogEntry;
use faultshell_runtime::{
    CachedResponse, Cookie, Envelope, FetchRequest, FetchResponse, NetworkError, Platform,
    ResourceTimingEntry, SocketMessage, StaticNetwork, SubscriptionId, WorkerId, WorkerSpec,
};
use log::{debug, warn};
use serde_json::json;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::net::{ReqwestClient, TungsteniteConnector};

pub const DRILL_ORIGIN: &str = "https://drill.faultshell.test/";
const API_URL: &str = "https://drill.faultshell.test/api/profile";
const SOCKET_URL: &str = "wss://drill.faultshell.test/live";
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// In-memory platform with the routes, stores and indexes the workload uses.
pub fn drill_platform() -> Result<Platform, url::ParseError> {
    let origin = Url::parse(DRILL_ORIGIN)?;
    let network = StaticNetwork::new();
    network.route(
        API_URL,
        FetchResponse::json(&json!({"id": 7, "name": "drill", "roles": ["reader"], "active": true})),
    );
    let platform = Platform::in_memory(origin).with_network(Arc::new(network));
    platform.database.create_store("orders");
    if let Err(error) = platform.database.create_index("orders", "by_status", "status") {
        warn!("drill: could not create index: {error}");
    }
    Ok(platform)
}

/// Where the workload fetches from and opens its socket to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillTargets {
    pub api: Url,
    pub socket: Url,
}

impl DrillTargets {
    /// The routes [`drill_platform`] serves.
    pub fn in_memory() -> Result<Self, url::ParseError> {
        Ok(Self {
            api: Url::parse(API_URL)?,
            socket: Url::parse(SOCKET_URL)?,
        })
    }

    /// Targets off the drill origin need real adapters.
    pub fn is_live(&self) -> bool {
        self.api.as_str() != API_URL || self.socket.as_str() != SOCKET_URL
    }
}

/// Replace the in-memory network with reqwest when the API target is
/// external, and the loopback socket with tungstenite when the socket target
/// is.
pub fn connect_live(mut platform: Platform, targets: &DrillTargets) -> Result<Platform, NetworkError> {
    if targets.api.as_str() != API_URL {
        debug!("drill: fetching from {}", targets.api);
        platform = platform.with_network(Arc::new(ReqwestClient::new()?));
    }
    if targets.socket.as_str() != SOCKET_URL {
        debug!("drill: socket to {}", targets.socket);
        platform = platform.with_websocket(Arc::new(TungsteniteConnector::new()));
    }
    Ok(platform)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrillStats {
    pub rounds: usize,
    pub operations: usize,
    pub failures: usize,
}

impl DrillStats {
    fn step<T, E: std::fmt::Display>(&mut self, what: &str, result: Result<T, E>) -> Option<T> {
        self.operations += 1;
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.failures += 1;
                debug!("drill: {what} failed: {error}");
                None
            }
        }
    }

    fn check(&mut self, what: &str, ok: bool) {
        self.step(what, if ok { Ok(()) } else { Err("unexpected result") });
    }
}

pub struct Workload {
    platform: Platform,
    targets: DrillTargets,
    worker: Option<WorkerId>,
    subscriptions: Vec<SubscriptionId>,
    delivered: Arc<AtomicUsize>,
    replies: Arc<AtomicUsize>,
}

impl Workload {
    /// Subscribe listeners and start the echo worker on `platform`.
    pub fn prepare(platform: Platform, targets: DrillTargets) -> Self {
        let delivered = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(AtomicUsize::new(0));
        let mut subscriptions = Vec::new();
        let tick_delivered = delivered.clone();
        subscriptions.push(platform.events.subscribe(
            "drill.tick",
            Arc::new(move |_: &Envelope| {
                tick_delivered.fetch_add(1, Ordering::Relaxed);
            }),
        ));
        let port_delivered = delivered.clone();
        subscriptions.push(platform.events.on_message(
            "drill.port",
            Arc::new(move |_: &Envelope| {
                port_delivered.fetch_add(1, Ordering::Relaxed);
            }),
        ));

        let reply_count = replies.clone();
        let worker = platform
            .workers
            .spawn(WorkerSpec::new(
                "echo",
                |message| Some(json!({"echo": message})),
                move |_, _| {
                    reply_count.fetch_add(1, Ordering::Relaxed);
                },
            ))
            .map_err(|error| warn!("drill: echo worker did not start: {error}"))
            .ok();

        Self {
            platform,
            targets,
            worker,
            subscriptions,
            delivered,
            replies,
        }
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn replies(&self) -> usize {
        self.replies.load(Ordering::Relaxed)
    }

    pub async fn round(&mut self, index: usize, stats: &mut DrillStats) {
        #[cfg(feature = "tracing")]
        {
            use tracing::Instrument;
            let span = tracing::debug_span!("drill_round", index);
            self.touch_everything(index, stats).instrument(span).await
        }
        #[cfg(not(feature = "tracing"))]
        self.touch_everything(index, stats).await
    }

    async fn touch_everything(&mut self, index: usize, stats: &mut DrillStats) {
        let platform = self.platform.clone();
        let started = platform.timing.now();

        let api = self.targets.api.clone();
        let response = platform.network.fetch(FetchRequest::get(api.clone())).await;
        if let Some(response) = stats.step("fetch profile", response) {
            stats.check("profile is json", response.json_body().is_some());
            let cached = CachedResponse {
                status: response.status.as_u16(),
                body: response.body.clone(),
                stored_at_ms: faultshell_core::now_unix_ms(),
            };
            let put = platform.caches.put("drill-v1", api.as_str(), cached).await;
            stats.step("cache profile", put);
        }
        let matched = platform.caches.match_request("drill-v1", api.as_str()).await;
        stats.step("match cached profile", matched);

        let draft = json!({"round": index, "items": [index, index + 1]}).to_string();
        stats.step("save draft", platform.storage.set("draft", &draft));
        stats.step("load draft", platform.storage.get("draft"));
        if index % 5 == 4 {
            stats.step("remove draft", platform.storage.remove("draft"));
        }

        let list = platform.dom.create_element("li");
        stats.step("label item", platform.dom.set_attribute(list, "class", "item"));
        stats.step("fill item", platform.dom.set_text(list, &format!("round {index}")));
        stats.step("append item", platform.dom.append_child(platform.dom.root(), list));
        let items = platform.dom.query_selector_all(".item");
        debug!("drill: {} items rendered", items.len());

        stats.step("set counter", platform.script.set_global("counter", json!(index)));
        stats.step("read counter", platform.script.global("counter"));
        let evaluated = platform.script.evaluate("counter".to_string()).await;
        stats.step("evaluate counter", evaluated);
        stats.step(
            "arm timer",
            platform
                .script
                .set_timeout(Duration::from_millis(10), Box::new(|| {})),
        );

        platform
            .events
            .publish(Envelope::new("drill.tick", json!({"round": index})));
        platform
            .events
            .post_message("drill.port", Envelope::new("drill.port", json!({"seq": index})));

        self.socket_exchange(index, stats).await;

        let page = format!("/page/{index}?tab=overview");
        stats.step(
            "push state",
            platform.history.push_state(json!({"page": index}), Some(&page)),
        );
        if index % 3 == 2 {
            stats.step("go back", platform.history.back());
        }
        debug!("drill: at {}", platform.history.location());

        stats.step(
            "set cookie",
            platform.cookies.set(Cookie::new("session", format!("s{index}"))),
        );
        stats.check("read cookie", platform.cookies.get("session").is_some());

        if let Some(worker) = self.worker {
            stats.step("post to worker", platform.workers.post(worker, json!({"job": index})));
        }

        let registered = platform.service_workers.register("/sw.js", "/").await;
        stats.step("register service worker", registered);

        let key = format!("order-{}", index % 4);
        let status = if index % 2 == 0 { "open" } else { "shipped" };
        let put = platform
            .database
            .put("orders", &key, json!({"status": status, "total": index * 10}))
            .await;
        stats.step("store order", put);
        stats.step("load order", platform.database.get("orders", &key).await);
        let open = platform
            .database
            .query_index("orders", "by_status", json!("open"))
            .await;
        stats.step("query open orders", open);

        let finished = platform.timing.now();
        platform.timing.record(ResourceTimingEntry {
            start_time: started,
            duration: (finished - started).max(0.0),
            transfer_size: draft.len() as u64,
            ..ResourceTimingEntry::new(format!("round-{index}"), "drill")
        });
        debug!("drill: {} timing entries", platform.timing.entries().len());
        stats.rounds += 1;
    }

    async fn socket_exchange(&self, index: usize, stats: &mut DrillStats) {
        let connected = self.platform.websocket.connect(self.targets.socket.clone()).await;
        let Some(mut socket) = stats.step("open socket", connected) else {
            return;
        };
        let sent = socket
            .send(SocketMessage::Text(format!("ping {index}")))
            .await;
        stats.step("send ping", sent);
        match tokio::time::timeout(RECV_TIMEOUT, socket.recv()).await {
            Ok(Some(received)) => {
                stats.step("receive echo", received);
            }
            Ok(None) => stats.check("receive echo", false),
            Err(_) => stats.check("receive echo before timeout", false),
        }
        let closed = socket.close().await;
        stats.step("close socket", closed);
    }

    /// Stop the worker and drop the listeners.
    pub fn finish(self) {
        if let Some(worker) = self.worker {
            self.platform.workers.terminate(worker);
        }
        for id in self.subscriptions {
            self.platform.events.unsubscribe(id);
        }
    }
}

/// Run `rounds` rounds, stopping early once `cancel` fires.
pub async fn run(
    platform: Platform,
    targets: DrillTargets,
    rounds: usize,
    cancel: CancellationToken,
) -> (DrillStats, Duration) {
    let started = Instant::now();
    let mut stats = DrillStats::default();
    let mut workload = Workload::prepare(platform, targets);
    for index in 0..rounds {
        let completed = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = workload.round(index, &mut stats) => true,
        };
        if !completed {
            warn!("drill: cancelled after {} rounds", stats.rounds);
            break;
        }
    }
    debug!(
        "drill: {} deliveries, {} worker replies",
        workload.delivered(),
        workload.replies()
    );
    workload.finish();
    (stats, started.elapsed())
}

/// Event count per category.
pub fn summarize<'a>(entries: impl IntoIterator<Item = &'a ChaosLogEntry>) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for entry in entries {
        *summary
            .entry(entry.details.category().to_string())
            .or_insert(0) += 1;
    }
    summary
}

/// One line per entry: JSON, or `HH:MM:SS.mmm type summary`.
pub fn format_entry(entry: &ChaosLogEntry, as_json: bool) -> String {
    if as_json {
        return serde_json::to_string(entry).unwrap_or_else(|error| {
            warn!("drill: could not encode {}: {error}", entry.kind);
            String::new()
        });
    }
    format!("{} {:<36} {}", clock(entry.timestamp), entry.kind, entry.summary)
}

fn clock(timestamp_ms: u64) -> String {
    let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp_ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&format).ok())
        .unwrap_or_else(|| timestamp_ms.to_string())
}
