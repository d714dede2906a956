/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_json_text};
use faultshell_runtime::{FetchRequest, FetchResponse, NetworkClient, NetworkError};
use futures_util::future::{BoxFuture, FutureExt};
use http::StatusCode;
use http::header::{CONTENT_LENGTH, HeaderValue};
use log::warn;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "network";
pub(crate) const FETCH: &str = "network.fetch";

const DELAY_MS: std::ops::RangeInclusive<u64> = 200..=3000;
const TIMEOUT_MS: std::ops::RangeInclusive<u64> = 1000..=5000;
const SERVER_ERRORS: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFault {
    Delay,
    Timeout,
    ServerError,
    CorruptBody,
    Duplicate,
    ConnectionReset,
}

impl FaultVariant for NetworkFault {
    fn name(self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Timeout => "timeout",
            Self::ServerError => "server-error",
            Self::CorruptBody => "corrupt-body",
            Self::Duplicate => "duplicate",
            Self::ConnectionReset => "connection-reset",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::Delay => FaultFamily::Latency,
            Self::Timeout | Self::ServerError => FaultFamily::Error,
            Self::CorruptBody => FaultFamily::Corruption,
            Self::Duplicate => FaultFamily::Duplication,
            Self::ConnectionReset => FaultFamily::Drop,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::CorruptBody | Self::Duplicate => self,
            _ => Self::Delay,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<NetworkFault> {
    FaultMenu::new().with(
        FETCH,
        &[
            NetworkFault::Delay,
            NetworkFault::Timeout,
            NetworkFault::ServerError,
            NetworkFault::CorruptBody,
            NetworkFault::Duplicate,
            NetworkFault::ConnectionReset,
        ],
    )
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "network",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

pub struct ChaosNetwork {
    real: Arc<dyn NetworkClient>,
    core: Arc<InterceptorCore<NetworkFault>>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn NetworkClient>) -> Arc<ChaosNetwork> {
    Arc::new(ChaosNetwork {
        real,
        core: Arc::new(InterceptorCore::new(ctx, "network", menu())),
    })
}

impl NetworkClient for ChaosNetwork {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, NetworkError>> {
        let Some(fault) = self.core.decide(CATEGORY, FETCH) else {
            return self.real.fetch(request);
        };
        let core = self.core.clone();
        let real = self.real.clone();
        async move { inject(core, real, fault, request).await }.boxed()
    }
}

async fn inject(
    core: Arc<InterceptorCore<NetworkFault>>,
    real: Arc<dyn NetworkClient>,
    fault: NetworkFault,
    request: FetchRequest,
) -> Result<FetchResponse, NetworkError> {
    let target = format!("{} {}", request.method, request.url);
    match fault {
        NetworkFault::Delay => delay_then_fetch(&core, &real, request, &target).await,
        NetworkFault::Timeout => {
            let after_ms = core.draw_ms(TIMEOUT_MS);
            core.emit(CATEGORY, fault, format!("{target} timed out after {after_ms}ms"), after_ms);
            core.pause(after_ms).await;
            Err(NetworkError::Timeout { after_ms })
        }
        NetworkFault::ServerError => {
            let status = core
                .rng()
                .pick(&SERVER_ERRORS)
                .copied()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            core.emit(CATEGORY, fault, format!("{target} answered with synthetic {status}"), 0);
            let body = serde_json::json!({ "error": status.canonical_reason().unwrap_or("error") });
            Ok(FetchResponse::new(status, body.to_string()))
        }
        NetworkFault::CorruptBody => {
            let mut response = match real.fetch(request).await {
                Ok(response) => response,
                Err(error) => {
                    core.emit(
                        CATEGORY,
                        fault,
                        format!("{target} failed before its body could be corrupted: {error}"),
                        0,
                    );
                    return Err(error);
                }
            };
            let corrupted = if response.is_json() {
                core.rng().with(|rng| corrupt_json_text(&response.body, rng))
            } else {
                None
            };
            let Some((body, corruption)) = corrupted else {
                let delay_ms = core.draw_ms(DELAY_MS);
                core.emit(
                    CATEGORY,
                    NetworkFault::Delay,
                    format!("{target} response held for {delay_ms}ms"),
                    delay_ms,
                );
                core.pause(delay_ms).await;
                return Ok(response);
            };
            core.emit(CATEGORY, fault, format!("{target} body corrupted at {corruption}"), 0);
            response.body = body;
            response
                .headers
                .insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));
            Ok(response)
        }
        NetworkFault::Duplicate => {
            let copies = core.draw_copies();
            core.emit(CATEGORY, fault, format!("{target} re-sent {copies} extra times"), 0);
            let result = real.fetch(request.clone()).await;
            for offset in core.stagger(copies) {
                let (real, request) = (real.clone(), request.clone());
                let scheduled = core.scheduler().schedule(offset, async move {
                    if let Err(error) = real.fetch(request).await {
                        warn!("network: duplicate request failed: {error}");
                    }
                });
                if !scheduled {
                    break;
                }
            }
            result
        }
        NetworkFault::ConnectionReset => {
            core.emit(CATEGORY, fault, format!("{target} connection reset"), 0);
            Err(NetworkError::ConnectionReset)
        }
    }
}

async fn delay_then_fetch(
    core: &InterceptorCore<NetworkFault>,
    real: &Arc<dyn NetworkClient>,
    request: FetchRequest,
    target: &str,
) -> Result<FetchResponse, NetworkError> {
    let delay_ms = core.draw_ms(DELAY_MS);
    core.emit(CATEGORY, NetworkFault::Delay, format!("{target} delayed by {delay_ms}ms"), delay_ms);
    core.pause(delay_ms).await;
    real.fetch(request).await
}

impl InterceptorHandle for ChaosNetwork {
    fn name(&self) -> &'static str {
        "network"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::testing::Harness;
    use faultshell_runtime::StaticNetwork;
    use http::Method;
    use serde_json::json;

    fn network() -> StaticNetwork {
        let network = StaticNetwork::new();
        network.route(
            "https://api.test/profile",
            FetchResponse::json(&json!({"name": "ada", "visits": 3, "admin": false})),
        );
        network.route("https://api.test/plain", FetchResponse::ok("hello"));
        network
    }

    fn get(url: &str) -> FetchRequest {
        FetchRequest::parse(Method::GET, url).unwrap()
    }

    #[tokio::test]
    async fn disabled_config_is_a_pure_pass_through() {
        let harness = Harness::never();
        let real = network();
        let chaos = install(&harness.ctx, Arc::new(real.clone()));

        let direct = real.fetch(get("https://api.test/profile")).await;
        let wrapped = chaos.fetch(get("https://api.test/profile")).await;

        assert_eq!(direct, wrapped);
        assert_eq!(harness.event_count(), 0);
        assert_eq!(real.request_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_mode_only_produces_recoverable_faults() {
        let harness = Harness::always(true, 11);
        let chaos = install(&harness.ctx, Arc::new(network()));
        for _ in 0..60 {
            let response = chaos.fetch(get("https://api.test/profile")).await;
            assert!(response.is_ok());
        }
        assert_eq!(harness.event_count(), 60);
        harness.assert_all_recoverable();
        for kind in harness.kinds() {
            assert!(
                ["network.delay", "network.corrupt-body", "network.duplicate"].contains(&kind.as_str()),
                "unexpected {kind}"
            );
        }
    }

    struct FailingNetwork;

    impl NetworkClient for FailingNetwork {
        fn fetch(&self, _: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, NetworkError>> {
            async { Err(NetworkError::Transport("unreachable".into())) }.boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_backend_still_logs_every_triggered_fault() {
        let harness = Harness::always(true, 2);
        let chaos = install(&harness.ctx, Arc::new(FailingNetwork));
        for _ in 0..60 {
            assert!(chaos.fetch(get("https://api.test/profile")).await.is_err());
        }
        assert_eq!(harness.event_count(), 60);
        assert!(harness.kinds().iter().any(|kind| kind == "network.corrupt-body"));
        harness.assert_all_recoverable();
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_mode_reaches_errors_and_resets() {
        let harness = Harness::always(false, 5);
        let chaos = install(&harness.ctx, Arc::new(network()));
        let mut saw_error = false;
        for _ in 0..80 {
            match chaos.fetch(get("https://api.test/profile")).await {
                Err(NetworkError::ConnectionReset | NetworkError::Timeout { .. }) => saw_error = true,
                Ok(response) if response.status.is_server_error() => saw_error = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(harness.kinds().iter().any(|kind| kind == "network.connection-reset"));
        assert!(harness.events.lock().iter().any(|event| !event.recoverable()));
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_bodies_stay_json_with_one_changed_field() {
        let harness = Harness::always(true, 2);
        let chaos = install(&harness.ctx, Arc::new(network()));
        let original = json!({"name": "ada", "visits": 3, "admin": false});
        let mut corrupted = 0;
        for _ in 0..60 {
            let response = chaos.fetch(get("https://api.test/profile")).await.unwrap();
            let body = response.json_body().expect("still json");
            if body != original {
                corrupted += 1;
                let changed = ["name", "visits", "admin"]
                    .iter()
                    .filter(|key| body[**key] != original[**key])
                    .count();
                assert_eq!(changed, 1);
            }
        }
        assert!(corrupted > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_json_bodies_fall_back_to_delay() {
        let harness = Harness::always(true, 9);
        let chaos = install(&harness.ctx, Arc::new(network()));
        for _ in 0..40 {
            let response = chaos.fetch(get("https://api.test/plain")).await.unwrap();
            assert_eq!(response.body, "hello");
        }
        assert!(!harness.kinds().iter().any(|kind| kind == "network.corrupt-body"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_are_replayed_on_the_scheduler() {
        let harness = Harness::always(true, 1);
        let real = network();
        let chaos = install(&harness.ctx, Arc::new(real.clone()));
        for _ in 0..30 {
            chaos.fetch(get("https://api.test/profile")).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;

        let duplicates = harness
            .kinds()
            .iter()
            .filter(|kind| *kind == "network.duplicate")
            .count();
        assert!(duplicates > 0);
        assert!(real.request_count() >= 30 + duplicates);
        assert_eq!(chaos.active_resources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_pending_replays_and_detaches() {
        let harness = Harness::always(true, 1);
        let real = network();
        let chaos = install(&harness.ctx, Arc::new(real.clone()));
        for _ in 0..30 {
            chaos.fetch(get("https://api.test/profile")).await.unwrap();
        }
        chaos.cleanup().unwrap();
        chaos.cleanup().unwrap();
        let settled = real.request_count();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        assert_eq!(real.request_count(), settled);

        let before = harness.event_count();
        chaos.fetch(get("https://api.test/profile")).await.unwrap();
        assert_eq!(harness.event_count(), before);
        assert!(chaos.is_detached());
    }
}
