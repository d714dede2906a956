/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Service worker registration (`worker`) and cache storage (`storage`).
//!
//! Both wrappers share one core, so a single handle detaches them together.

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_json_text};
use faultshell_runtime::{
    CacheError, CacheStorage, CachedResponse, Registration, RegistrationState,
    ServiceWorkerContainer, ServiceWorkerError,
};
use futures_util::future::{BoxFuture, FutureExt};

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    WriteShadow, fallback_table,
};

const WORKER: &str = "worker";
const STORAGE: &str = "storage";
const REGISTER: &str = "service_worker.register";
const MATCH: &str = "cache.match";
const PUT: &str = "cache.put";

const SLOW_MS: std::ops::RangeInclusive<u64> = 100..=2000;
const CACHE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceWorkerFault {
    SlowRegistration,
    RegistrationFailure,
    StaleActivation,
    SlowMatch,
    CacheMiss,
    StaleEntry,
    CorruptBody,
    SlowPut,
    QuotaExceeded,
    EvictedEntry,
}

impl FaultVariant for ServiceWorkerFault {
    fn name(self) -> &'static str {
        match self {
            Self::SlowRegistration => "slow-registration",
            Self::RegistrationFailure => "registration-failure",
            Self::StaleActivation => "stale-activation",
            Self::SlowMatch => "slow-match",
            Self::CacheMiss => "cache-miss",
            Self::StaleEntry => "stale-entry",
            Self::CorruptBody => "corrupt-body",
            Self::SlowPut => "slow-put",
            Self::QuotaExceeded => "quota-exceeded",
            Self::EvictedEntry => "evicted-entry",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::SlowRegistration | Self::SlowMatch | Self::StaleEntry | Self::SlowPut => {
                FaultFamily::Latency
            }
            Self::RegistrationFailure | Self::QuotaExceeded => FaultFamily::Error,
            Self::StaleActivation | Self::CorruptBody => FaultFamily::Corruption,
            Self::CacheMiss => FaultFamily::Drop,
            Self::EvictedEntry => FaultFamily::Structural,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::RegistrationFailure => Self::SlowRegistration,
            Self::CacheMiss => Self::SlowMatch,
            Self::QuotaExceeded | Self::EvictedEntry => Self::SlowPut,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<ServiceWorkerFault> {
    use ServiceWorkerFault::*;
    FaultMenu::new()
        .with(
            REGISTER,
            &[SlowRegistration, RegistrationFailure, StaleActivation],
        )
        .with(MATCH, &[SlowMatch, CacheMiss, StaleEntry, CorruptBody])
        .with(PUT, &[SlowPut, QuotaExceeded, EvictedEntry])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "service-worker",
        categories: &[WORKER, STORAGE],
        catalog,
        fallbacks,
    }
}

type Core = Arc<InterceptorCore<ServiceWorkerFault>>;
type EntryShadow = Arc<WriteShadow<(String, String), CachedResponse>>;

pub struct ChaosServiceWorkers {
    real: Arc<dyn ServiceWorkerContainer>,
    core: Core,
    caches: Arc<ChaosCaches>,
}

pub struct ChaosCaches {
    real: Arc<dyn CacheStorage>,
    core: Core,
    shadow: EntryShadow,
}

pub fn install(
    ctx: &InterceptorContext,
    service_workers: Arc<dyn ServiceWorkerContainer>,
    caches: Arc<dyn CacheStorage>,
) -> (Arc<ChaosServiceWorkers>, Arc<ChaosCaches>) {
    let core: Core = Arc::new(InterceptorCore::new(ctx, "service-worker", menu()));
    let caches = Arc::new(ChaosCaches {
        real: caches,
        core: core.clone(),
        shadow: Arc::new(WriteShadow::new()),
    });
    let service_workers = Arc::new(ChaosServiceWorkers {
        real: service_workers,
        core,
        caches: caches.clone(),
    });
    (service_workers, caches)
}

impl ServiceWorkerContainer for ChaosServiceWorkers {
    fn register(
        &self,
        script_url: &str,
        scope: &str,
    ) -> BoxFuture<'static, Result<Registration, ServiceWorkerError>> {
        let Some(fault) = self.core.decide(WORKER, REGISTER) else {
            return self.real.register(script_url, scope);
        };
        let core = self.core.clone();
        match fault {
            ServiceWorkerFault::RegistrationFailure => {
                core.emit(
                    WORKER,
                    fault,
                    format!("registration of {script_url} for {scope} failed"),
                    0,
                );
                let message = format!("{script_url} failed to install");
                async move { Err(ServiceWorkerError::RegistrationFailed(message)) }.boxed()
            }
            ServiceWorkerFault::StaleActivation => {
                core.emit(
                    WORKER,
                    fault,
                    format!("registration for {scope} reported as still installing"),
                    0,
                );
                let registering = self.real.register(script_url, scope);
                async move {
                    let mut registration = registering.await?;
                    registration.state = RegistrationState::Installing;
                    Ok(registration)
                }
                .boxed()
            }
            _ => {
                let delay_ms = core.draw_ms(SLOW_MS);
                core.emit(
                    WORKER,
                    ServiceWorkerFault::SlowRegistration,
                    format!("registration for {scope} slowed by {delay_ms}ms"),
                    delay_ms,
                );
                let (real, script_url, scope) =
                    (self.real.clone(), script_url.to_string(), scope.to_string());
                async move {
                    core.pause(delay_ms).await;
                    real.register(&script_url, &scope).await
                }
                .boxed()
            }
        }
    }

    fn registration(&self, scope: &str) -> Option<Registration> {
        self.real.registration(scope)
    }

    fn registrations(&self) -> Vec<Registration> {
        self.real.registrations()
    }

    fn unregister(&self, scope: &str) -> bool {
        self.real.unregister(scope)
    }
}

impl ChaosCaches {
    fn slow_match(&self, cache: &str, url: &str) -> BoxFuture<'static, Result<Option<CachedResponse>, CacheError>> {
        let delay_ms = self.core.draw_ms(SLOW_MS);
        self.core.emit(
            STORAGE,
            ServiceWorkerFault::SlowMatch,
            format!("cache match for {url} slowed by {delay_ms}ms"),
            delay_ms,
        );
        let (core, matching) = (self.core.clone(), self.real.match_request(cache, url));
        async move {
            core.pause(delay_ms).await;
            matching.await
        }
        .boxed()
    }

    fn stale_entry(&self, cache: &str, url: &str) -> BoxFuture<'static, Result<Option<CachedResponse>, CacheError>> {
        let previous = self.stale_entry_lookup(cache, url);
        let description = match previous {
            Some(_) => format!("{url} served from before its latest put"),
            None => format!("{url} had no older entry; served current"),
        };
        self.core
            .emit(STORAGE, ServiceWorkerFault::StaleEntry, description, 0);
        match previous {
            Some(entry) => async move { Ok(Some(entry)) }.boxed(),
            None => self.real.match_request(cache, url),
        }
    }

    fn slow_put(
        &self,
        cache: &str,
        url: &str,
        response: CachedResponse,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        let delay_ms = self.core.draw_ms(SLOW_MS);
        self.core.emit(
            STORAGE,
            ServiceWorkerFault::SlowPut,
            format!("cache put for {url} slowed by {delay_ms}ms"),
            delay_ms,
        );
        let (core, real, shadow) = (self.core.clone(), self.real.clone(), self.shadow.clone());
        let key = (cache.to_string(), url.to_string());
        async move {
            core.pause(delay_ms).await;
            real.put(&key.0, &key.1, response.clone()).await?;
            shadow.observe(key, response);
            Ok(())
        }
        .boxed()
    }

    /// Pass-through put that records the entry for later stale reads.
    fn observed_put(
        &self,
        cache: &str,
        url: &str,
        response: CachedResponse,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        let putting = self.real.put(cache, url, response.clone());
        let (core, shadow) = (self.core.clone(), self.shadow.clone());
        let key = (cache.to_string(), url.to_string());
        async move {
            putting.await?;
            if !core.is_detached() {
                shadow.observe(key, response);
            }
            Ok(())
        }
        .boxed()
    }
}

impl CacheStorage for ChaosCaches {
    fn match_request(
        &self,
        cache: &str,
        url: &str,
    ) -> BoxFuture<'static, Result<Option<CachedResponse>, CacheError>> {
        let Some(fault) = self.core.decide(STORAGE, MATCH) else {
            return self.real.match_request(cache, url);
        };
        match fault {
            ServiceWorkerFault::CacheMiss => {
                self.core
                    .emit(STORAGE, fault, format!("{url} reported as not cached"), 0);
                async { Ok(None) }.boxed()
            }
            ServiceWorkerFault::CorruptBody => {
                let matching = self.real.match_request(cache, url);
                let (core, fallback) = (self.core.clone(), self.stale_entry_lookup(cache, url));
                let url = url.to_string();
                async move {
                    let matched = match matching.await {
                        Ok(matched) => matched,
                        Err(error) => {
                            core.emit(
                                STORAGE,
                                ServiceWorkerFault::CorruptBody,
                                format!("match for {url} failed before it could be corrupted: {error}"),
                                0,
                            );
                            return Err(error);
                        }
                    };
                    let Some(mut entry) = matched else {
                        core.emit(
                            STORAGE,
                            ServiceWorkerFault::StaleEntry,
                            format!("{url} not cached; nothing to corrupt"),
                            0,
                        );
                        return Ok(fallback);
                    };
                    match core.rng().with(|rng| corrupt_json_text(&entry.body, rng)) {
                        Some((body, corruption)) => {
                            core.emit(
                                STORAGE,
                                ServiceWorkerFault::CorruptBody,
                                format!("cached body of {url} corrupted at {corruption}"),
                                0,
                            );
                            entry.body = body;
                            Ok(Some(entry))
                        }
                        None => {
                            core.emit(
                                STORAGE,
                                ServiceWorkerFault::StaleEntry,
                                format!("cached body of {url} is not json; served stale"),
                                0,
                            );
                            Ok(fallback.or(Some(entry)))
                        }
                    }
                }
                .boxed()
            }
            ServiceWorkerFault::StaleEntry => self.stale_entry(cache, url),
            _ => self.slow_match(cache, url),
        }
    }

    fn put(
        &self,
        cache: &str,
        url: &str,
        response: CachedResponse,
    ) -> BoxFuture<'static, Result<(), CacheError>> {
        if self.core.is_detached() {
            return self.real.put(cache, url, response);
        }
        let Some(fault) = self.core.decide(STORAGE, PUT) else {
            return self.observed_put(cache, url, response);
        };
        match fault {
            ServiceWorkerFault::QuotaExceeded => {
                self.core.emit(
                    STORAGE,
                    fault,
                    format!("cache {cache:?} full; {url} rejected"),
                    0,
                );
                let error = CacheError::QuotaExceeded {
                    cache: cache.to_string(),
                    limit_entries: CACHE_LIMIT,
                };
                async move { Err(error) }.boxed()
            }
            ServiceWorkerFault::EvictedEntry => {
                let others = self
                    .real
                    .keys(cache)
                    .into_iter()
                    .filter(|key| key != url)
                    .collect::<Vec<_>>();
                let Some(victim) = self.core.rng().pick(&others).cloned() else {
                    return self.slow_put(cache, url, response);
                };
                self.core.emit(
                    STORAGE,
                    fault,
                    format!("putting {url} evicted {victim}"),
                    0,
                );
                self.shadow.forget(&(cache.to_string(), victim.clone()));
                let evicting = self.real.delete(cache, &victim);
                let putting = self.observed_put(cache, url, response);
                async move {
                    evicting.await;
                    putting.await
                }
                .boxed()
            }
            _ => self.slow_put(cache, url, response),
        }
    }

    fn delete(&self, cache: &str, url: &str) -> BoxFuture<'static, bool> {
        self.shadow.forget(&(cache.to_string(), url.to_string()));
        self.real.delete(cache, url)
    }

    fn keys(&self, cache: &str) -> Vec<String> {
        self.real.keys(cache)
    }

    fn cache_names(&self) -> Vec<String> {
        self.real.cache_names()
    }
}

impl ChaosCaches {
    fn stale_entry_lookup(&self, cache: &str, url: &str) -> Option<CachedResponse> {
        self.shadow.previous(&(cache.to_string(), url.to_string()))
    }
}

impl InterceptorHandle for ChaosServiceWorkers {
    fn name(&self) -> &'static str {
        "service-worker"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        self.caches.shadow.clear();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}
