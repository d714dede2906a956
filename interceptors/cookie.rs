/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription, corrupt_value};
use faultshell_runtime::{Cookie, CookieError, CookieStore};
use log::warn;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    WriteShadow, fallback_table,
};

const CATEGORY: &str = "cookie";
const READ: &str = "cookie.read";
const WRITE: &str = "cookie.write";
const DELETE: &str = "cookie.delete";

const COOKIE_DELAY_MS: std::ops::RangeInclusive<u64> = 100..=1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookieFault {
    StaleCookie,
    CorruptCookie,
    ExpiredEarly,
    DelayedSet,
    RejectedSet,
    CorruptAttributes,
    DelayedDelete,
    IgnoredDelete,
}

impl FaultVariant for CookieFault {
    fn name(self) -> &'static str {
        match self {
            Self::StaleCookie => "stale-cookie",
            Self::CorruptCookie => "corrupt-cookie",
            Self::ExpiredEarly => "expired-early",
            Self::DelayedSet => "delayed-set",
            Self::RejectedSet => "rejected-set",
            Self::CorruptAttributes => "corrupt-attributes",
            Self::DelayedDelete => "delayed-delete",
            Self::IgnoredDelete => "ignored-delete",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::StaleCookie | Self::DelayedSet | Self::DelayedDelete => FaultFamily::Latency,
            Self::CorruptCookie | Self::CorruptAttributes => FaultFamily::Corruption,
            Self::ExpiredEarly | Self::RejectedSet | Self::IgnoredDelete => FaultFamily::Error,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::ExpiredEarly => Self::StaleCookie,
            Self::RejectedSet => Self::DelayedSet,
            Self::IgnoredDelete => Self::DelayedDelete,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<CookieFault> {
    use CookieFault::*;
    FaultMenu::new()
        .with(READ, &[StaleCookie, CorruptCookie, ExpiredEarly])
        .with(WRITE, &[DelayedSet, RejectedSet, CorruptAttributes])
        .with(DELETE, &[DelayedDelete, IgnoredDelete])
}

fn catalog() -> Vec<MenuDescription> {
    menu().describe()
}

fn fallbacks() -> Vec<(&'static str, &'static str, bool)> {
    fallback_table(&menu())
}

inventory::submit! {
    InterceptorRegistration {
        name: "cookie",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

/// Alter one attribute of `cookie`; returns which.
fn corrupt_attributes(cookie: &mut Cookie, pick: usize) -> &'static str {
    match pick % 3 {
        0 => {
            cookie.secure = !cookie.secure;
            "secure"
        }
        1 => {
            cookie.http_only = !cookie.http_only;
            "httponly"
        }
        _ if cookie.path != "/" => {
            cookie.path = "/".to_string();
            "path"
        }
        _ => {
            cookie.secure = !cookie.secure;
            "secure"
        }
    }
}

pub struct ChaosCookies {
    real: Arc<dyn CookieStore>,
    core: InterceptorCore<CookieFault>,
    shadow: WriteShadow<String, Option<Cookie>>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn CookieStore>) -> Arc<ChaosCookies> {
    Arc::new(ChaosCookies {
        real,
        core: InterceptorCore::new(ctx, "cookie", menu()),
        shadow: WriteShadow::new(),
    })
}

impl ChaosCookies {
    fn observe(&self, name: &str, cookie: Option<Cookie>) {
        if !self.core.is_detached() {
            self.shadow.observe(name.to_string(), cookie);
        }
    }

    fn stale(&self, name: &str) -> Option<Cookie> {
        match self.shadow.previous(&name.to_string()) {
            Some(previous) => {
                self.core.emit(
                    CATEGORY,
                    CookieFault::StaleCookie,
                    format!("{name} served as it was before the latest write"),
                    0,
                );
                previous
            }
            None => {
                self.core.emit(
                    CATEGORY,
                    CookieFault::StaleCookie,
                    format!("{name} had no older value; served current"),
                    0,
                );
                self.real.get(name)
            }
        }
    }

    /// Corrupt one field of the cookie record, keeping its name.
    fn corrupt_record(&self, cookie: &Cookie) -> Option<(Cookie, String)> {
        let mut record = serde_json::to_value(cookie).ok()?;
        if let Some(fields) = record.as_object_mut() {
            fields.remove("name");
        }
        let corruption = self.core.rng().with(|rng| corrupt_value(&mut record, rng))?;
        if let Some(fields) = record.as_object_mut() {
            fields.insert("name".into(), cookie.name.clone().into());
        }
        let corrupted = serde_json::from_value(record).ok()?;
        Some((corrupted, corruption.to_string()))
    }
}

impl CookieStore for ChaosCookies {
    fn get(&self, name: &str) -> Option<Cookie> {
        let Some(fault) = self.core.decide(CATEGORY, READ) else {
            return self.real.get(name);
        };
        match fault {
            CookieFault::ExpiredEarly => {
                self.core
                    .emit(CATEGORY, fault, format!("{name} expired early"), 0);
                if let Err(error) = self.real.delete(name) {
                    warn!("cookie: early expiry of {name} failed: {error}");
                }
                None
            }
            CookieFault::CorruptCookie => {
                let current = self.real.get(name);
                match current.as_ref().and_then(|cookie| self.corrupt_record(cookie)) {
                    Some((corrupted, corruption)) => {
                        self.core.emit(
                            CATEGORY,
                            fault,
                            format!("{name} corrupted at {corruption}"),
                            0,
                        );
                        Some(corrupted)
                    }
                    None => self.stale(name),
                }
            }
            _ => self.stale(name),
        }
    }

    fn all(&self) -> Vec<Cookie> {
        self.real.all()
    }

    fn set(&self, mut cookie: Cookie) -> Result<(), CookieError> {
        let Some(fault) = self.core.decide(CATEGORY, WRITE) else {
            let name = cookie.name.clone();
            self.real.set(cookie.clone())?;
            self.observe(&name, Some(cookie));
            return Ok(());
        };
        let name = cookie.name.clone();
        match fault {
            CookieFault::RejectedSet => {
                self.core
                    .emit(CATEGORY, fault, format!("{name} rejected"), 0);
                Err(CookieError::Rejected(name))
            }
            CookieFault::CorruptAttributes => {
                let attribute = corrupt_attributes(&mut cookie, self.core.rng().index(3));
                self.core.emit(
                    CATEGORY,
                    fault,
                    format!("{name} stored with a corrupted {attribute} attribute"),
                    0,
                );
                self.real.set(cookie.clone())?;
                self.observe(&name, Some(cookie));
                Ok(())
            }
            _ => {
                let delay_ms = self.core.draw_ms(COOKIE_DELAY_MS);
                self.core.emit(
                    CATEGORY,
                    CookieFault::DelayedSet,
                    format!("{name} stored after {delay_ms}ms"),
                    delay_ms,
                );
                self.observe(&name, Some(cookie.clone()));
                let real = self.real.clone();
                self.core.defer(delay_ms, move || {
                    if let Err(error) = real.set(cookie) {
                        warn!("cookie: delayed set of {name} failed: {error}");
                    }
                });
                Ok(())
            }
        }
    }

    fn delete(&self, name: &str) -> Result<bool, CookieError> {
        let Some(fault) = self.core.decide(CATEGORY, DELETE) else {
            let existed = self.real.delete(name)?;
            self.observe(name, None);
            return Ok(existed);
        };
        let existed = self.real.get(name).is_some();
        match fault {
            CookieFault::IgnoredDelete => {
                self.core
                    .emit(CATEGORY, fault, format!("deletion of {name} ignored"), 0);
                Ok(existed)
            }
            _ => {
                let delay_ms = self.core.draw_ms(COOKIE_DELAY_MS);
                self.core.emit(
                    CATEGORY,
                    CookieFault::DelayedDelete,
                    format!("deletion of {name} delayed by {delay_ms}ms"),
                    delay_ms,
                );
                self.observe(name, None);
                let (real, name) = (self.real.clone(), name.to_string());
                self.core.defer(delay_ms, move || {
                    if let Err(error) = real.delete(&name) {
                        warn!("cookie: delayed deletion of {name} failed: {error}");
                    }
                });
                Ok(existed)
            }
        }
    }
}

impl InterceptorHandle for ChaosCookies {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        self.shadow.clear();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending()
    }
}
