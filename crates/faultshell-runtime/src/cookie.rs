/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: Option<String>,
    pub max_age_secs: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: "/".to_string(),
            domain: None,
            max_age_secs: None,
            secure: false,
            http_only: false,
        }
    }

    /// Parse a `Set-Cookie` style header: `name=value; Path=/; Max-Age=60;
    /// Secure`. Unknown attributes are ignored.
    pub fn parse(header: &str) -> Result<Self, CookieError> {
        let mut parts = header.split(';').map(str::trim);
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| CookieError::Malformed(header.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CookieError::Malformed(header.to_string()));
        }
        let mut cookie = Cookie::new(name, value.trim());
        for attribute in parts.filter(|part| !part.is_empty()) {
            let (key, val) = attribute.split_once('=').unwrap_or((attribute, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "path" => cookie.path = val.trim().to_string(),
                "domain" => cookie.domain = Some(val.trim().trim_start_matches('.').to_string()),
                "max-age" => {
                    cookie.max_age_secs = Some(
                        val.trim()
                            .parse()
                            .map_err(|_| CookieError::Malformed(header.to_string()))?,
                    )
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Ok(cookie)
    }

    pub fn to_header(&self) -> String {
        let mut header = format!("{}={}; Path={}", self.name, self.value, self.path);
        if let Some(domain) = &self.domain {
            header.push_str(&format!("; Domain={domain}"));
        }
        if let Some(max_age) = self.max_age_secs {
            header.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    Malformed(String),
    Rejected(String),
}

impl std::fmt::Display for CookieError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(header) => write!(f, "malformed cookie {header:?}"),
            Self::Rejected(name) => write!(f, "cookie {name:?} rejected"),
        }
    }
}

impl std::error::Error for CookieError {}

pub trait CookieStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Cookie>;
    fn all(&self) -> Vec<Cookie>;
    /// A non-positive `max_age_secs` deletes the cookie.
    fn set(&self, cookie: Cookie) -> Result<(), CookieError>;
    fn delete(&self, name: &str) -> Result<bool, CookieError>;

    fn set_from_header(&self, header: &str) -> Result<(), CookieError> {
        self.set(Cookie::parse(header)?)
    }

    /// `Cookie:` request header value.
    fn header(&self) -> String {
        self.all()
            .iter()
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: RwLock<BTreeMap<String, (Cookie, Instant)>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(cookie: &Cookie, stored_at: Instant) -> bool {
        match cookie.max_age_secs {
            Some(secs) if secs <= 0 => false,
            Some(secs) => stored_at.elapsed() < Duration::from_secs(secs as u64),
            None => true,
        }
    }
}

impl CookieStore for MemoryCookieJar {
    fn get(&self, name: &str) -> Option<Cookie> {
        let cookies = self.cookies.read();
        let (cookie, stored_at) = cookies.get(name)?;
        Self::is_live(cookie, *stored_at).then(|| cookie.clone())
    }

    fn all(&self) -> Vec<Cookie> {
        self.cookies
            .read()
            .values()
            .filter(|(cookie, stored_at)| Self::is_live(cookie, *stored_at))
            .map(|(cookie, _)| cookie.clone())
            .collect()
    }

    fn set(&self, cookie: Cookie) -> Result<(), CookieError> {
        if cookie.name.is_empty() || cookie.name.contains(['=', ';', ' ']) {
            return Err(CookieError::Malformed(cookie.name));
        }
        let mut cookies = self.cookies.write();
        if cookie.max_age_secs.is_some_and(|secs| secs <= 0) {
            cookies.remove(&cookie.name);
        } else {
            cookies.insert(cookie.name.clone(), (cookie, Instant::now()));
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, CookieError> {
        Ok(self.cookies.write().remove(name).is_some())
    }
}
