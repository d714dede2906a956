/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Network fetch boundary.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn parse(method: Method, raw: &str) -> Result<Self, NetworkError> {
        let url = Url::parse(raw).map_err(|error| NetworkError::InvalidUrl(error.to_string()))?;
        Ok(Self::new(method, url))
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn json(value: &Value) -> Self {
        let mut response = Self::ok(value.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    /// True when the content type says JSON, or when no content type is set
    /// and the body parses as JSON.
    pub fn is_json(&self) -> bool {
        match self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            Some(content_type) => content_type.contains("json"),
            None => serde_json::from_str::<Value>(&self.body).is_ok(),
        }
    }

    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkError {
    Timeout { after_ms: u64 },
    ConnectionReset,
    InvalidUrl(String),
    Transport(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { after_ms } => write!(f, "request timed out after {after_ms}ms"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::InvalidUrl(message) => write!(f, "invalid url: {message}"),
            Self::Transport(message) => write!(f, "transport error: {message}"),
        }
    }
}

impl std::error::Error for NetworkError {}

pub trait NetworkClient: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, NetworkError>>;
}

/// Route table keyed by URL string. Unknown URLs answer 404. Every request
/// is recorded.
#[derive(Clone, Default)]
pub struct StaticNetwork {
    inner: Arc<StaticNetworkInner>,
}

#[derive(Default)]
struct StaticNetworkInner {
    routes: RwLock<HashMap<String, FetchResponse>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, response: FetchResponse) -> &Self {
        self.inner.routes.write().insert(url.to_string(), response);
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.inner.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

impl NetworkClient for StaticNetwork {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, NetworkError>> {
        let response = self
            .inner
            .routes
            .read()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| FetchResponse::new(StatusCode::NOT_FOUND, "not found"));
        self.inner.requests.lock().push(request);
        async move { Ok(response) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_network_serves_routes_and_records_requests() {
        let network = StaticNetwork::new();
        network.route("https://api.test/items", FetchResponse::json(&json!({"items": [1, 2]})));

        let hit = network
            .fetch(FetchRequest::parse(Method::GET, "https://api.test/items").unwrap())
            .await
            .unwrap();
        let miss = network
            .fetch(FetchRequest::parse(Method::GET, "https://api.test/other").unwrap())
            .await
            .unwrap();

        assert_eq!(hit.status, StatusCode::OK);
        assert!(hit.is_json());
        assert_eq!(hit.json_body(), Some(json!({"items": [1, 2]})));
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
        assert!(!miss.is_json());
        assert_eq!(network.request_count(), 2);
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(matches!(
            FetchRequest::parse(Method::GET, "not a url"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }
}
