/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! [`NetworkClient`] over reqwest.

use std::time::Duration;

use faultshell_runtime::{FetchRequest, FetchResponse, NetworkClient, NetworkError};
use futures_util::future::{BoxFuture, FutureExt};
use reqwest::Client;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: Client,
    timeout: Duration,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, NetworkError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| NetworkError::Transport(error.to_string()))?;
        Ok(Self { client, timeout })
    }
}

impl NetworkClient for ReqwestClient {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, NetworkError>> {
        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let timeout_ms = self.timeout.as_millis() as u64;
        async move {
            let response = builder
                .send()
                .await
                .map_err(|error| transport_error(error, timeout_ms))?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .map_err(|error| transport_error(error, timeout_ms))?;
            let mut fetched = FetchResponse::new(status, body);
            fetched.headers = headers;
            Ok(fetched)
        }
        .boxed()
    }
}

fn transport_error(error: reqwest::Error, timeout_ms: u64) -> NetworkError {
    if error.is_timeout() {
        NetworkError::Timeout {
            after_ms: timeout_ms,
        }
    } else if error.is_builder() {
        NetworkError::InvalidUrl(error.to_string())
    } else {
        NetworkError::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    /// Answers one request with a fixed JSON body.
    async fn one_shot_server(body: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 2048];
            let _ = stream.read(&mut buffer).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/profile")).unwrap()
    }

    #[tokio::test]
    async fn fetches_status_headers_and_body() {
        let url = one_shot_server(r#"{"id":1}"#).await;
        let client = ReqwestClient::new().unwrap();
        let response = client.fetch(FetchRequest::get(url)).await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
        assert!(response.is_json());
        assert_eq!(response.body, r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn refused_connections_are_transport_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = ReqwestClient::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        assert!(matches!(
            client.fetch(FetchRequest::get(url)).await,
            Err(NetworkError::Transport(_))
        ));
    }
}
