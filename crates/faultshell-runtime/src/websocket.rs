/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Duplex socket boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl SocketMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
            Self::Close => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    InvalidUrl(String),
    HandshakeRefused(String),
    /// Closed abnormally, with the close code reported to the application.
    Closed { code: u16 },
    Transport(String),
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(message) => write!(f, "invalid socket url: {message}"),
            Self::HandshakeRefused(message) => write!(f, "handshake refused: {message}"),
            Self::Closed { code } => write!(f, "socket closed with code {code}"),
            Self::Transport(message) => write!(f, "socket transport error: {message}"),
        }
    }
}

impl std::error::Error for SocketError {}

pub trait WebSocketConnection: Send {
    fn url(&self) -> &Url;
    fn send(&mut self, message: SocketMessage) -> BoxFuture<'_, Result<(), SocketError>>;
    /// `None` once the peer has closed and every queued message was read.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<SocketMessage, SocketError>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<(), SocketError>>;
}

pub trait WebSocketConnector: Send + Sync {
    fn connect(
        &self,
        url: Url,
    ) -> BoxFuture<'static, Result<Box<dyn WebSocketConnection>, SocketError>>;
}

/// Echo connector: everything sent on a connection is received back on it.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    opened: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl WebSocketConnector for LoopbackConnector {
    fn connect(
        &self,
        url: Url,
    ) -> BoxFuture<'static, Result<Box<dyn WebSocketConnection>, SocketError>> {
        let opened = self.opened.clone();
        async move {
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SocketError::InvalidUrl(url.to_string()));
            }
            opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(Box::new(LoopbackSocket {
                url,
                tx: Some(tx),
                rx,
            }) as Box<dyn WebSocketConnection>)
        }
        .boxed()
    }
}

pub struct LoopbackSocket {
    url: Url,
    tx: Option<mpsc::UnboundedSender<SocketMessage>>,
    rx: mpsc::UnboundedReceiver<SocketMessage>,
}

impl WebSocketConnection for LoopbackSocket {
    fn url(&self) -> &Url {
        &self.url
    }

    fn send(&mut self, message: SocketMessage) -> BoxFuture<'_, Result<(), SocketError>> {
        let result = match &self.tx {
            Some(tx) => tx
                .send(message)
                .map_err(|_| SocketError::Closed { code: 1006 }),
            None => Err(SocketError::Closed { code: 1000 }),
        };
        async move { result }.boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<SocketMessage, SocketError>>> {
        async move {
            if self.tx.is_none() {
                return self.rx.try_recv().ok().map(Ok);
            }
            self.rx.recv().await.map(Ok)
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SocketError>> {
        self.tx = None;
        async { Ok(()) }.boxed()
    }
}
