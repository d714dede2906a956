/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! [`WebSocketConnector`] over tokio-tungstenite.

use faultshell_runtime::{SocketError, SocketMessage, WebSocketConnection, WebSocketConnector};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl WebSocketConnector for TungsteniteConnector {
    fn connect(
        &self,
        url: Url,
    ) -> BoxFuture<'static, Result<Box<dyn WebSocketConnection>, SocketError>> {
        async move {
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SocketError::InvalidUrl(url.to_string()));
            }
            let (stream, response) = connect_async(url.as_str())
                .await
                .map_err(handshake_error)?;
            debug!("websocket: connected to {url} ({})", response.status());
            Ok(Box::new(TungsteniteSocket {
                url,
                stream,
                closed: false,
            }) as Box<dyn WebSocketConnection>)
        }
        .boxed()
    }
}

pub struct TungsteniteSocket {
    url: Url,
    stream: Stream,
    closed: bool,
}

impl WebSocketConnection for TungsteniteSocket {
    fn url(&self) -> &Url {
        &self.url
    }

    fn send(&mut self, message: SocketMessage) -> BoxFuture<'_, Result<(), SocketError>> {
        async move {
            if self.closed {
                return Err(SocketError::Closed { code: 1000 });
            }
            let frame = match message {
                SocketMessage::Text(text) => Message::Text(text.into()),
                SocketMessage::Binary(bytes) => Message::Binary(bytes.into()),
                SocketMessage::Close => {
                    self.closed = true;
                    return self.stream.close(None).await.map_err(transport_error);
                }
            };
            self.stream.send(frame).await.map_err(transport_error)
        }
        .boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<SocketMessage, SocketError>>> {
        async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => {
                        return Some(Ok(SocketMessage::Text(text.as_str().to_owned())));
                    }
                    Ok(Message::Binary(bytes)) => return Some(Ok(SocketMessage::Binary(bytes.to_vec()))),
                    Ok(Message::Close(frame)) => {
                        self.closed = true;
                        let code = frame.map(|frame| u16::from(frame.code)).unwrap_or(1005);
                        if code == 1000 {
                            return None;
                        }
                        return Some(Err(SocketError::Closed { code }));
                    }
                    // Control frames are answered by tungstenite itself.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        return None;
                    }
                    Err(error) => return Some(Err(transport_error(error))),
                }
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SocketError>> {
        async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            match self.stream.close(None).await {
                Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
                Err(error) => Err(transport_error(error)),
            }
        }
        .boxed()
    }
}

fn handshake_error(error: tungstenite::Error) -> SocketError {
    match error {
        tungstenite::Error::Url(error) => SocketError::InvalidUrl(error.to_string()),
        tungstenite::Error::Http(response) => {
            SocketError::HandshakeRefused(format!("status {}", response.status()))
        }
        other => SocketError::HandshakeRefused(other.to_string()),
    }
}

fn transport_error(error: tungstenite::Error) -> SocketError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            SocketError::Closed { code: 1006 }
        }
        other => SocketError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection and echoes data frames until the peer closes.
    async fn echo_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                } else if message.is_close() {
                    break;
                }
            }
        });
        Url::parse(&format!("ws://{addr}/feed")).unwrap()
    }

    #[tokio::test]
    async fn echoes_text_and_binary_frames() {
        let url = echo_server().await;
        let mut socket = TungsteniteConnector::new().connect(url.clone()).await.unwrap();
        assert_eq!(socket.url(), &url);

        socket.send(SocketMessage::Text("hello".into())).await.unwrap();
        assert_eq!(socket.recv().await, Some(Ok(SocketMessage::Text("hello".into()))));
        socket.send(SocketMessage::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(socket.recv().await, Some(Ok(SocketMessage::Binary(vec![1, 2, 3]))));

        socket.close().await.unwrap();
        assert_eq!(
            socket.send(SocketMessage::Text("late".into())).await,
            Err(SocketError::Closed { code: 1000 })
        );
    }

    #[tokio::test]
    async fn rejects_non_socket_schemes() {
        let result = TungsteniteConnector::new()
            .connect(Url::parse("https://example.test/").unwrap())
            .await;
        assert!(matches!(result, Err(SocketError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn refused_handshake_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = TungsteniteConnector::new()
            .connect(Url::parse(&format!("ws://{addr}/")).unwrap())
            .await;
        assert!(matches!(result, Err(SocketError::HandshakeRefused(_))));
    }
}
