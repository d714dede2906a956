/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Socket connector wrapper. Every connection opened while attached is
//! wrapped in a [`ChaosSocket`] that degrades its own sends and receives.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use faultshell_core::{FaultFamily, FaultMenu, FaultVariant, MenuDescription};
use faultshell_runtime::{SocketError, SocketMessage, WebSocketConnection, WebSocketConnector};
use futures_util::future::{BoxFuture, FutureExt};
use url::Url;

use super::{
    CleanupError, InterceptorContext, InterceptorCore, InterceptorHandle, InterceptorRegistration,
    fallback_table,
};

const CATEGORY: &str = "websocket";
const CONNECT: &str = "websocket.connect";
const SEND: &str = "websocket.send";
const RECV: &str = "websocket.recv";

/// Abnormal closure, as reported for a connection lost without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;
const REORDER_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketFault {
    SlowHandshake,
    HandshakeRefused,
    DelayedSend,
    DroppedFrame,
    DuplicateFrame,
    FragmentedFrame,
    DelayedDelivery,
    ReorderedDelivery,
    DuplicateDelivery,
    ForcedClose,
}

impl FaultVariant for SocketFault {
    fn name(self) -> &'static str {
        match self {
            Self::SlowHandshake => "slow-handshake",
            Self::HandshakeRefused => "handshake-refused",
            Self::DelayedSend => "delayed-send",
            Self::DroppedFrame => "dropped-frame",
            Self::DuplicateFrame => "duplicate-frame",
            Self::FragmentedFrame => "fragmented-frame",
            Self::DelayedDelivery => "delayed-delivery",
            Self::ReorderedDelivery => "reordered-delivery",
            Self::DuplicateDelivery => "duplicate-delivery",
            Self::ForcedClose => "forced-close",
        }
    }

    fn family(self) -> FaultFamily {
        match self {
            Self::SlowHandshake | Self::DelayedSend | Self::DelayedDelivery => FaultFamily::Latency,
            Self::HandshakeRefused | Self::ForcedClose => FaultFamily::Error,
            Self::DroppedFrame => FaultFamily::Drop,
            Self::DuplicateFrame | Self::DuplicateDelivery => FaultFamily::Duplication,
            Self::FragmentedFrame => FaultFamily::Batch,
            Self::ReorderedDelivery => FaultFamily::Reorder,
        }
    }

    fn safe_fallback(self) -> Self {
        match self {
            Self::HandshakeRefused => Self::SlowHandshake,
            Self::DroppedFrame => Self::DelayedSend,
            Self::ForcedClose => Self::DelayedDelivery,
            other => other,
        }
    }
}

pub(crate) fn menu() -> FaultMenu<SocketFault> {
    use SocketFault::*;
    FaultMenu::new()
        .with(CONNECT, &[SlowHandshake, HandshakeRefused])
        .with(SEND, &[DelayedSend, DroppedFrame, DuplicateFrame, FragmentedFrame])
        .with(
            RECV,
            &[DelayedDelivery, ReorderedDelivery, DuplicateDelivery, ForcedClose],
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
        name: "websocket",
        categories: &[CATEGORY],
        catalog,
        fallbacks,
    }
}

/// Counts a wrapped socket as open until it is dropped.
struct OpenSocket(Arc<AtomicUsize>);

impl OpenSocket {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenSocket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Split `text` into `parts` pieces on char boundaries. `None` when the
/// text is too short to split.
fn fragment(text: &str, parts: usize) -> Option<Vec<String>> {
    let chars = text.chars().collect::<Vec<_>>();
    if parts < 2 || chars.len() < parts {
        return None;
    }
    let size = chars.len().div_ceil(parts);
    Some(
        chars
            .chunks(size)
            .map(|chunk| chunk.iter().collect())
            .collect(),
    )
}

pub struct ChaosConnector {
    real: Arc<dyn WebSocketConnector>,
    core: Arc<InterceptorCore<SocketFault>>,
    open: Arc<AtomicUsize>,
}

pub fn install(ctx: &InterceptorContext, real: Arc<dyn WebSocketConnector>) -> Arc<ChaosConnector> {
    Arc::new(ChaosConnector {
        real,
        core: Arc::new(InterceptorCore::new(ctx, "websocket", menu())),
        open: Arc::new(AtomicUsize::new(0)),
    })
}

impl ChaosConnector {
    /// Wrapped sockets not yet dropped.
    pub fn active_sockets(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl WebSocketConnector for ChaosConnector {
    fn connect(
        &self,
        url: Url,
    ) -> BoxFuture<'static, Result<Box<dyn WebSocketConnection>, SocketError>> {
        if self.core.is_detached() {
            return self.real.connect(url);
        }
        let (core, real, open) = (self.core.clone(), self.real.clone(), self.open.clone());
        let fault = core.decide(CATEGORY, CONNECT);
        async move {
            match fault {
                Some(SocketFault::HandshakeRefused) => {
                    core.emit(
                        CATEGORY,
                        SocketFault::HandshakeRefused,
                        format!("handshake with {url} refused"),
                        0,
                    );
                    return Err(SocketError::HandshakeRefused(url.to_string()));
                }
                Some(_) => {
                    let delay_ms = core.draw_ms(200..=3000);
                    core.emit(
                        CATEGORY,
                        SocketFault::SlowHandshake,
                        format!("handshake with {url} slowed by {delay_ms}ms"),
                        delay_ms,
                    );
                    core.pause(delay_ms).await;
                }
                None => {}
            }
            let inner = real.connect(url).await?;
            Ok(Box::new(ChaosSocket {
                inner,
                core,
                queued: VecDeque::new(),
                _open: OpenSocket::new(open),
            }) as Box<dyn WebSocketConnection>)
        }
        .boxed()
    }
}

/// One wrapped connection. Messages pulled early by a reorder or copied by
/// a duplicate wait in `queued` and are handed out before the next read.
pub struct ChaosSocket {
    inner: Box<dyn WebSocketConnection>,
    core: Arc<InterceptorCore<SocketFault>>,
    queued: VecDeque<SocketMessage>,
    _open: OpenSocket,
}

impl ChaosSocket {
    async fn send_delayed(&mut self, message: SocketMessage) -> Result<(), SocketError> {
        let delay_ms = self.core.draw_ms(50..=1500);
        self.core.emit(
            CATEGORY,
            SocketFault::DelayedSend,
            format!("{}-byte frame held for {delay_ms}ms", message.len()),
            delay_ms,
        );
        self.core.pause(delay_ms).await;
        self.inner.send(message).await
    }
}

impl WebSocketConnection for ChaosSocket {
    fn url(&self) -> &Url {
        self.inner.url()
    }

    fn send(&mut self, message: SocketMessage) -> BoxFuture<'_, Result<(), SocketError>> {
        async move {
            let Some(fault) = self.core.decide(CATEGORY, SEND) else {
                return self.inner.send(message).await;
            };
            match fault {
                SocketFault::DroppedFrame => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("{}-byte frame dropped", message.len()),
                        0,
                    );
                    Ok(())
                }
                SocketFault::DuplicateFrame => {
                    let copies = self.core.draw_copies();
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("frame sent {copies} extra times"),
                        0,
                    );
                    for _ in 0..copies {
                        self.inner.send(message.clone()).await?;
                    }
                    self.inner.send(message).await
                }
                SocketFault::FragmentedFrame => {
                    let parts = self.core.draw_ms(2..=4) as usize;
                    let pieces = match &message {
                        SocketMessage::Text(text) => fragment(text, parts),
                        _ => None,
                    };
                    let Some(pieces) = pieces else {
                        return self.send_delayed(message).await;
                    };
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("text frame split into {} frames", pieces.len()),
                        0,
                    );
                    for piece in pieces {
                        self.inner.send(SocketMessage::Text(piece)).await?;
                    }
                    Ok(())
                }
                _ => self.send_delayed(message).await,
            }
        }
        .boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<SocketMessage, SocketError>>> {
        async move {
            if let Some(message) = self.queued.pop_front() {
                return Some(Ok(message));
            }
            let Some(fault) = self.core.decide(CATEGORY, RECV) else {
                return self.inner.recv().await;
            };
            match fault {
                SocketFault::ForcedClose => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("connection closed with code {ABNORMAL_CLOSE}"),
                        0,
                    );
                    // The close result is irrelevant; the caller sees 1006.
                    let _ = self.inner.close().await;
                    Some(Err(SocketError::Closed {
                        code: ABNORMAL_CLOSE,
                    }))
                }
                SocketFault::ReorderedDelivery => {
                    self.core.emit(
                        CATEGORY,
                        fault,
                        "next two messages swapped when both arrive",
                        0,
                    );
                    let first = match self.inner.recv().await {
                        Some(Ok(message)) => message,
                        other => return other,
                    };
                    match tokio::time::timeout(REORDER_WINDOW, self.inner.recv()).await {
                        Ok(Some(Ok(second))) => {
                            self.queued.push_back(first);
                            Some(Ok(second))
                        }
                        Ok(Some(Err(error))) => {
                            self.queued.push_back(first);
                            Some(Err(error))
                        }
                        Ok(None) | Err(_) => Some(Ok(first)),
                    }
                }
                SocketFault::DuplicateDelivery => {
                    let copies = self.core.draw_copies();
                    self.core.emit(
                        CATEGORY,
                        fault,
                        format!("next message delivered {copies} extra times"),
                        0,
                    );
                    let received = self.inner.recv().await;
                    if let Some(Ok(message)) = &received {
                        self.queued.extend(std::iter::repeat_n(message.clone(), copies));
                    }
                    received
                }
                _ => {
                    let delay_ms = self.core.draw_ms(50..=1500);
                    self.core.emit(
                        CATEGORY,
                        SocketFault::DelayedDelivery,
                        format!("next message held for {delay_ms}ms"),
                        delay_ms,
                    );
                    let received = self.inner.recv().await;
                    self.core.pause(delay_ms).await;
                    received
                }
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SocketError>> {
        self.inner.close()
    }
}

impl InterceptorHandle for ChaosConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn cleanup(&self) -> Result<(), CleanupError> {
        self.core.shutdown();
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.core.is_detached()
    }

    fn active_resources(&self) -> usize {
        self.core.pending() + self.active_sockets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptors::testing::Harness;
    use faultshell_runtime::LoopbackConnector;
    use rstest::rstest;

    fn echo() -> Url {
        Url::parse("ws://echo.test/").unwrap()
    }

    #[rstest]
    #[case("abcdefgh", 2, vec!["abcd", "efgh"])]
    #[case("abcdefg", 3, vec!["abc", "def", "g"])]
    #[case("héllo", 4, vec!["hé", "ll", "o"])]
    fn fragments_respect_char_boundaries(
        #[case] text: &str,
        #[case] parts: usize,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(fragment(text, parts).unwrap(), expected);
    }

    #[test]
    fn short_text_is_not_fragmented() {
        assert_eq!(fragment("a", 2), None);
    }

    #[tokio::test]
    async fn pass_through_echoes_and_tracks_the_socket() {
        let harness = Harness::never();
        let chaos = install(&harness.ctx, Arc::new(LoopbackConnector::new()));

        let mut socket = chaos.connect(echo()).await.unwrap();
        assert_eq!(chaos.active_sockets(), 1);
        socket.send(SocketMessage::Text("hi".into())).await.unwrap();
        assert_eq!(socket.recv().await, Some(Ok(SocketMessage::Text("hi".into()))));
        drop(socket);

        assert_eq!(chaos.active_sockets(), 0);
        assert_eq!(harness.event_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_mode_loses_no_bytes() {
        let harness = Harness::always(true, 19);
        let chaos = install(&harness.ctx, Arc::new(LoopbackConnector::new()));
        let mut socket = chaos.connect(echo()).await.unwrap();

        let sent = (0..6).map(|index| format!("message-{index}")).collect::<Vec<_>>();
        for text in &sent {
            socket.send(SocketMessage::Text(text.clone())).await.unwrap();
        }
        socket.close().await.unwrap();

        let mut received = String::new();
        while let Some(message) = socket.recv().await {
            if let Ok(SocketMessage::Text(text)) = message {
                received.push_str(&text);
            }
        }
        let total = sent.iter().map(String::len).sum::<usize>();
        assert!(received.len() >= total);
        harness.assert_all_recoverable();
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_mode_refuses_handshakes_and_forces_closes() {
        let harness = Harness::always(false, 23);
        let chaos = install(&harness.ctx, Arc::new(LoopbackConnector::new()));

        let mut refused = 0;
        let mut closed = 0;
        for _ in 0..60 {
            match chaos.connect(echo()).await {
                Err(SocketError::HandshakeRefused(_)) => refused += 1,
                Ok(mut socket) => {
                    socket.send(SocketMessage::Text("ping".into())).await.unwrap();
                    socket.close().await.unwrap();
                    if let Some(Err(SocketError::Closed { code })) = socket.recv().await {
                        assert_eq!(code, ABNORMAL_CLOSE);
                        closed += 1;
                    }
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(refused > 0);
        assert!(closed > 0);
        assert_eq!(chaos.active_sockets(), 0);
    }

    #[tokio::test]
    async fn detached_connector_hands_out_real_sockets() {
        let harness = Harness::always(false, 1);
        let real = Arc::new(LoopbackConnector::new());
        let chaos = install(&harness.ctx, real.clone());
        chaos.cleanup().unwrap();

        let mut socket = chaos.connect(echo()).await.unwrap();
        socket.send(SocketMessage::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(socket.recv().await, Some(Ok(SocketMessage::Binary(vec![1, 2]))));
        assert_eq!(chaos.active_sockets(), 0);
        assert_eq!(real.connections_opened(), 1);
        assert_eq!(harness.event_count(), 0);
    }
}
