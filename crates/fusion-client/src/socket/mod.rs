// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Message socket with automatic reconnection.
//!
//! [`ReconnectingSocket`] owns at most one live connection at a time. When
//! that connection closes for any reason it is discarded and a new one is
//! requested according to the configured [`RetryPolicy`]. Frames sent while
//! no connection is live are dropped and reported as [`SendError`]; nothing
//! is queued across connections.

mod retry;
mod websocket;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub use retry::{RetryConfig, RetryMode, RetryPolicy};
pub use websocket::WebSocketConnector;

use crate::error::{SendError, SocketError};

/// Outbound half of a live connection. Each item is one text frame.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SocketError> + Send>>;

/// Inbound half of a live connection. The stream ending means the remote
/// closed the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, SocketError>> + Send>>;

/// A freshly established connection, split into its two halves.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Establishes new connections for a [`ReconnectingSocket`].
///
/// Returning `Ok` means the handshake completed.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Link, SocketError>;
}

/// Configuration for a [`ReconnectingSocket`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Endpoint, e.g. `ws://localhost:8080/fusion`.
    pub url: String,
    /// What to do after a connection closes or fails to open.
    pub retry: RetryPolicy,
    /// Frames buffered for the live connection before `send` reports
    /// [`SendError::QueueFull`].
    pub outbound_capacity: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/fusion".to_string(),
            retry: RetryPolicy::default(),
            outbound_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No live connection and no attempt in flight.
    Disconnected,
    /// Waiting for a handshake to complete.
    Connecting,
    /// A live connection is current.
    Connected,
    /// The retry policy ran out of attempts. `open()` starts over.
    GaveUp,
}

/// Events emitted by the socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Connection state changed.
    StateChanged(SocketState),
    /// One inbound text frame.
    Message(String),
    /// A handshake failed or a live connection broke.
    Error(String),
}

struct Shared {
    current: RwLock<Option<mpsc::Sender<String>>>,
    state_tx: watch::Sender<SocketState>,
    event_tx: broadcast::Sender<SocketEvent>,
    running: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SocketState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            self.emit(SocketEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SocketEvent) {
        // No subscribers is the default no-op handler.
        let _ = self.event_tx.send(event);
    }

    fn install(&self, frame_tx: mpsc::Sender<String>) {
        match self.current.write() {
            Ok(mut current) => *current = Some(frame_tx),
            Err(poisoned) => *poisoned.into_inner() = Some(frame_tx),
        }
    }

    fn discard(&self) {
        match self.current.write() {
            Ok(mut current) => *current = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn current(&self) -> Option<mpsc::Sender<String>> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Socket that keeps exactly one live connection open, reconnecting on
/// every closure.
///
/// Inbound frames are delivered as [`SocketEvent::Message`] to every
/// [`subscribe`](Self::subscribe)r; with no subscribers they are discarded.
pub struct ReconnectingSocket {
    config: SocketConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ReconnectingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSocket")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReconnectingSocket {
    /// Create a WebSocket-backed socket. Nothing connects until [`open`](Self::open).
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Create a socket that uses a custom transport.
    #[must_use]
    pub fn with_connector(config: SocketConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(SocketState::Disconnected);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                current: RwLock::new(None),
                state_tx,
                event_tx,
                running: AtomicBool::new(false),
            }),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Request a connection.
    ///
    /// Idempotent: while a connection loop is already running (connecting,
    /// connected or waiting to reconnect) this does nothing. Must be called
    /// from within a tokio runtime.
    pub fn open(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            debug!("Socket to {} already open", self.config.url);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Cannot open socket to {}: no tokio runtime", self.config.url);
            self.shared.running.store(false, Ordering::Release);
            return;
        };

        runtime.spawn(connection_loop(
            Arc::clone(&self.connector),
            self.config.clone(),
            Arc::clone(&self.shared),
            self.cancel_token.clone(),
        ));
    }

    /// Send one text frame on the live connection.
    ///
    /// Never blocks. Frames are not queued across reconnects: when no
    /// connection is live the frame is dropped and
    /// [`SendError::NotConnected`] is returned.
    pub fn send(&self, message: impl Into<String>) -> Result<(), SendError> {
        let Some(frame_tx) = self.shared.current() else {
            return Err(SendError::NotConnected);
        };

        frame_tx.try_send(message.into()).map_err(|err| match err {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Subscribe to state changes, inbound frames and errors.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Watch the connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.shared.state_tx.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        *self.shared.state_tx.borrow()
    }

    /// Wait until the socket reaches `state`. Returns immediately if it is
    /// already there.
    pub async fn wait_for_state(&self, state: SocketState) {
        let mut state_rx = self.shared.state_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = state_rx.wait_for(|current| *current == state).await;
    }

    /// Endpoint this socket connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Close the live connection and stop reconnecting. The socket cannot be
    /// reopened afterwards.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for ReconnectingSocket {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn connection_loop(
    connector: Arc<dyn Connector>,
    config: SocketConfig,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
) {
    let url = config.url.as_str();
    let mut attempt: u32 = 0;
    let _running = RunningGuard(Arc::clone(&shared));

    loop {
        if cancel_token.is_cancelled() {
            info!("Socket to {} cancelled", url);
            break;
        }

        shared.set_state(SocketState::Connecting);
        info!("Connecting to {}...", url);

        let connected = tokio::select! {
            result = connector.connect(url) => result,
            () = cancel_token.cancelled() => {
                info!("Socket to {} cancelled while connecting", url);
                break;
            }
        };

        match connected {
            Ok(link) => {
                info!("Connected to {}", url);
                attempt = 0;

                let (frame_tx, frame_rx) = mpsc::channel(config.outbound_capacity.max(1));
                shared.install(frame_tx);
                shared.set_state(SocketState::Connected);

                let reason = pump(link, frame_rx, &shared, &cancel_token).await;
                // A closed handle is never reused.
                shared.discard();

                match reason {
                    CloseReason::Cancelled => {
                        info!("Socket to {} cancelled", url);
                        break;
                    }
                    CloseReason::Closed => {
                        info!("Connection to {} closed", url);
                    }
                    CloseReason::Failed(e) => {
                        warn!("Connection to {} failed: {}", url, e);
                        shared.emit(SocketEvent::Error(e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!("Connection error: {}", e);
                shared.emit(SocketEvent::Error(e.to_string()));
            }
        }

        shared.set_state(SocketState::Disconnected);

        let Some(delay) = config.retry.next_delay(attempt) else {
            warn!("Giving up on {} after {} attempts", url, attempt + 1);
            shared.set_state(SocketState::GaveUp);
            return;
        };
        attempt = attempt.saturating_add(1);

        if delay.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        warn!("Reconnecting to {} in {:?}...", url, delay);
        tokio::select! {
            () = sleep(delay) => {}
            () = cancel_token.cancelled() => {
                info!("Socket to {} cancelled during reconnect delay", url);
                break;
            }
        }
    }
}

/// Marks the connection loop as stopped however it ends, unwinding included,
/// so a later `open()` can start a new one.
struct RunningGuard(Arc<Shared>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.discard();
        let gave_up = *self.0.state_tx.borrow() == SocketState::GaveUp;
        if !gave_up {
            self.0.set_state(SocketState::Disconnected);
        }
        self.0.running.store(false, Ordering::Release);
    }
}

enum CloseReason {
    Closed,
    Failed(SocketError),
    Cancelled,
}

async fn pump(
    link: Link,
    mut frame_rx: mpsc::Receiver<String>,
    shared: &Shared,
    cancel_token: &CancellationToken,
) -> CloseReason {
    let Link {
        mut sink,
        mut stream,
    } = link;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(text)) => shared.emit(SocketEvent::Message(text)),
                    Some(Err(SocketError::Closed)) | None => return CloseReason::Closed,
                    Some(Err(e)) => return CloseReason::Failed(e),
                }
            }

            Some(frame) = frame_rx.recv() => {
                match sink.send(frame).await {
                    Ok(()) => {}
                    Err(SocketError::Closed) => return CloseReason::Closed,
                    Err(e) => return CloseReason::Failed(e),
                }
            }

            () = cancel_token.cancelled() => {
                let _ = sink.close().await;
                return CloseReason::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::channel::mpsc as link_channel;
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    use super::*;

    /// Remote side of one scripted connection.
    struct RemoteEnd {
        sent: link_channel::UnboundedReceiver<String>,
        inbound: link_channel::UnboundedSender<Result<String, SocketError>>,
    }

    /// Connector whose handshakes complete only when the test allows them.
    struct ScriptedConnector {
        attempts: AtomicUsize,
        handshakes: Semaphore,
        refuse: AtomicBool,
        remotes: mpsc::UnboundedSender<RemoteEnd>,
    }

    impl ScriptedConnector {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
            let (remotes, remote_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                attempts: AtomicUsize::new(0),
                handshakes: Semaphore::new(0),
                refuse: AtomicBool::new(false),
                remotes,
            });
            (connector, remote_rx)
        }

        fn allow(&self, handshakes: usize) {
            self.handshakes.add_permits(handshakes);
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &str) -> Result<Link, SocketError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SocketError::Handshake {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            self.handshakes
                .acquire()
                .await
                .map_err(|e| SocketError::Transport(e.to_string()))?
                .forget();

            let (out_tx, out_rx) = link_channel::unbounded();
            let (in_tx, in_rx) = link_channel::unbounded();
            let _ = self.remotes.send(RemoteEnd {
                sent: out_rx,
                inbound: in_tx,
            });

            Ok(Link {
                sink: Box::pin(out_tx.sink_map_err(|e| SocketError::Transport(e.to_string()))),
                stream: Box::pin(in_rx),
            })
        }
    }

    fn socket(connector: Arc<ScriptedConnector>, retry: RetryPolicy) -> ReconnectingSocket {
        ReconnectingSocket::with_connector(
            SocketConfig {
                url: "ws://test/fusion".to_string(),
                retry,
                ..Default::default()
            },
            connector,
        )
    }

    async fn wait_for_state(events: &mut broadcast::Receiver<SocketEvent>, state: SocketState) {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(SocketEvent::StateChanged(s)) if s == state => return,
                    Ok(_) => {}
                    Err(e) => panic!("event channel failed: {e}"),
                }
            }
        })
        .await
        .expect("state not reached");
    }

    async fn wait_for_attempts(connector: &ScriptedConnector, attempts: usize) {
        timeout(Duration::from_secs(5), async {
            while connector.attempts() < attempts {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("attempt not made");
    }

    #[tokio::test]
    async fn test_send_before_open_is_dropped() {
        let (connector, _remotes) = ScriptedConnector::new();
        let socket = socket(connector, RetryPolicy::Immediate);

        assert_eq!(socket.send("hello"), Err(SendError::NotConnected));
        assert_eq!(socket.state(), SocketState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (connector, _remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);

        socket.open();
        socket.open();
        wait_for_attempts(&connector, 1).await;
        socket.open();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(connector.attempts(), 1);
        assert_eq!(socket.state(), SocketState::Connecting);
    }

    #[tokio::test]
    async fn test_send_reaches_live_connection() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);
        let mut events = socket.subscribe();

        connector.allow(1);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        socket.send("hello").unwrap();
        assert_eq!(remote.sent.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_wait_for_state_resolves_on_connect() {
        let (connector, _remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);

        timeout(Duration::from_secs(1), socket.wait_for_state(SocketState::Disconnected))
            .await
            .unwrap();

        connector.allow(1);
        socket.open();
        timeout(Duration::from_secs(5), socket.wait_for_state(SocketState::Connected))
            .await
            .unwrap();
        assert_eq!(socket.state(), SocketState::Connected);
    }

    #[tokio::test]
    async fn test_reconnects_once_after_unexpected_close() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);
        let mut events = socket.subscribe();

        connector.allow(1);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let RemoteEnd { sent: _sent, inbound } = remotes.recv().await.unwrap();

        // Remote goes away.
        drop(inbound);
        wait_for_state(&mut events, SocketState::Connecting).await;
        wait_for_attempts(&connector, 2).await;

        // Handshake still pending: the frame is dropped, not queued.
        assert_eq!(socket.send("lost"), Err(SendError::NotConnected));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.attempts(), 2);

        connector.allow(1);
        wait_for_state(&mut events, SocketState::Connected).await;
        let mut second = remotes.recv().await.unwrap();
        assert_eq!(connector.attempts(), 2);

        socket.send("after").unwrap();
        assert_eq!(second.sent.next().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_inbound_frames_become_events() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);
        let mut events = socket.subscribe();

        connector.allow(1);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let remote = remotes.recv().await.unwrap();

        remote
            .inbound
            .unbounded_send(Ok("{\"vehicle_id\":1}".to_string()))
            .unwrap();

        let message = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SocketEvent::Message(text)) = events.recv().await {
                    return text;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message, "{\"vehicle_id\":1}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_policy_exhausted() {
        let (connector, _remotes) = ScriptedConnector::new();
        connector.refuse.store(true, Ordering::SeqCst);
        let socket = socket(
            Arc::clone(&connector),
            RetryPolicy::Fixed {
                delay: Duration::from_secs(1),
                max_attempts: Some(2),
            },
        );
        let mut events = socket.subscribe();

        socket.open();
        wait_for_state(&mut events, SocketState::GaveUp).await;

        assert_eq!(connector.attempts(), 3);
        assert_eq!(socket.state(), SocketState::GaveUp);

        // A later open starts over.
        socket.open();
        wait_for_attempts(&connector, 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_signals_error_then_retries() {
        let (connector, _remotes) = ScriptedConnector::new();
        connector.refuse.store(true, Ordering::SeqCst);
        let socket = socket(
            Arc::clone(&connector),
            RetryPolicy::Fixed {
                delay: Duration::from_secs(1),
                max_attempts: None,
            },
        );
        let mut events = socket.subscribe();

        socket.open();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while seen.len() < 4 {
                match events.recv().await.unwrap() {
                    SocketEvent::StateChanged(state) => seen.push(format!("{state:?}")),
                    SocketEvent::Error(_) => seen.push("Error".to_string()),
                    SocketEvent::Message(_) => {}
                }
            }
        })
        .await
        .expect("retry not attempted");

        assert_eq!(seen, ["Connecting", "Error", "Disconnected", "Connecting"]);
        wait_for_attempts(&connector, 2).await;
        socket.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nan_jitter_still_reconnects() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(
            Arc::clone(&connector),
            RetryPolicy::Exponential {
                base: Duration::from_millis(10),
                max: Duration::from_secs(1),
                jitter: f64::NAN,
                max_attempts: None,
            },
        );
        let mut events = socket.subscribe();

        connector.allow(2);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let RemoteEnd { sent: _sent, inbound } = remotes.recv().await.unwrap();

        drop(inbound);
        wait_for_state(&mut events, SocketState::Disconnected).await;
        wait_for_state(&mut events, SocketState::Connected).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_loop_that_ends_can_be_reopened() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(
            Arc::clone(&connector),
            RetryPolicy::Fixed {
                delay: Duration::ZERO,
                max_attempts: Some(0),
            },
        );
        let mut events = socket.subscribe();

        connector.allow(2);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let RemoteEnd { sent: _sent, inbound } = remotes.recv().await.unwrap();

        drop(inbound);
        wait_for_state(&mut events, SocketState::GaveUp).await;

        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting() {
        let (connector, mut remotes) = ScriptedConnector::new();
        let socket = socket(Arc::clone(&connector), RetryPolicy::Immediate);
        let mut events = socket.subscribe();

        connector.allow(1);
        socket.open();
        wait_for_state(&mut events, SocketState::Connected).await;
        let mut remote = remotes.recv().await.unwrap();

        socket.shutdown();
        wait_for_state(&mut events, SocketState::Disconnected).await;

        // Sink was closed, so the remote sees the end of the stream.
        assert_eq!(remote.sent.next().await, None);
        assert_eq!(socket.send("late"), Err(SendError::NotConnected));
        assert_eq!(connector.attempts(), 1);
    }
}
