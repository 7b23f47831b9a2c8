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

//! Shared helpers for integration tests.

#![allow(dead_code, reason = "each test binary uses a subset")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as link_channel;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use fusion_client::{
    Connector, Link, ReconnectingSocket, RetryPolicy, SocketConfig, SocketError, SocketState,
};

/// Server side of one in-memory connection.
pub struct ServerEnd {
    /// Frames the client sent.
    pub received: link_channel::UnboundedReceiver<String>,
    /// Push frames to the client. Dropping it closes the connection.
    pub outbound: link_channel::UnboundedSender<Result<String, SocketError>>,
}

/// Connector that completes every handshake with an in-memory link.
pub struct LoopbackConnector {
    connects: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            connects: AtomicUsize::new(0),
            servers,
        });
        (connector, server_rx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _url: &str) -> Result<Link, SocketError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (to_server, received) = link_channel::unbounded();
        let (outbound, from_server) = link_channel::unbounded();
        let _ = self.servers.send(ServerEnd { received, outbound });

        Ok(Link {
            sink: Box::pin(to_server.sink_map_err(|e| SocketError::Transport(e.to_string()))),
            stream: Box::pin(from_server),
        })
    }
}

pub fn loopback_socket(connector: Arc<LoopbackConnector>, url: &str) -> ReconnectingSocket {
    ReconnectingSocket::with_connector(
        SocketConfig {
            url: url.to_string(),
            retry: RetryPolicy::Immediate,
            ..Default::default()
        },
        connector,
    )
}

pub async fn connected(socket: &ReconnectingSocket) {
    timeout(Duration::from_secs(5), socket.wait_for_state(SocketState::Connected))
        .await
        .expect("socket did not connect");
}

pub async fn next_server(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    timeout(Duration::from_secs(5), servers.recv())
        .await
        .expect("no connection made")
        .expect("connector dropped")
}
