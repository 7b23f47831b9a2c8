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

//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::future;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{Connector, Link};
use crate::error::SocketError;

/// Opens WebSocket connections. Only text frames are surfaced; control
/// frames are handled by the library and binary frames are ignored.
///
/// `wss://` endpoints need the `tls` feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, SocketError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| SocketError::Handshake {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(SocketError::from)
            .with(|text: String| future::ready(Ok::<_, SocketError>(Message::text(text))));

        let stream = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(_) => None,
                Err(e) => Some(Err(SocketError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
