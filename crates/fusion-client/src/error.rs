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

//! Error types shared across the client layers.

use thiserror::Error;

/// Transport-level failures. These never escape the reconnect loop as a
/// fault; they are logged and turned into a reconnect.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    #[error("handshake with {url} failed: {reason}")]
    Handshake { url: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for SocketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Reasons a frame handed to [`crate::ReconnectingSocket::send`] was not sent.
///
/// Dropping is the normal contract while the socket is reconnecting; callers
/// that need durability can react to this and queue on their side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no live connection")]
    NotConnected,

    #[error("outbound queue is full")]
    QueueFull,
}

/// Failures reported by a device position feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The device cannot provide continuous positioning at all.
    #[error("continuous positioning is not supported: {0}")]
    Unsupported(String),

    #[error("permission to read position was denied")]
    PermissionDenied,

    /// No fix for this sample (signal lost, timeout, no satellites).
    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("invalid position sample: {0}")]
    InvalidSample(String),
}

/// Failures deriving a socket endpoint from a page URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("invalid page url '{0}'")]
    InvalidUrl(String),

    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    #[error("page url '{0}' has no host")]
    MissingHost(String),
}

/// Failures decoding an inbound vehicle update frame.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("malformed vehicle update: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid value for field '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
}
