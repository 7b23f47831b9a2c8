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

//! Streams this device's position to the server.
//!
//! Each fix from the device feed becomes one JSON text frame:
//!
//! ```json
//! {"latitude": 42.73, "longitude": -73.68, "heading": 90.0, "speed": null, "track": "<session id>"}
//! ```
//!
//! Frames are fire-and-forget. Fixes that arrive while the socket is
//! reconnecting are dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PositionError;
use crate::position::{GeoPosition, PositionFeed, PositionSource, WatchOptions};
use crate::session::SessionId;
use crate::socket::ReconnectingSocket;

/// One outbound position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    /// Session the sample belongs to.
    pub track: SessionId,
}

impl PositionSample {
    /// Build a sample from a fix, rejecting non-finite values rather than
    /// sending malformed data.
    pub fn from_position(position: &GeoPosition, track: SessionId) -> Result<Self, PositionError> {
        let coords = &position.coords;

        finite("latitude", Some(coords.latitude))?;
        finite("longitude", Some(coords.longitude))?;
        finite("heading", coords.heading)?;
        finite("speed", coords.speed)?;

        Ok(Self {
            latitude: coords.latitude,
            longitude: coords.longitude,
            heading: coords.heading,
            speed: coords.speed,
            track,
        })
    }

    /// Encode as a wire frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn finite(field: &str, value: Option<f64>) -> Result<(), PositionError> {
    match value {
        Some(v) if !v.is_finite() => Err(PositionError::InvalidSample(format!("{field} is {v}"))),
        _ => Ok(()),
    }
}

/// Counters describing what happened to the fixes a publisher saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Frames handed to a live connection.
    pub sent: u64,
    /// Samples dropped because no connection was live.
    pub dropped: u64,
    /// Samples rejected as malformed.
    pub rejected: u64,
    /// Failed fixes reported by the device feed.
    pub failed_fixes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    failed_fixes: AtomicU64,
}

/// Publishes the device position over a [`ReconnectingSocket`].
pub struct LocationPublisher {
    socket: Arc<ReconnectingSocket>,
    source: Arc<dyn PositionSource>,
    session_id: SessionId,
    options: WatchOptions,
    counters: Arc<Counters>,
    started: AtomicBool,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for LocationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationPublisher")
            .field("session_id", &self.session_id)
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl LocationPublisher {
    /// Create a publisher with a fresh session identifier.
    #[must_use]
    pub fn new(socket: ReconnectingSocket, source: Arc<dyn PositionSource>) -> Self {
        Self::with_session_id(socket, source, SessionId::generate())
    }

    /// Create a publisher with a caller-chosen session identifier.
    #[must_use]
    pub fn with_session_id(
        socket: ReconnectingSocket,
        source: Arc<dyn PositionSource>,
        session_id: SessionId,
    ) -> Self {
        info!("Location publisher created with session {}", session_id);
        Self {
            socket: Arc::new(socket),
            source,
            session_id,
            options: WatchOptions::default(),
            counters: Arc::new(Counters::default()),
            started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Override the options used when watching the position source.
    #[must_use]
    pub fn with_watch_options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn socket(&self) -> &ReconnectingSocket {
        &self.socket
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            failed_fixes: self.counters.failed_fixes.load(Ordering::Relaxed),
        }
    }

    /// Open the socket and start streaming fixes.
    ///
    /// When the device cannot position at all this is logged and returned
    /// once; the publisher stays idle and is not retried. Only the first
    /// call does anything.
    pub async fn start(&self) -> Result<(), PositionError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.socket.open();

        let feed = match self.source.watch(self.options).await {
            Ok(feed) => feed,
            Err(e) => {
                info!("Client does not support geolocation: {}", e);
                return Err(e);
            }
        };

        tokio::spawn(publish_loop(
            feed,
            Arc::clone(&self.socket),
            self.session_id,
            Arc::clone(&self.counters),
            self.cancel_token.clone(),
        ));
        Ok(())
    }

    /// Stop publishing and close the socket.
    pub fn stop(&self) {
        self.cancel_token.cancel();
        self.socket.shutdown();
    }
}

impl Drop for LocationPublisher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn publish_loop(
    mut feed: PositionFeed,
    socket: Arc<ReconnectingSocket>,
    session_id: SessionId,
    counters: Arc<Counters>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            update = feed.recv() => {
                match update {
                    Some(Ok(position)) => publish(&position, &socket, session_id, &counters),
                    Some(Err(e)) => {
                        // The feed keeps its own retry cadence.
                        debug!("Could not get position: {}", e);
                        counters.failed_fixes.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        info!("Position feed ended");
                        return;
                    }
                }
            }

            () = cancel_token.cancelled() => {
                info!("Location publisher stopped");
                return;
            }
        }
    }
}

fn publish(position: &GeoPosition, socket: &ReconnectingSocket, session_id: SessionId, counters: &Counters) {
    let frame = match PositionSample::from_position(position, session_id)
        .map_err(|e| e.to_string())
        .and_then(|sample| sample.to_json().map_err(|e| e.to_string()))
    {
        Ok(frame) => frame,
        Err(reason) => {
            warn!("Rejected position sample: {}", reason);
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match socket.send(frame) {
        Ok(()) => {
            counters.sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            debug!("Dropped position sample: {}", e);
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_sample_wire_format() {
        let track = SessionId::generate();
        let position = GeoPosition::new(42.7302, -73.6788, Utc::now()).with_heading(90.0);
        let sample = PositionSample::from_position(&position, track).unwrap();

        let value: serde_json::Value = serde_json::from_str(&sample.to_json().unwrap()).unwrap();
        assert_eq!(value["latitude"], 42.7302);
        assert_eq!(value["longitude"], -73.6788);
        assert_eq!(value["heading"], 90.0);
        assert!(value["speed"].is_null());
        assert_eq!(value["track"], track.to_string());
        assert_eq!(value.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let track = SessionId::generate();

        let position = GeoPosition::new(f64::NAN, -73.6788, Utc::now());
        assert!(matches!(
            PositionSample::from_position(&position, track),
            Err(PositionError::InvalidSample(_))
        ));

        let position = GeoPosition::new(42.0, -73.0, Utc::now()).with_speed(f64::INFINITY);
        assert!(matches!(
            PositionSample::from_position(&position, track),
            Err(PositionError::InvalidSample(_))
        ));
    }

    #[test]
    fn test_absent_heading_and_speed_are_allowed() {
        let position = GeoPosition::new(42.0, -73.0, Utc::now());
        let sample = PositionSample::from_position(&position, SessionId::generate()).unwrap();
        assert_eq!(sample.heading, None);
        assert_eq!(sample.speed, None);
    }
}
