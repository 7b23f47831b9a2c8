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

//! Device position feeds.
//!
//! A [`PositionSource`] is the device's continuous positioning capability.
//! Watching it yields a [`PositionFeed`] of fixes and per-fix failures; a
//! source that cannot position at all refuses the watch with
//! [`PositionError::Unsupported`].

mod gpsd;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub use gpsd::{GpsdSource, DEFAULT_GPSD_ADDRESS};

use crate::error::PositionError;

/// Coordinates reported with a fix. Heading and speed are absent when the
/// sensor does not report them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Direction of travel in degrees clockwise from true north.
    pub heading: Option<f64>,
    /// Ground speed in meters per second.
    pub speed: Option<f64>,
}

/// One position fix from a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub coords: Coordinates,
    pub timestamp: DateTime<Utc>,
}

impl GeoPosition {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            coords: Coordinates {
                latitude,
                longitude,
                heading: None,
                speed: None,
            },
            timestamp,
        }
    }

    #[must_use]
    pub fn with_heading(mut self, heading: f64) -> Self {
        self.coords.heading = Some(heading);
        self
    }

    #[must_use]
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.coords.speed = Some(speed);
        self
    }
}

/// Options requested when watching a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Ask for the most accurate fix the device can give.
    pub high_accuracy: bool,
    /// Oldest cached fix the source may hand out. Zero means no caching.
    pub maximum_age: Duration,
    /// Fixes buffered for a slow consumer before new ones are dropped.
    pub buffer_size: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age: Duration::ZERO,
            buffer_size: 64,
        }
    }
}

/// Stream of fixes and per-fix failures from a watched source.
///
/// A failed fix does not end the feed; the feed ends when the source shuts
/// down.
pub type PositionFeed = mpsc::Receiver<Result<GeoPosition, PositionError>>;

/// A device's continuous positioning capability.
#[async_trait]
pub trait PositionSource: Send + Sync + 'static {
    /// Start a continuous watch.
    ///
    /// Returns [`PositionError::Unsupported`] when the device cannot provide
    /// continuous positioning. Retrying individual fixes is the source's
    /// business, not the caller's.
    async fn watch(&self, options: WatchOptions) -> Result<PositionFeed, PositionError>;
}

/// In-process position source fed by the embedding application.
///
/// Every call to [`watch`](PositionSource::watch) creates an independent
/// feed; [`push`](Self::push) delivers to all live feeds.
#[derive(Debug)]
pub struct ChannelSource {
    watchers: Mutex<Vec<mpsc::Sender<Result<GeoPosition, PositionError>>>>,
    watch_count: AtomicUsize,
    supported: bool,
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(Vec::new()),
            watch_count: AtomicUsize::new(0),
            supported: true,
        }
    }

    /// A source standing in for a device without positioning.
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// Deliver a fix (or a failed fix) to every live feed. Returns the number
    /// of feeds that accepted it.
    pub fn push(&self, update: Result<GeoPosition, PositionError>) -> usize {
        let mut watchers = match self.watchers.lock() {
            Ok(watchers) => watchers,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut delivered = 0;
        watchers.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!("Position feed full, dropping fix");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Number of watches ever started on this source.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for ChannelSource {
    async fn watch(&self, options: WatchOptions) -> Result<PositionFeed, PositionError> {
        if !self.supported {
            return Err(PositionError::Unsupported(
                "no positioning hardware".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        match self.watchers.lock() {
            Ok(mut watchers) => watchers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> GeoPosition {
        GeoPosition::new(42.7302, -73.6788, Utc::now())
            .with_heading(90.0)
            .with_speed(4.5)
    }

    #[tokio::test]
    async fn test_push_reaches_every_watch() {
        let source = ChannelSource::new();
        let mut first = source.watch(WatchOptions::default()).await.unwrap();
        let mut second = source.watch(WatchOptions::default()).await.unwrap();

        let position = fix();
        assert_eq!(source.push(Ok(position)), 2);

        assert_eq!(first.recv().await, Some(Ok(position)));
        assert_eq!(second.recv().await, Some(Ok(position)));
        assert_eq!(source.watch_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_feeds_are_forgotten() {
        let source = ChannelSource::new();
        let feed = source.watch(WatchOptions::default()).await.unwrap();
        drop(feed);

        assert_eq!(source.push(Ok(fix())), 0);
    }

    #[tokio::test]
    async fn test_failed_fix_does_not_end_feed() {
        let source = ChannelSource::new();
        let mut feed = source.watch(WatchOptions::default()).await.unwrap();

        source.push(Err(PositionError::PermissionDenied));
        source.push(Ok(fix()));

        assert_eq!(feed.recv().await, Some(Err(PositionError::PermissionDenied)));
        assert!(matches!(feed.recv().await, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_unsupported_source_refuses_watch() {
        let source = ChannelSource::unsupported();
        let result = source.watch(WatchOptions::default()).await;

        assert!(matches!(result, Err(PositionError::Unsupported(_))));
        assert_eq!(source.watch_count(), 0);
    }

    #[test]
    fn test_default_watch_options() {
        let options = WatchOptions::default();
        assert!(options.high_accuracy);
        assert_eq!(options.maximum_age, Duration::ZERO);
    }
}
