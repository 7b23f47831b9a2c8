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

//! Position source backed by a gpsd daemon.
//!
//! Connects to gpsd over TCP, enables JSON watch mode and turns `TPV`
//! reports into fixes. Reports without a 2D/3D fix become
//! [`PositionError::Unavailable`]. The daemon connection is re-established on
//! its own fixed cadence for as long as somebody holds the feed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::{Coordinates, GeoPosition, PositionFeed, PositionSource, WatchOptions};
use crate::error::PositionError;

/// Default gpsd address.
pub const DEFAULT_GPSD_ADDRESS: &str = "localhost:2947";

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// gpsd fix modes: 0/1 mean no fix, 2 is 2D, 3 is 3D.
const MIN_FIX_MODE: u8 = 2;

/// Watches a gpsd daemon.
#[derive(Debug, Clone)]
pub struct GpsdSource {
    address: String,
    reconnect_delay: Duration,
}

impl GpsdSource {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Delay between attempts to reach gpsd after the connection drops.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

impl Default for GpsdSource {
    fn default() -> Self {
        Self::new(DEFAULT_GPSD_ADDRESS)
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    async fn watch(&self, options: WatchOptions) -> Result<PositionFeed, PositionError> {
        // gpsd reports live fixes only, which already satisfies a zero
        // maximum age and high accuracy.
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            PositionError::Unsupported(format!("gpsd at {} unreachable: {}", self.address, e))
        })?;
        info!("Connected to gpsd at {}", self.address);

        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        tokio::spawn(watch_loop(
            stream,
            self.address.clone(),
            self.reconnect_delay,
            tx,
        ));
        Ok(rx)
    }
}

enum WatchEnd {
    ConnectionClosed,
    FeedDropped,
}

async fn watch_loop(
    first: TcpStream,
    address: String,
    reconnect_delay: Duration,
    tx: mpsc::Sender<Result<GeoPosition, PositionError>>,
) {
    let mut next = Some(first);

    loop {
        let stream = match next.take() {
            Some(stream) => stream,
            None => match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!("Reconnected to gpsd at {}", address);
                    stream
                }
                Err(e) => {
                    debug!("gpsd at {} still unreachable: {}", address, e);
                    tokio::select! {
                        () = sleep(reconnect_delay) => continue,
                        () = tx.closed() => return,
                    }
                }
            },
        };

        match read_reports(stream, &tx).await {
            Ok(WatchEnd::FeedDropped) => {
                debug!("Position feed dropped, leaving gpsd");
                return;
            }
            Ok(WatchEnd::ConnectionClosed) => info!("gpsd closed the connection"),
            Err(e) => warn!("gpsd connection error: {}", e),
        }

        let lost = Err(PositionError::Unavailable("gpsd connection lost".to_string()));
        if tx.send(lost).await.is_err() {
            return;
        }

        warn!("Reconnecting to gpsd in {} seconds...", reconnect_delay.as_secs());
        tokio::select! {
            () = sleep(reconnect_delay) => {}
            () = tx.closed() => return,
        }
    }
}

async fn read_reports(
    mut stream: TcpStream,
    tx: &mpsc::Sender<Result<GeoPosition, PositionError>>,
) -> std::io::Result<WatchEnd> {
    stream.write_all(WATCH_COMMAND).await?;

    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if let Some(update) = parse_report(&line) {
                            if tx.send(update).await.is_err() {
                                return Ok(WatchEnd::FeedDropped);
                            }
                        }
                    }
                    None => return Ok(WatchEnd::ConnectionClosed),
                }
            }

            () = tx.closed() => return Ok(WatchEnd::FeedDropped),
        }
    }
}

/// The subset of a gpsd report we care about.
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: Option<u8>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    track: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

/// Parse one gpsd JSON line. Returns `None` for anything that is not a
/// `TPV` report.
fn parse_report(line: &str) -> Option<Result<GeoPosition, PositionError>> {
    let report: Report = match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            debug!("Ignoring unparseable gpsd line: {}", e);
            return None;
        }
    };

    if report.class != "TPV" {
        return None;
    }

    let fix = report.mode.unwrap_or(0) >= MIN_FIX_MODE;
    let (Some(latitude), Some(longitude), true) = (report.lat, report.lon, fix) else {
        return Some(Err(PositionError::Unavailable("no fix".to_string())));
    };

    Some(Ok(GeoPosition {
        coords: Coordinates {
            latitude,
            longitude,
            heading: report.track,
            speed: report.speed,
        },
        timestamp: report.time.unwrap_or_else(Utc::now),
    }))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_parse_tpv_with_fix() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2024-01-01T12:00:00.000Z","lat":42.7302,"lon":-73.6788,"track":181.5,"speed":4.2}"#;
        let position = parse_report(line).unwrap().unwrap();

        assert!((position.coords.latitude - 42.7302).abs() < 1e-9);
        assert!((position.coords.longitude - (-73.6788)).abs() < 1e-9);
        assert_eq!(position.coords.heading, Some(181.5));
        assert_eq!(position.coords.speed, Some(4.2));
        assert_eq!(position.timestamp.to_rfc3339(), "2024-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_tpv_without_fix() {
        let line = r#"{"class":"TPV","mode":1}"#;
        assert!(matches!(
            parse_report(line),
            Some(Err(PositionError::Unavailable(_)))
        ));
    }

    #[test]
    fn test_parse_tpv_missing_heading_and_speed() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.5,"lon":2.5}"#;
        let position = parse_report(line).unwrap().unwrap();
        assert_eq!(position.coords.heading, None);
        assert_eq!(position.coords.speed, None);
    }

    #[test]
    fn test_parse_ignores_other_classes() {
        assert!(parse_report(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_report(r#"{"class":"SKY","satellites":[]}"#).is_none());
        assert!(parse_report("not json").is_none());
    }

    #[tokio::test]
    async fn test_watch_reads_from_daemon() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            assert!(command.starts_with("?WATCH="));

            write
                .write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n")
                .await
                .unwrap();
            write
                .write_all(b"{\"class\":\"TPV\",\"mode\":3,\"lat\":10.0,\"lon\":20.0,\"track\":45.0,\"speed\":1.0}\n")
                .await
                .unwrap();
            // Keep the connection open until the client goes away.
            let _ = lines.next_line().await;
        });

        let source = GpsdSource::new(address);
        let mut feed = source.watch(WatchOptions::default()).await.unwrap();
        let position = feed.recv().await.unwrap().unwrap();

        assert_eq!(position.coords.latitude, 10.0);
        assert_eq!(position.coords.longitude, 20.0);
        assert_eq!(position.coords.heading, Some(45.0));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_unsupported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let source = GpsdSource::new(address);
        let result = source.watch(WatchOptions::default()).await;

        assert!(matches!(result, Err(PositionError::Unsupported(_))));
    }
}
