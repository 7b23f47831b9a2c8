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

//! Client library for live shuttle tracking.
//!
//! The library covers both directions of a tracking deployment:
//!
//! - **Transport layer**: [`ReconnectingSocket`], a WebSocket that keeps one
//!   live connection and reconnects on every closure under a [`RetryPolicy`]
//! - **Publishing layer**: [`LocationPublisher`] streams this device's
//!   position, tagged with a [`SessionId`], to the server
//! - **Local fan-out**: [`LocationBroadcastService`] shares one device
//!   position subscription with any number of listeners
//! - **Tracking layer**: [`Vehicle`] keeps each vehicle's marker and hides it
//!   once its data goes stale; [`Fleet`] feeds vehicles from inbound frames
//!
//! # Publishing
//!
//! ```no_run
//! use std::sync::Arc;
//! use fusion_client::{endpoint, GpsdSource, LocationPublisher, ReconnectingSocket, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let url = endpoint::socket_url("https://shuttles.example.edu/", endpoint::PUBLISH_SUFFIX)?;
//!     let socket = ReconnectingSocket::new(SocketConfig {
//!         url,
//!         ..Default::default()
//!     });
//!
//!     let publisher = LocationPublisher::new(socket, Arc::new(GpsdSource::default()));
//!     publisher.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     publisher.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Tracking
//!
//! ```no_run
//! use std::sync::Arc;
//! use fusion_client::{Fleet, MapSurface, MarkerState, MonotonicClock, ReconnectingSocket, SocketConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! struct PrintMap;
//!
//! impl MapSurface for PrintMap {
//!     fn attach(&self, id: i64, marker: &MarkerState) {
//!         println!("show {id} at {}, {}", marker.latitude, marker.longitude);
//!     }
//!     fn update(&self, id: i64, marker: &MarkerState) {
//!         println!("move {id} to {}, {}", marker.latitude, marker.longitude);
//!     }
//!     fn detach(&self, id: i64) {
//!         println!("hide {id}");
//!     }
//! }
//!
//! # async fn example() {
//! let socket = ReconnectingSocket::new(SocketConfig {
//!     url: "ws://localhost:8080/updates".to_string(),
//!     ..Default::default()
//! });
//! let fleet = Arc::new(Fleet::new(Arc::new(PrintMap), Arc::new(MonotonicClock::new())));
//!
//! let cancel = CancellationToken::new();
//! let task = Arc::clone(&fleet).run(&socket, cancel.clone());
//! socket.open();
//! # }
//! ```

pub mod broadcast;
pub mod clock;
pub mod compass;
pub mod endpoint;
pub mod error;
pub mod fleet;
pub mod position;
pub mod publisher;
pub mod session;
pub mod socket;
pub mod vehicle;

pub use broadcast::{ListenerId, LocationBroadcastService};
pub use clock::{Clock, MonotonicClock};
pub use compass::Cardinal;
pub use error::{EndpointError, PositionError, SendError, SocketError, UpdateError};
pub use fleet::{Fleet, FleetConfig, FleetEvent, VehicleUpdate};
pub use position::{
    ChannelSource, Coordinates, GeoPosition, GpsdSource, PositionFeed, PositionSource, WatchOptions,
    DEFAULT_GPSD_ADDRESS,
};
pub use publisher::{LocationPublisher, PositionSample, PublisherStats};
pub use session::SessionId;
pub use socket::{
    Connector, Link, ReconnectingSocket, RetryConfig, RetryMode, RetryPolicy, SocketConfig,
    SocketEvent, SocketState, WebSocketConnector,
};
pub use vehicle::{
    ExpiryTimer, Location, MapSurface, MarkerIcon, MarkerState, Route, Vehicle, VehicleInfo,
    INACTIVE_AFTER,
};
