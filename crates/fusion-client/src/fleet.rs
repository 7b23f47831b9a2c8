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

//! Inbound vehicle feed.
//!
//! The server pushes one JSON frame per vehicle location:
//!
//! ```json
//! {"vehicle_id": 3, "name": "Shuttle 3", "latitude": 42.73, "longitude": -73.68,
//!  "heading": 90.0, "speed": 12.5, "time": "2024-03-01T14:03:27Z", "route_id": 2}
//! ```
//!
//! [`Fleet`] decodes those frames and keeps one [`Vehicle`] per id, creating
//! vehicles the first time they report.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::UpdateError;
use crate::socket::{ReconnectingSocket, SocketEvent};
use crate::vehicle::{Location, MapSurface, Route, Vehicle, VehicleInfo};

/// One inbound vehicle location frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleUpdate {
    pub vehicle_id: i64,
    /// Display name, used when the vehicle is first seen.
    #[serde(default)]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    /// Miles per hour.
    pub speed: f64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub route_id: Option<i64>,
}

impl VehicleUpdate {
    /// Decode and validate one frame.
    pub fn parse(frame: &str) -> Result<Self, UpdateError> {
        let update: Self = serde_json::from_str(frame)?;
        update.validate()?;
        Ok(update)
    }

    fn validate(&self) -> Result<(), UpdateError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(UpdateError::InvalidValue {
                field: "latitude",
                value: self.latitude.to_string(),
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(UpdateError::InvalidValue {
                field: "longitude",
                value: self.longitude.to_string(),
            });
        }
        if !self.heading.is_finite() {
            return Err(UpdateError::InvalidValue {
                field: "heading",
                value: self.heading.to_string(),
            });
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(UpdateError::InvalidValue {
                field: "speed",
                value: self.speed.to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude, self.heading, self.speed, self.time)
    }
}

/// Events emitted as the fleet changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A vehicle reported for the first time.
    VehicleAdded(i64),
    /// A vehicle reported a new location.
    LocationUpdated(i64),
    /// A vehicle's route assignment changed.
    RouteChanged {
        vehicle_id: i64,
        route_id: Option<i64>,
    },
}

/// Configuration for a [`Fleet`].
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Broadcast channel capacity for events.
    pub event_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self { event_capacity: 256 }
    }
}

/// All vehicles known to this client, drawn on one map surface.
pub struct Fleet {
    vehicles: RwLock<HashMap<i64, Vehicle>>,
    routes: RwLock<HashMap<i64, Route>>,
    map: Arc<dyn MapSurface>,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<FleetEvent>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("vehicle_count", &self.len())
            .field("route_count", &read(&self.routes).len())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    #[must_use]
    pub fn new(map: Arc<dyn MapSurface>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(FleetConfig::default(), map, clock)
    }

    #[must_use]
    pub fn with_config(config: FleetConfig, map: Arc<dyn MapSurface>, clock: Arc<dyn Clock>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            vehicles: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            map,
            clock,
            event_tx,
        }
    }

    /// Subscribe to fleet events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.event_tx.subscribe()
    }

    /// Add or replace a route. Vehicles already on the route keep the old
    /// copy until their next update.
    pub fn add_route(&self, route: Route) {
        write(&self.routes).insert(route.id, route);
    }

    #[must_use]
    pub fn route(&self, id: i64) -> Option<Route> {
        read(&self.routes).get(&id).cloned()
    }

    #[must_use]
    pub fn vehicle(&self, id: i64) -> Option<Vehicle> {
        read(&self.vehicles).get(&id).cloned()
    }

    /// All vehicles, ordered by id.
    #[must_use]
    pub fn vehicles(&self) -> Vec<Vehicle> {
        let vehicles = read(&self.vehicles);
        let mut ids: Vec<_> = vehicles.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| vehicles.get(&id).cloned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.vehicles).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of vehicles currently drawn.
    #[must_use]
    pub fn visible_count(&self) -> usize {
        read(&self.vehicles)
            .values()
            .filter(|vehicle| vehicle.is_visible())
            .count()
    }

    /// Decode one frame and apply it.
    pub fn apply_frame(&self, frame: &str) -> Result<Vehicle, UpdateError> {
        let update = VehicleUpdate::parse(frame)?;
        Ok(self.apply(&update))
    }

    /// Apply one update, creating the vehicle if it is new.
    pub fn apply(&self, update: &VehicleUpdate) -> Vehicle {
        let (vehicle, is_new) = self.vehicle_for(update);

        if is_new {
            info!("Tracking new vehicle {} ({})", update.vehicle_id, vehicle.name());
            vehicle.attach_to_map(Arc::clone(&self.map));
            let _ = self.event_tx.send(FleetEvent::VehicleAdded(update.vehicle_id));
        }

        let route = self.resolve_route(update);
        let current = vehicle.route().map(|route| route.id);
        let wanted = route.as_ref().map(|route| route.id);
        if current != wanted {
            vehicle.set_route(route);
            let _ = self.event_tx.send(FleetEvent::RouteChanged {
                vehicle_id: update.vehicle_id,
                route_id: wanted,
            });
        }

        vehicle.set_location(update.location());
        let _ = self
            .event_tx
            .send(FleetEvent::LocationUpdated(update.vehicle_id));

        vehicle
    }

    fn vehicle_for(&self, update: &VehicleUpdate) -> (Vehicle, bool) {
        let mut vehicles = write(&self.vehicles);
        if let Some(vehicle) = vehicles.get(&update.vehicle_id) {
            return (vehicle.clone(), false);
        }

        let name = update
            .name
            .clone()
            .unwrap_or_else(|| format!("Vehicle {}", update.vehicle_id));
        let info = VehicleInfo::new(update.vehicle_id, name, update.vehicle_id, self.clock.now());
        let vehicle = Vehicle::new(info, Arc::clone(&self.clock));
        vehicles.insert(update.vehicle_id, vehicle.clone());
        (vehicle, true)
    }

    fn resolve_route(&self, update: &VehicleUpdate) -> Option<Route> {
        let route_id = update.route_id?;
        let route = self.route(route_id);
        if route.is_none() {
            warn!(
                "Vehicle {} reported unknown route {}, leaving it unassigned",
                update.vehicle_id, route_id
            );
        }
        route
    }

    /// Apply inbound frames from `socket` until `cancel_token` fires or the
    /// socket goes away.
    ///
    /// Subscribes before returning, so frames that arrive after this call
    /// are not missed. Must be called from within a tokio runtime.
    pub fn run(
        self: Arc<Self>,
        socket: &ReconnectingSocket,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let events = socket.subscribe();
        tokio::spawn(async move { self.consume(events, cancel_token).await })
    }

    async fn consume(&self, mut events: broadcast::Receiver<SocketEvent>, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(SocketEvent::Message(frame)) => {
                            if let Err(e) = self.apply_frame(&frame) {
                                warn!("Ignoring vehicle update: {}", e);
                            }
                        }
                        Ok(SocketEvent::StateChanged(state)) => {
                            debug!("Vehicle feed is {:?}", state);
                        }
                        Ok(SocketEvent::Error(e)) => {
                            debug!("Vehicle feed error: {}", e);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Fleet fell behind, skipped {} socket events", skipped);
                        }
                        Err(RecvError::Closed) => {
                            info!("Vehicle feed closed");
                            return;
                        }
                    }
                }

                () = cancel_token.cancelled() => {
                    info!("Fleet stopped");
                    return;
                }
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
