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

//! Tracked vehicles and their map visibility.
//!
//! A [`Vehicle`] is shown on its map surface only while its last location is
//! younger than [`INACTIVE_AFTER`]. Every location update re-arms a single
//! expiry timer, so a vehicle that stops reporting hides itself without any
//! polling.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::clock::Clock;
use crate::compass::Cardinal;

/// A vehicle is hidden once its most recent location is this old.
pub const INACTIVE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Marker colour for vehicles without a route.
pub const NEUTRAL_COLOR: &str = "#FFF";

/// Marker artwork points north-east; this turns it to north.
const ICON_BEARING_OFFSET: f64 = 45.0;

const ICON_SIZE: (u32, u32) = (32, 32);
const ICON_ANCHOR: (u32, u32) = (16, 16);

/// One reported vehicle location. Replaced wholesale on every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Degrees clockwise from north.
    pub heading: f64,
    /// Miles per hour.
    pub speed: f64,
    /// When the vehicle was at this location.
    pub time: DateTime<Utc>,
}

impl Location {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, heading: f64, speed: f64, time: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            heading,
            speed,
            time,
        }
    }
}

/// A route vehicles can be assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub name: String,
    /// CSS colour used for the marker, e.g. `#3a7bd5`.
    pub color: String,
}

/// Static vehicle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub id: i64,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub enabled: bool,
    pub tracker_id: i64,
}

impl VehicleInfo {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>, tracker_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            created: now,
            updated: now,
            enabled: true,
            tracker_id,
        }
    }
}

/// Marker image for one colour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerIcon {
    pub color: String,
    /// SVG document, drawn pointing north-east.
    pub svg: String,
    /// Width and height in pixels.
    pub size: (u32, u32),
    /// Pixel of the icon placed on the marker position.
    pub anchor: (u32, u32),
}

impl MarkerIcon {
    #[must_use]
    pub fn for_color(color: &str) -> Self {
        let fill = escape_attribute(color);
        let svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 32 32\">\
             <path d=\"M28 4 L4 14 L14 18 L18 28 Z\" fill=\"{fill}\" stroke=\"#000\" stroke-width=\"1.5\" stroke-linejoin=\"round\"/>\
             </svg>",
            w = ICON_SIZE.0,
            h = ICON_SIZE.1,
        );
        Self {
            color: color.to_string(),
            svg,
            size: ICON_SIZE,
            anchor: ICON_ANCHOR,
        }
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Everything a map needs to draw a vehicle.
///
/// Always derived from the vehicle's name, route and location; never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerState {
    pub latitude: f64,
    pub longitude: f64,
    /// Icon rotation in degrees.
    pub rotation: f64,
    pub icon: MarkerIcon,
    /// Popup text, see [`Vehicle::message`].
    pub popup: String,
}

impl MarkerState {
    fn derive(name: &str, route: Option<&Route>, location: Option<&Location>) -> Self {
        let color = route.map_or(NEUTRAL_COLOR, |route| route.color.as_str());
        let (latitude, longitude, rotation) = location.map_or((0.0, 0.0, 0.0), |location| {
            (
                location.latitude,
                location.longitude,
                location.heading - ICON_BEARING_OFFSET,
            )
        });

        Self {
            latitude,
            longitude,
            rotation,
            icon: MarkerIcon::for_color(color),
            popup: status_message(name, route, location),
        }
    }
}

fn status_message(name: &str, route: Option<&Route>, location: Option<&Location>) -> String {
    let Some(location) = location else {
        return String::new();
    };

    // Adding zero turns a rounded -0.0 into 0.0.
    let speed = (location.speed * 100.0).round() / 100.0 + 0.0;
    let direction = Cardinal::from_bearing(location.heading);
    let route_clause = route
        .map(|route| format!(" on route {}", route.name))
        .unwrap_or_default();
    let as_of = location.time.with_timezone(&Local).format("%H:%M:%S");

    format!("{name}{route_clause}\nTraveling {direction} at {speed} mph\nas of {as_of}")
}

/// Where vehicle markers are drawn.
///
/// Calls are made with the vehicle locked; implementations must not call
/// back into the vehicle.
pub trait MapSurface: Send + Sync {
    /// Start drawing a vehicle.
    fn attach(&self, vehicle_id: i64, marker: &MarkerState);
    /// Redraw a vehicle that is already drawn.
    fn update(&self, vehicle_id: i64, marker: &MarkerState);
    /// Stop drawing a vehicle.
    fn detach(&self, vehicle_id: i64);
}

/// Single-slot cancellable timer.
///
/// At most one expiry is pending. Arming cancels the previous one, and a
/// callback that was already running when it was superseded sees a stale
/// generation and must do nothing.
#[derive(Debug, Default)]
pub struct ExpiryTimer {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl ExpiryTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending expiry and schedule `on_expiry` after `delay`.
    ///
    /// The callback receives the generation this call returns; pass it to
    /// [`fire`](Self::fire) before acting. Needs a tokio runtime; without one
    /// nothing is scheduled.
    pub fn arm<F>(&mut self, delay: Duration, on_expiry: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, expiry in {:?} not scheduled", delay);
            return generation;
        };

        // The deadline is fixed now, not when the task first runs.
        let deadline = Instant::now() + delay;
        self.pending = Some(runtime.spawn(async move {
            sleep_until(deadline).await;
            on_expiry(generation);
        }));
        generation
    }

    /// Cancel the pending expiry, if any.
    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    /// Claim an expiry from a fired callback. Returns `false` if the timer
    /// has been re-armed or cancelled since.
    pub fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.pending = None;
        true
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|pending| !pending.is_finished())
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

struct VehicleState {
    info: VehicleInfo,
    location: Option<Location>,
    route: Option<Route>,
    map: Option<Arc<dyn MapSurface>>,
    shown: bool,
    expiry: ExpiryTimer,
}

impl VehicleState {
    fn marker(&self) -> MarkerState {
        MarkerState::derive(&self.info.name, self.route.as_ref(), self.location.as_ref())
    }

    /// Time left before the current location goes stale, or `None` if there
    /// is no location or it is stale already.
    fn remaining_fresh(&self, now: DateTime<Utc>) -> Option<Duration> {
        let location = self.location.as_ref()?;
        let window = TimeDelta::from_std(INACTIVE_AFTER).unwrap_or(TimeDelta::MAX);
        let age = now.signed_duration_since(location.time);
        let remaining = window.checked_sub(&age)?;
        remaining.to_std().ok().filter(|remaining| !remaining.is_zero())
    }

    fn update_show_on_map(&mut self, now: DateTime<Utc>) {
        let fresh = self.remaining_fresh(now).is_some();
        self.show_on_map(fresh);
    }

    fn show_on_map(&mut self, show: bool) {
        let Some(map) = self.map.clone() else {
            self.shown = false;
            return;
        };

        match (show, self.shown) {
            (true, false) => {
                debug!("Showing vehicle {}", self.info.id);
                map.attach(self.info.id, &self.marker());
                self.shown = true;
            }
            (false, true) => {
                debug!("Hiding vehicle {}", self.info.id);
                map.detach(self.info.id);
                self.shown = false;
            }
            _ => {}
        }
    }

    fn refresh_marker(&self) {
        if !self.shown {
            return;
        }
        if let Some(map) = &self.map {
            map.update(self.info.id, &self.marker());
        }
    }
}

/// A tracked vehicle.
///
/// Cloning gives another handle to the same vehicle.
#[derive(Clone)]
pub struct Vehicle {
    state: Arc<Mutex<VehicleState>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Vehicle")
            .field("id", &state.info.id)
            .field("name", &state.info.name)
            .field("location", &state.location)
            .field("route", &state.route.as_ref().map(|route| route.id))
            .field("visible", &state.shown)
            .finish_non_exhaustive()
    }
}

impl Vehicle {
    #[must_use]
    pub fn new(info: VehicleInfo, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(VehicleState {
                info,
                location: None,
                route: None,
                map: None,
                shown: false,
                expiry: ExpiryTimer::new(),
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VehicleState> {
        lock_state(&self.state)
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        self.lock().info.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.lock().info.name.clone()
    }

    #[must_use]
    pub fn info(&self) -> VehicleInfo {
        self.lock().info.clone()
    }

    #[must_use]
    pub fn location(&self) -> Option<Location> {
        self.lock().location
    }

    /// Time of the most recent location.
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.lock().location.map(|location| location.time)
    }

    #[must_use]
    pub fn route(&self) -> Option<Route> {
        self.lock().route.clone()
    }

    /// Whether the vehicle is currently drawn on its map surface.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.lock().shown
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.lock().map.is_some()
    }

    /// Whether an expiry check is scheduled.
    #[must_use]
    pub fn has_pending_expiry(&self) -> bool {
        self.lock().expiry.is_pending()
    }

    #[must_use]
    pub fn marker(&self) -> MarkerState {
        self.lock().marker()
    }

    /// Status line shown in the marker popup, e.g.
    ///
    /// ```text
    /// Shuttle 3 on route West
    /// Traveling North-East at 12.35 mph
    /// as of 14:03:27
    /// ```
    ///
    /// Empty until a location has been recorded.
    #[must_use]
    pub fn message(&self) -> String {
        let state = self.lock();
        status_message(&state.info.name, state.route.as_ref(), state.location.as_ref())
    }

    /// Record a new location.
    ///
    /// The marker moves immediately, visibility is re-evaluated, and the
    /// expiry timer is replaced by one that fires when this location goes
    /// stale. An already-stale location hides the vehicle right away and
    /// leaves no timer behind.
    pub fn set_location(&self, location: Location) {
        let now = self.clock.now();
        let mut state = self.lock();

        state.location = Some(location);
        state.refresh_marker();
        state.update_show_on_map(now);

        state.expiry.cancel();
        arm_expiry(&mut state, &self.state, &self.clock, now);
    }

    /// Assign the vehicle to a route, or clear the assignment with `None`.
    ///
    /// Changes the marker colour and popup only.
    pub fn set_route(&self, route: Option<Route>) {
        let mut state = self.lock();
        if let Some(route) = &route {
            debug!("Vehicle {} assigned to route {}", state.info.id, route.id);
        }
        state.route = route;
        state.refresh_marker();
    }

    /// Draw the vehicle on `map` while it is fresh. Does nothing if the
    /// vehicle is already attached.
    pub fn attach_to_map(&self, map: Arc<dyn MapSurface>) {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.map.is_some() {
            debug!("Vehicle {} already attached", state.info.id);
            return;
        }
        state.map = Some(map);
        state.update_show_on_map(now);
    }

    /// Remove the vehicle from its map surface. Does nothing if it is not
    /// attached.
    pub fn detach_from_map(&self) {
        let mut state = self.lock();
        let Some(map) = state.map.take() else {
            return;
        };
        if state.shown {
            map.detach(state.info.id);
            state.shown = false;
        }
    }

    /// Re-check freshness now.
    pub fn update_show_on_map(&self) {
        let now = self.clock.now();
        self.lock().update_show_on_map(now);
    }

    /// `{id, tracker_id, name, enabled}`, with the tracker id as a string.
    #[must_use]
    pub fn as_json(&self) -> serde_json::Value {
        let state = self.lock();
        serde_json::json!({
            "id": state.info.id,
            "tracker_id": state.info.tracker_id.to_string(),
            "name": state.info.name,
            "enabled": state.info.enabled,
        })
    }
}

fn lock_state(state: &Mutex<VehicleState>) -> MutexGuard<'_, VehicleState> {
    match state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn arm_expiry(
    state: &mut VehicleState,
    shared: &Arc<Mutex<VehicleState>>,
    clock: &Arc<dyn Clock>,
    now: DateTime<Utc>,
) {
    let Some(remaining) = state.remaining_fresh(now) else {
        return;
    };

    let weak = Arc::downgrade(shared);
    let clock = Arc::clone(clock);
    state
        .expiry
        .arm(remaining, move |generation| on_expiry(&weak, &clock, generation));
}

fn on_expiry(weak: &Weak<Mutex<VehicleState>>, clock: &Arc<dyn Clock>, generation: u64) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let mut state = lock_state(&shared);

    if !state.expiry.fire(generation) {
        debug!("Ignoring superseded expiry for vehicle {}", state.info.id);
        return;
    }

    let now = clock.now();
    state.update_show_on_map(now);
    if state.shown {
        // Location time was ahead of our clock; check again later.
        arm_expiry(&mut state, &shared, clock, now);
    } else {
        info!("Vehicle {} inactive, hidden", state.info.id);
    }
}
