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

//! Headless map surface that reports marker changes to the log.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fusion_client::{MapSurface, MarkerState};
use log::{debug, info};

/// Map surface for terminal use.
///
/// Shown markers are kept so the current picture can be summarised.
#[derive(Debug, Default)]
pub struct LoggingMap {
    markers: Mutex<HashMap<i64, MarkerState>>,
}

impl LoggingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of markers currently on the map
    pub fn shown(&self) -> usize {
        self.markers().len()
    }

    #[cfg(test)]
    fn marker(&self, vehicle_id: i64) -> Option<MarkerState> {
        self.markers().get(&vehicle_id).cloned()
    }

    fn markers(&self) -> MutexGuard<'_, HashMap<i64, MarkerState>> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MapSurface for LoggingMap {
    fn attach(&self, vehicle_id: i64, marker: &MarkerState) {
        info!(
            "Vehicle {vehicle_id} shown at {:.5}, {:.5}: {}",
            marker.latitude,
            marker.longitude,
            marker.popup.replace('\n', " | ")
        );
        self.markers().insert(vehicle_id, marker.clone());
    }

    fn update(&self, vehicle_id: i64, marker: &MarkerState) {
        debug!(
            "Vehicle {vehicle_id} moved to {:.5}, {:.5} ({})",
            marker.latitude, marker.longitude, marker.icon.color
        );
        self.markers().insert(vehicle_id, marker.clone());
    }

    fn detach(&self, vehicle_id: i64) {
        if self.markers().remove(&vehicle_id).is_some() {
            info!("Vehicle {vehicle_id} hidden");
        }
    }
}
