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

//! Time sources for freshness checks.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of "now" for staleness decisions.
///
/// Expiry timers sleep on tokio time, so an implementation must advance in
/// step with [`tokio::time::Instant`] or timers and freshness checks will
/// disagree. To fake time in tests, pause the tokio clock and drive a
/// [`MonotonicClock`] with [`tokio::time::advance`].
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall time that only moves forward.
///
/// The wall clock is sampled once at construction; after that the clock
/// advances with tokio's monotonic [`Instant`]. System clock adjustments
/// therefore never move it backwards, and a paused tokio runtime pauses it
/// too.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock that reads `wall` right now and moves with tokio time from
    /// there.
    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall_anchor: wall,
            instant_anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.instant_anchor.elapsed()).unwrap_or(TimeDelta::MAX);
        self.wall_anchor
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
