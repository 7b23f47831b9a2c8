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

//! Bearing to compass direction.

use std::fmt;

/// Cardinal and intercardinal directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinal {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Cardinal {
    /// All directions, clockwise from north.
    pub const ALL: [Cardinal; 8] = [
        Cardinal::North,
        Cardinal::NorthEast,
        Cardinal::East,
        Cardinal::SouthEast,
        Cardinal::South,
        Cardinal::SouthWest,
        Cardinal::West,
        Cardinal::NorthWest,
    ];

    /// Nearest direction to a bearing in degrees (0 = north, 90 = east).
    ///
    /// Any finite bearing is accepted, including negative ones and ones past
    /// 360. A non-finite bearing reads as north.
    #[must_use]
    pub fn from_bearing(bearing: f64) -> Self {
        if !bearing.is_finite() {
            return Cardinal::North;
        }
        let normalized = bearing.rem_euclid(360.0);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "normalized is in 0..360"
        )]
        let index = ((normalized + 22.5) / 45.0) as usize % 8;
        Self::ALL[index]
    }

    /// Human-readable name, e.g. `North-East`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Cardinal::North => "North",
            Cardinal::NorthEast => "North-East",
            Cardinal::East => "East",
            Cardinal::SouthEast => "South-East",
            Cardinal::South => "South",
            Cardinal::SouthWest => "South-West",
            Cardinal::West => "West",
            Cardinal::NorthWest => "North-West",
        }
    }

    #[must_use]
    pub fn abbreviation(self) -> &'static str {
        match self {
            Cardinal::North => "N",
            Cardinal::NorthEast => "NE",
            Cardinal::East => "E",
            Cardinal::SouthEast => "SE",
            Cardinal::South => "S",
            Cardinal::SouthWest => "SW",
            Cardinal::West => "W",
            Cardinal::NorthWest => "NW",
        }
    }
}

impl fmt::Display for Cardinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_centres() {
        for (i, direction) in Cardinal::ALL.iter().enumerate() {
            #[allow(clippy::cast_precision_loss, reason = "index is below 8")]
            let bearing = i as f64 * 45.0;
            assert_eq!(Cardinal::from_bearing(bearing), *direction, "{bearing}");
        }
    }

    #[test]
    fn test_bucket_edges() {
        assert_eq!(Cardinal::from_bearing(22.4), Cardinal::North);
        assert_eq!(Cardinal::from_bearing(22.5), Cardinal::NorthEast);
        assert_eq!(Cardinal::from_bearing(337.4), Cardinal::NorthWest);
        assert_eq!(Cardinal::from_bearing(337.5), Cardinal::North);
        assert_eq!(Cardinal::from_bearing(359.9), Cardinal::North);
    }

    #[test]
    fn test_bearing_normalization() {
        assert_eq!(Cardinal::from_bearing(-90.0), Cardinal::West);
        assert_eq!(Cardinal::from_bearing(450.0), Cardinal::East);
        assert_eq!(Cardinal::from_bearing(-45.0), Cardinal::NorthWest);
    }

    #[test]
    fn test_non_finite_bearing_reads_as_north() {
        assert_eq!(Cardinal::from_bearing(f64::NAN), Cardinal::North);
        assert_eq!(Cardinal::from_bearing(f64::INFINITY), Cardinal::North);
    }

    #[test]
    fn test_display() {
        assert_eq!(Cardinal::SouthWest.to_string(), "South-West");
        assert_eq!(Cardinal::SouthWest.abbreviation(), "SW");
    }
}
