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

//! Session identifiers for published position streams.

use std::fmt;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier tagging every sample from one publisher, so the server can
/// group a device's samples into one track.
///
/// Formatted as a lowercase RFC 4122 version 4 UUID. Collisions are not
/// checked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new identifier from the current time and the thread RNG.
    #[must_use]
    pub fn generate() -> Self {
        // Milliseconds with a microsecond fraction.
        #[allow(clippy::cast_precision_loss, reason = "sub-millisecond precision is not required")]
        let now_ms = Utc::now().timestamp_micros() as f64 / 1000.0;
        Self::from_time_and_rng(now_ms, &mut rand::rng())
    }

    /// Generate an identifier from a millisecond timestamp and a random
    /// source.
    ///
    /// Each hex digit is the running timestamp perturbed by a random value in
    /// `0..16`; the timestamp is shifted down one digit per character, so the
    /// leading digits mix time and randomness and the rest are random. The
    /// version digit is fixed at `4` and the variant digit is forced into
    /// `8..=b`.
    #[must_use]
    pub fn from_time_and_rng<R: Rng>(timestamp_ms: f64, rng: &mut R) -> Self {
        let mut seed = timestamp_ms.abs();
        let mut bytes = [0u8; 16];

        for (index, byte) in bytes.iter_mut().enumerate() {
            let high = next_digit(index * 2, &mut seed, rng);
            let low = next_digit(index * 2 + 1, &mut seed, rng);
            *byte = (high << 4) | low;
        }

        Self(Uuid::from_bytes(bytes))
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Hex digit at `position` (0..32) of the UUID.
fn next_digit<R: Rng>(position: usize, seed: &mut f64, rng: &mut R) -> u8 {
    const VERSION_POSITION: usize = 12;
    const VARIANT_POSITION: usize = 16;

    if position == VERSION_POSITION {
        return 4;
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is in 0..16"
    )]
    let digit = ((*seed + rng.random::<f64>() * 16.0) % 16.0).floor() as u8;
    *seed = (*seed / 16.0).floor();

    if position == VARIANT_POSITION {
        (digit & 0x3) | 0x8
    } else {
        digit & 0xf
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::{Variant, Version};

    use super::*;

    fn is_v4_shaped(id: &str) -> bool {
        let bytes = id.as_bytes();
        if bytes.len() != 36 {
            return false;
        }
        id.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            14 => c == '4',
            19 => matches!(c, '8' | '9' | 'a' | 'b'),
            _ => c.is_ascii_digit() || ('a'..='f').contains(&c),
        })
    }

    #[test]
    fn test_generated_ids_have_v4_shape() {
        for _ in 0..200 {
            let id = SessionId::generate();
            let text = id.to_string();
            assert!(is_v4_shaped(&text), "{text}");
            assert_eq!(id.as_uuid().get_version(), Some(Version::Random));
            assert_eq!(id.as_uuid().get_variant(), Variant::RFC4122);
        }
    }

    #[test]
    fn test_two_ids_differ() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
    }

    #[test]
    fn test_same_time_different_randomness_differs() {
        let now_ms = 1_700_000_000_000.0;
        let first = SessionId::from_time_and_rng(now_ms, &mut StdRng::seed_from_u64(1));
        let second = SessionId::from_time_and_rng(now_ms, &mut StdRng::seed_from_u64(2));
        assert_ne!(first, second);
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let now_ms = 1_700_000_000_123.456;
        let first = SessionId::from_time_and_rng(now_ms, &mut StdRng::seed_from_u64(7));
        let second = SessionId::from_time_and_rng(now_ms, &mut StdRng::seed_from_u64(7));
        assert_eq!(first, second);
        assert!(is_v4_shaped(&first.to_string()));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = SessionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
