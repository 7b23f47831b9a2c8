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

//! Reconnect policies for [`super::ReconnectingSocket`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(250);
/// Default cap for exponential backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default jitter factor (0.0 - 1.0).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Decides how long to wait before the next connection attempt, and when to
/// stop trying.
///
/// `attempt` is zero-based and counts consecutive failures since the last
/// successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Reconnect at once, forever.
    Immediate,
    /// Wait a fixed delay between attempts.
    Fixed {
        delay: Duration,
        max_attempts: Option<u32>,
    },
    /// `min(max, base * 2^attempt)` scaled by up to `±jitter`.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: f64,
        max_attempts: Option<u32>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER_FACTOR,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt + 1`, or `None` to give up.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.next_delay_with(attempt, &mut rand::rng())
    }

    /// Same as [`Self::next_delay`] with an explicit random source.
    #[must_use]
    pub fn next_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        match self {
            Self::Immediate => Some(Duration::ZERO),
            Self::Fixed {
                delay,
                max_attempts,
            } => within(attempt, *max_attempts).then_some(*delay),
            Self::Exponential {
                base,
                max,
                jitter,
                max_attempts,
            } => {
                if !within(attempt, *max_attempts) {
                    return None;
                }
                let capped = base.saturating_mul(1u32 << attempt.min(31)).min(*max);
                // NaN would make the sample range invalid.
                let jitter = if jitter.is_finite() {
                    jitter.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                if jitter == 0.0 {
                    return Some(capped);
                }
                let scale = 1.0 + rng.random_range(-jitter..=jitter);
                Some(Duration::try_from_secs_f64(capped.as_secs_f64() * scale).unwrap_or(capped))
            }
        }
    }
}

fn within(attempt: u32, max_attempts: Option<u32>) -> bool {
    max_attempts.is_none_or(|max| attempt < max)
}

/// Serializable form of [`RetryPolicy`] for configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub mode: RetryMode,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// Which [`RetryPolicy`] variant a [`RetryConfig`] builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    Immediate,
    Fixed,
    #[default]
    Exponential,
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            max_attempts: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        match config.mode {
            RetryMode::Immediate => Self::Immediate,
            RetryMode::Fixed => Self::Fixed {
                delay: Duration::from_millis(config.base_delay_ms),
                max_attempts: config.max_attempts,
            },
            RetryMode::Exponential => Self::Exponential {
                base: Duration::from_millis(config.base_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
                jitter: config.jitter_factor,
                max_attempts: config.max_attempts,
            },
        }
    }
}
