// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

// =============================================================================
// ExponentialBackoff
// =============================================================================

/// Exponential backoff capped at `max_delay`, with symmetric jitter.
///
/// Jitter never pushes a delay above the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Creates a backoff doubling from `initial_delay` up to `max_delay`, without jitter.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the jitter as a fraction of the delay.
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Backoff cap.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        let capped = if base.is_finite() { base.min(max) } else { max };

        let delay = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-range..=range);
            (capped + jitter).clamp(0.0, max)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Starts a stateful attempt counter.
    pub fn sequence(&self) -> BackoffSequence {
        BackoffSequence {
            backoff: self.clone(),
            attempt: 0,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30)).with_jitter(0.2)
    }
}

// =============================================================================
// BackoffSequence
// =============================================================================

/// Attempt counter over an [`ExponentialBackoff`].
#[derive(Debug, Clone)]
pub struct BackoffSequence {
    backoff: ExponentialBackoff,
    attempt: u32,
}

impl BackoffSequence {
    /// Returns the next delay and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
