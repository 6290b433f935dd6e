//! Exponential backoff between connection attempts

use std::time::Duration;
use tracing::debug;

/// Backoff state
///
/// Each call to [`Backoff::duration`] returns `min * factor^attempt`,
/// capped at `max`, and advances the attempt counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            factor: 2,
            attempt: 0,
        }
    }

    /// Delay before the next attempt
    pub fn duration(&mut self) -> Duration {
        let delay = self
            .factor
            .checked_pow(self.attempt)
            .and_then(|multiplier| self.min.checked_mul(multiplier))
            .map_or(self.max, |d| d.min(self.max));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5 * 60))
    }
}
