//! Reconnect delay policy.

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Exponential reconnect delay: `min`, doubled per failure, capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            min: config.min_delay(),
            max: config.max_delay(),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
