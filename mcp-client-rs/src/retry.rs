//! Retry with exponential backoff for transient tool failures
//!
//! Each call owns a [`RetryState`] holding its attempt count and next
//! backoff, so the client loop is an explicit state machine rather than a
//! nested sequence of waits.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 means no retries)
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Cap for any single delay
    pub max_interval: Duration,

    /// Multiplier for backoff between retries
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fresh per-call state
    pub fn state(&self) -> RetryState {
        let backoff = ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        RetryState {
            retries: 0,
            max_retries: self.max_retries,
            backoff,
            last_delay: None,
            auth_refreshed: false,
        }
    }
}

/// Retry bookkeeping for one logical call
#[derive(Debug)]
pub struct RetryState {
    retries: u32,
    max_retries: u32,
    backoff: ExponentialBackoff,
    last_delay: Option<Duration>,
    auth_refreshed: bool,
}

impl RetryState {
    /// Retries performed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts including the first one
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Consume one retry and return the delay to wait before it, or `None`
    /// when retries are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let delay = self.backoff.next_backoff()?;
        self.retries += 1;
        self.last_delay = Some(delay);
        Some(delay)
    }

    /// Whether the single re-authentication retry is still available; marks
    /// it used
    pub fn take_auth_retry(&mut self) -> bool {
        !std::mem::replace(&mut self.auth_refreshed, true)
    }
}
