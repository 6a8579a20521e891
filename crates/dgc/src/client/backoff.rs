//! Retry policy for failed dirty calls
//!
//! The first failure retries immediately. Later failures back off
//! exponentially from the average duration of the first two attempts,
//! never below the configured floor. Retrying continues while any of
//! these holds for the next retry time:
//!
//! - the last granted lease has not yet expired,
//! - fewer than `dirty_failure_retries` attempts have failed,
//! - less than one lease value has passed since the first failure.
//!
//! Otherwise the endpoint stops renewing until a new reference is
//! registered.

use std::time::{Duration, Instant};

use crate::config::DgcConfig;

/// Consecutive-failure state of one endpoint's dirty calls
#[derive(Clone, Debug)]
pub struct DirtyBackoff {
    failures: u32,
    first_failure: Option<Instant>,
    base_delay: Duration,
    floor: Duration,
    min_retries: u32,
    lease_value: Duration,
}

impl DirtyBackoff {
    pub fn new(config: &DgcConfig) -> Self {
        Self {
            failures: 0,
            first_failure: None,
            base_delay: Duration::ZERO,
            floor: config.dirty_retry_floor,
            min_retries: config.dirty_failure_retries,
            lease_value: config.lease_value,
        }
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset after a successful call
    pub fn on_success(&mut self) {
        self.failures = 0;
        self.first_failure = None;
        self.base_delay = Duration::ZERO;
    }

    /// Record a call that ran from `start` to `end` and failed
    ///
    /// Returns the next renewal time, or `None` to stop retrying.
    /// `expiration` is the expiry of the last granted lease, if any.
    pub fn on_failure(
        &mut self,
        start: Instant,
        end: Instant,
        expiration: Option<Instant>,
    ) -> Option<Instant> {
        self.failures += 1;
        let elapsed = end.saturating_duration_since(start);

        if self.failures == 1 {
            self.first_failure = Some(start);
            self.base_delay = elapsed;
            return Some(end);
        }

        let n = self.failures - 2;
        if n == 0 {
            self.base_delay = ((self.base_delay + elapsed) / 2).max(self.floor);
        }

        let next = 2u32
            .checked_pow(n)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .and_then(|delay| end.checked_add(delay))?;

        let before_expiry = expiration.map(|x| next < x).unwrap_or(false);
        let under_minimum = self.failures < self.min_retries;
        let within_budget = self
            .first_failure
            .and_then(|first| first.checked_add(self.lease_value))
            .map(|limit| next < limit)
            .unwrap_or(false);

        if before_expiry || under_minimum || within_budget {
            Some(next)
        } else {
            None
        }
    }
}
