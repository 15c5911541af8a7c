//! Named retry policies for driver operations that are allowed to fail transiently.
//!
//! Three operations retry:
//!
//! - **firmware upload on open**: bounded, 3 attempts with a 10 ms wait
//! - **close**: bounded, 3 attempts with a 10 ms wait
//! - **event signal/reset during shutdown**: unbounded, 10 ms backoff. A
//!   terminate signal that never lands would leave threads running, so
//!   shutdown keeps trying.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use camera_capture::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::bounded(5, Duration::from_millis(200));
/// assert_eq!(policy.max_attempts, Some(5));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `None` retries until success.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Constant delay between attempts.
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff_delay: Duration,
}

fn default_backoff() -> Duration {
    Duration::from_millis(10)
}

impl Default for RetryPolicy {
    /// 3 attempts, 10 ms apart.
    fn default() -> Self {
        Self::bounded(3, default_backoff())
    }
}

impl RetryPolicy {
    /// Policy giving up after `max_attempts` tries.
    pub fn bounded(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff_delay,
        }
    }

    /// Policy that never gives up.
    pub fn unbounded(backoff_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff_delay,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// Returns the last error when every attempt failed. `what` is only used
    /// for the warning emitted before each backoff.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if self.allows(attempt) => {
                    warn!(
                        operation = what,
                        attempt,
                        max_attempts = ?self.max_attempts,
                        error = %err,
                        "Operation failed, retrying"
                    );
                    std::thread::sleep(self.backoff_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The retry policies used by a device session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicies {
    /// Opening a device that needs a starter firmware upload.
    #[serde(default)]
    pub firmware_upload: RetryPolicy,
    /// Closing the hardware handle.
    #[serde(default)]
    pub close: RetryPolicy,
    /// Signalling and resetting terminate events.
    #[serde(default = "default_signal_policy")]
    pub signal: RetryPolicy,
}

fn default_signal_policy() -> RetryPolicy {
    RetryPolicy::unbounded(default_backoff())
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            firmware_upload: RetryPolicy::default(),
            close: RetryPolicy::default(),
            signal: default_signal_policy(),
        }
    }
}
