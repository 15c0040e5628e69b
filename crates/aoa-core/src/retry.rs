//! Bounded retry helper.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// How many times to try, how long each try may wait, and the pause between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound on attempts. Must be at least 1.
    pub max_attempts: u32,
    /// Time each attempt may spend waiting inside itself.
    pub attempt_timeout_ms: u64,
    /// Pause between two failed attempts.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    /// Reconnect poll: 15 tries, 1 ms between identity attempts, 1 s apart.
    fn default() -> Self {
        Self {
            max_attempts: 15,
            attempt_timeout_ms: 1,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Context handed to each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub timeout: Duration,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("gave up after {attempts} attempts")]
pub struct RetryExhausted {
    pub attempts: u32,
}

/// Run `op` until it yields a value or the policy runs out.
///
/// No backoff sleep follows the final attempt.
pub fn retry<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryExhausted>
where
    F: FnMut(Attempt) -> Option<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    for number in 1..=max_attempts {
        let attempt = Attempt {
            number,
            timeout: policy.attempt_timeout(),
        };
        if let Some(value) = op(attempt) {
            return Ok(value);
        }
        trace!(attempt = number, max_attempts, "Attempt failed");
        if number < max_attempts {
            thread::sleep(policy.backoff());
        }
    }
    Err(RetryExhausted {
        attempts: max_attempts,
    })
}
