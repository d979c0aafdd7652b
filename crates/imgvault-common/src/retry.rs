//! Retry with capped exponential backoff
//!
//! A [`RetryPolicy`] is a plain value: how many attempts, and how long to
//! wait between them. The same policy drives both the blocking combinator
//! (used by compaction on the blocking pool) and the async one (used by
//! request-facing saves).
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait initial_backoff
//! attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```
//!
//! Only errors for which [`Error::is_retryable`] holds are retried; anything
//! else is returned on the first occurrence.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget for a retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempts {
    /// At most this many attempts in total (at least one is always made)
    Finite(u32),
    /// Keep trying until the operation succeeds or fails permanently
    Unbounded,
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt budget
    pub max_attempts: Attempts,
    /// Wait before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound for any single wait
    pub max_backoff: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::times(3)
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: Attempts::Finite(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Up to `n` attempts
    #[must_use]
    pub const fn times(n: u32) -> Self {
        Self {
            max_attempts: Attempts::Finite(n),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    /// Retry until success or a non-retryable error
    #[must_use]
    pub const fn forever() -> Self {
        Self {
            max_attempts: Attempts::Unbounded,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Override the backoff bounds
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made
    #[must_use]
    pub const fn allows(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Attempts::Finite(n) => attempts < n,
            Attempts::Unbounded => true,
        }
    }

    /// Wait before attempt number `attempt + 1` (`attempt` >= 1)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run a blocking operation under `policy`
pub fn retry_blocking<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !should_retry(policy, attempts, &e) {
                    return Err(e);
                }
                let wait = policy.backoff(attempts);
                warn!("attempt {attempts} failed: {e}; retrying in {wait:?}");
                std::thread::sleep(wait);
            }
        }
    }
}

/// Run an async operation under `policy`
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !should_retry(policy, attempts, &e) {
                    return Err(e);
                }
                let wait = policy.backoff(attempts);
                warn!("attempt {attempts} failed: {e}; retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

fn should_retry(policy: &RetryPolicy, attempts: u32, err: &Error) -> bool {
    if !err.is_retryable() {
        debug!("not retrying permanent error: {err}");
        return false;
    }
    policy.allows(attempts)
}
