//! Bounded exponential backoff for repository calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Retry policy for transient repository failures.
///
/// # Environment Variables
///
/// | Variable | Type | Default |
/// |----------|------|---------|
/// | `MEMDEDUP_RETRY_MAX_ATTEMPTS` | u32 | `3` |
/// | `MEMDEDUP_RETRY_BACKOFF_MS` | u64 | `100` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Loads the policy from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MEMDEDUP_RETRY_MAX_ATTEMPTS") {
            if let Ok(parsed) = v.parse::<u32>() {
                self.max_attempts = parsed.max(1);
            }
        }
        if let Ok(v) = std::env::var("MEMDEDUP_RETRY_BACKOFF_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.initial_backoff_ms = parsed;
            }
        }
        self
    }

    /// Sets the attempt budget (at least one).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial backoff.
    #[must_use]
    pub const fn with_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Runs `call`, retrying transient failures until the attempt budget runs out.
    ///
    /// Permanent errors are returned immediately.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-transient error.
    pub fn execute<T, F>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.backoff_for(attempt);
                    metrics::counter!("dedup_repository_retries_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Transient repository failure, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                },
                Err(err) => {
                    if err.is_transient() {
                        metrics::counter!(
                            "dedup_repository_retries_exhausted_total",
                            "operation" => operation
                        )
                        .increment(1);
                    }
                    return Err(exhausted(err, attempt));
                },
            }
        }
    }
}

fn exhausted(err: Error, attempts: u32) -> Error {
    match err {
        Error::Repository {
            operation,
            cause,
            transient: true,
        } if attempts > 1 => Error::Repository {
            operation,
            cause: format!("{cause} (gave up after {attempts} attempts)"),
            transient: true,
        },
        other => other,
    }
}
