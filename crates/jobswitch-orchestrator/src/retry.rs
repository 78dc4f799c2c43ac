use jobswitch_core::{JobSwitchError, JobSwitchResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Longest single backoff, in seconds. Computed delays are clamped to it.
pub const MAX_BACKOFF_SECS: f64 = 24.0 * 3600.0;

/// Seconds to a `Duration`, clamped to `[0, MAX_BACKOFF_SECS]`.
fn backoff(secs: f64) -> Duration {
    let secs = if secs.is_nan() { 0.0 } else { secs.clamp(0.0, MAX_BACKOFF_SECS) };
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn check_delay(section: &str, name: &str, value: f64) -> JobSwitchResult<()> {
    if value.is_finite() && (0.0..=MAX_BACKOFF_SECS).contains(&value) {
        Ok(())
    } else {
        Err(JobSwitchError::Config(format!(
            "{section}.{name} must be between 0 and {MAX_BACKOFF_SECS} seconds, got {value}"
        )))
    }
}

/// Exponential backoff with optional jitter for a bounded number of attempts.
///
/// Delays are expressed in seconds so the struct reads naturally from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in seconds.
    pub base_delay: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_delay: f64,
    /// Growth factor applied per attempt.
    pub exponential_base: f64,
    /// Perturb each delay by up to ±10%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// The policy used for agent registration.
    pub fn registration() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 2.0,
            max_delay: 30.0,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    /// Delay to wait after the given 1-based attempt fails.
    ///
    /// `min(base_delay * exponential_base^(attempt-1), max_delay)`, jittered
    /// by ±10% when enabled and never negative.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay = (self.base_delay * self.exponential_base.powi(exponent)).min(self.max_delay);
        if !delay.is_finite() {
            delay = self.max_delay;
        }
        if self.jitter && delay > 0.0 {
            let factor = rand::thread_rng().gen_range(-0.1..=0.1);
            delay += delay * factor;
        }
        backoff(delay)
    }

    /// Reject delays that are negative, non-finite or beyond `MAX_BACKOFF_SECS`.
    pub fn validate(&self, section: &str) -> JobSwitchResult<()> {
        check_delay(section, "base_delay", self.base_delay)?;
        check_delay(section, "max_delay", self.max_delay)?;
        if !(self.exponential_base.is_finite() && self.exponential_base >= 1.0) {
            return Err(JobSwitchError::Config(format!(
                "{section}.exponential_base must be a finite number >= 1, got {}",
                self.exponential_base
            )));
        }
        Ok(())
    }

    /// Run `op` until it succeeds, the attempt budget is spent, or it fails
    /// with a non-retryable error. `op` receives the 1-based attempt number.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> JobSwitchResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = JobSwitchResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(operation, attempt, error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(operation, attempts = attempt, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.calculate_delay(attempt);
                    info!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Backoff applied before re-submitting a failed task.
///
/// The delay for a task that has already been retried `n` times is
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRetryConfig {
    /// Seconds before the first re-submission.
    pub base_delay: f64,
    /// Cap on the re-submission delay, in seconds.
    pub max_delay: f64,
}

impl Default for TaskRetryConfig {
    fn default() -> Self {
        Self {
            base_delay: 1.0,
            max_delay: 60.0,
        }
    }
}

impl TaskRetryConfig {
    /// Delay before the generation following `retry_count` retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let delay = (self.base_delay * 2f64.powi(exponent)).min(self.max_delay);
        if delay.is_finite() {
            backoff(delay)
        } else {
            backoff(self.max_delay)
        }
    }

    pub fn validate(&self, section: &str) -> JobSwitchResult<()> {
        check_delay(section, "base_delay", self.base_delay)?;
        check_delay(section, "max_delay", self.max_delay)
    }
}
