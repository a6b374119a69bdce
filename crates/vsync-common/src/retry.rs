//! Retry utilities with exponential backoff and jitter.
//!
//! Three pieces live here:
//! - [`retry_with_backoff`]: retry an async operation in place (startup work,
//!   one-shot helpers).
//! - [`BackoffTracker`]: per-key attempt counters used by controller error
//!   policies to compute the next requeue delay.
//! - [`poll_until`]: bounded poll of a condition with cancellation.
//!
//! The mapping layer never retries on its own; these helpers are used only by
//! callers that own a retry policy.

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{Error, Result};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = jitter(delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                // Exponential backoff, capped at max_delay
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Exponential backoff policy: `base * 2^attempt`, capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay for the given zero-based attempt, without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(32) as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Delay for the given attempt with 0.5x-1.5x jitter, still capped at `max`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        jitter(self.delay(attempt)).min(self.max)
    }
}

/// Per-key failure counters feeding a [`Backoff`] policy.
///
/// Controller error policies are synchronous and may run concurrently for
/// different keys, so counters live in a `DashMap`.
#[derive(Debug)]
pub struct BackoffTracker<K: Eq + Hash> {
    policy: Backoff,
    attempts: DashMap<K, u32>,
}

impl<K: Eq + Hash> BackoffTracker<K> {
    /// Create a tracker using the given policy
    pub fn new(policy: Backoff) -> Self {
        Self {
            policy,
            attempts: DashMap::new(),
        }
    }

    /// Record a failure and return (attempts so far, next delay)
    pub fn record_failure(&self, key: K) -> (u32, Duration) {
        let mut entry = self.attempts.entry(key).or_insert(0);
        let attempt = *entry;
        *entry += 1;
        (*entry, self.policy.jittered_delay(attempt))
    }

    /// Current failure count for a key
    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Jittered delay for the failures recorded so far (base delay if none)
    pub fn next_delay(&self, key: &K) -> Duration {
        self.policy
            .jittered_delay(self.attempts(key).saturating_sub(1))
    }

    /// Clear failure tracking for a key (on success)
    pub fn reset(&self, key: &K) {
        self.attempts.remove(key);
    }
}

/// Poll `check` every `interval` until it returns `Ok(true)`.
///
/// Fails with a transient error when `timeout` elapses or `cancel` fires, and
/// returns the first error `check` produces.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if check().await? {
            return Ok(());
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(Error::transient_with_context(
                "poll",
                format!("condition not met within {timeout:?}"),
            ));
        }

        let sleep = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::transient_with_context("poll", "cancelled"));
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
