//! Bounded retries and deadline polling.
//!
//! Two shapes of waiting show up across the orchestrator:
//!
//! - [`retry_with_backoff`] re-runs a fallible call (a DNS record update, a
//!   load-balancer lookup) with exponential backoff and jitter.
//! - [`poll_until`] re-checks a condition at a fixed interval until it holds or
//!   a deadline passes (instance IPs, node readiness, cluster health).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::{Error, Result};

/// Backoff settings for calls to external services that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
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

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted.
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
                    return Err(e);
                }

                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "operation failed, retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Poll until a condition holds or the timeout passes.
///
/// `check_fn` returns `Ok(true)` when the condition is met and `Ok(false)` to
/// keep polling. Errors from the check are treated as "not yet" since the
/// thing being polled is usually mid-transition (a rebooting node, a booting
/// API server).
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    what: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let what = what.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) => trace!(what = %what, error = %e, "poll check failed, retrying"),
        }

        if Instant::now() + poll_interval > deadline {
            return Err(Error::timeout(what, timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
