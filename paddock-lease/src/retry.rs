use std::{future::Future, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Backoff schedule for transient store failures.
///
/// Conservative by default: capped exponential with a low retry count.
/// Logical conflicts are never routed through here.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(Error::Invalid("retry initial_interval must be non-zero".into()));
        }
        if self.max_interval < self.initial_interval {
            return Err(Error::Invalid(
                "retry max_interval must be >= initial_interval".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Invalid("retry multiplier must be >= 1".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::Invalid("retry budget must be non-zero".into()));
        }
        Ok(())
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Drive `op` to completion, retrying transient errors on the policy's
/// schedule. Non-transient errors and retry-budget exhaustion return
/// immediately; cancellation interrupts the delay, never the attempt.
pub(crate) async fn with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt, "retry successful");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                attempt += 1;
                warn!(?delay, attempt, err = %err, "transient store error, retrying");
                select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
