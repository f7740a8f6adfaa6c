//! Exponential backoff retry with jitter.
//!
//! Mirrors the reconnection-delay formula used throughout the provider clients
//! this crate grew out of: `delay = min(base * mult^(n-1), cap) * (1 ± jitter)`.

mod jitter;

pub use jitter::jitter_offset;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{RelayError, RelayResult};

/// One named retry configuration. See [`presets`] for the four standard
/// configurations used across the transports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-indexed). Attempt 1 has no prior delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let mult = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = (base * mult).min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            raw + jitter_offset(raw * self.jitter)
        } else {
            raw
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    fn should_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        attempt < self.max_attempts && elapsed < self.timeout
    }
}

/// Snapshot of an in-flight retried operation, useful for statistics reporting.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_id: String,
    pub attempt_number: u32,
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
}

/// Aggregate counters for a [`RetryExecutor`], read under a lock-free snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryMetrics {
    pub executions: u64,
    pub retries: u64,
    pub exhaustions: u64,
}

/// Drives a fallible async operation through a [`RetryPolicy`].
pub struct RetryExecutor {
    policy: RetryPolicy,
    executions: AtomicU64,
    retries: AtomicU64,
    exhaustions: AtomicU64,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            executions: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            executions: self.executions.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }

    /// Runs `operation` until it succeeds, the policy is exhausted, or `cancel`
    /// is triggered. `op_id` is only used for logging/context, not dispatch.
    pub async fn execute<F, Fut, T>(
        &self,
        op_id: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                r = operation() => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let elapsed = started.elapsed();
                    if !err.is_retryable() || !self.policy.should_retry(attempt, elapsed) {
                        self.exhaustions.fetch_add(1, Ordering::Relaxed);
                        warn!(op_id, attempt, error = %err, "retry exhausted");
                        return Err(err);
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(op_id, attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// The four standard retry profiles used by the transports.
pub mod presets {
    use super::RetryPolicy;
    use std::time::Duration;

    pub fn network_ops() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn socket_reconnect() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.25,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn transcription_recovery() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: 0.15,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn batch_api() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 7,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            timeout: Duration::from_secs(180),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = presets::transcription_recovery();
        // jitter disabled for a deterministic check of the unjittered shape
        let policy = RetryPolicy { jitter: 0.0, ..policy };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        // capped at max_delay (2s) well before attempt 10
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let executor = RetryExecutor::new(presets::transcription_recovery());
        let cancel = CancellationToken::new();
        let attempts = std::sync::atomic::AtomicU32::new(0);

        let result = executor
            .execute("op-1", &cancel, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RelayError::Transport("timeout talking to host".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(executor.metrics().retries, 2);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let executor = RetryExecutor::new(presets::network_ops());
        let cancel = CancellationToken::new();

        let result: RelayResult<()> = executor
            .execute("op-2", &cancel, || async { Err(RelayError::Auth("bad key".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(executor.metrics().retries, 0);
        assert_eq!(executor.metrics().exhaustions, 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_backoff() {
        let executor = RetryExecutor::new(presets::socket_reconnect());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: RelayResult<()> = executor
            .execute("op-3", &cancel, || async {
                Err(RelayError::Transport("connection lost".into()))
            })
            .await;

        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
