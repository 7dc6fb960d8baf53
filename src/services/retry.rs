//! Bounded exponential backoff for transient service errors.

use crate::errors::{ControllerError, ControllerResult};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Base backoff duration for retries.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Maximum backoff duration.
const BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: BACKOFF_BASE,
            max_delay: BACKOFF_MAX,
        }
    }

    /// Zero-delay policy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. The closure receives the 1-based attempt
    /// number.
    ///
    /// # Errors
    ///
    /// Returns the last error; an exhausted budget is reported as
    /// `ControllerError::Transient` naming the attempt count.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> ControllerResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ControllerResult<T>>,
    {
        let mut backoff = self.base_delay;
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = if self.base_delay.is_zero() {
                        Duration::ZERO
                    } else {
                        backoff.min(self.max_delay) + Duration::from_millis(rand_jitter())
                    };
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    return Err(ControllerError::Transient(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, err
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Generates random jitter for backoff (0-50ms).
fn rand_jitter() -> u64 {
    (uuid::Uuid::new_v4().as_u128() % 50) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = RetryPolicy::immediate(3)
            .run("submit", |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ControllerError::Transient("throttled".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_exhaustion_as_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::immediate(2)
            .run("submit", |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ControllerError::Transient("throttled".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = RetryPolicy::immediate(5)
            .run("submit", |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ControllerError::Configuration("bad role".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ControllerError::Configuration(_)));
    }
}
