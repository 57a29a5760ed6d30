//! Retry with exponential backoff for transient provider errors.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::ProviderError;

/// How transient provider errors are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay, hints included.
    pub max_backoff: Duration,
}

/// Result of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Number of calls made.
    pub attempts: u32,
    /// Cancellation ended a backoff wait before the call could resolve.
    pub interrupted: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            max_attempts: engine.max_attempts,
            initial_backoff: Duration::from_millis(engine.initial_backoff_ms),
            max_backoff: Duration::from_millis(engine.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based). A provider hint replaces the computed backoff.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = hint.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
            self.initial_backoff.saturating_mul(factor)
        });
        delay.min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of
    /// attempts. Cancellation interrupts a backoff wait and returns the last
    /// error with `interrupted` set.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{label}: succeeded on attempt {attempt}");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                        interrupted: false,
                    };
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt, e.retry_after());
                    warn!(
                        "{label}: attempt {attempt}/{max_attempts} failed ({e}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            warn!("{label}: cancelled while waiting to retry");
                            return Attempted {
                                result: Err(e),
                                attempts: attempt,
                                interrupted: true,
                            };
                        }
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{label}: giving up after {attempt} attempts: {e}");
                    }
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                        interrupted: false,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4, None), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40, None), Duration::from_secs(3));
    }

    #[test]
    fn test_hint_replaces_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(600))),
            policy.max_backoff
        );
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = fast(4)
            .run("test", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderError::Unavailable {
                        message: String::from("blip"),
                    })
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(outcome.result, Ok(7));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let outcome: Attempted<()> = fast(3)
            .run("test", &CancellationToken::new(), || async {
                Err(ProviderError::RateLimited { retry_after: None })
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(ProviderError::RateLimited { .. })));
        assert!(!outcome.interrupted);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let outcome: Attempted<()> = fast(5)
            .run("test", &CancellationToken::new(), || async {
                Err(ProviderError::rejected("quota"))
            })
            .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: Attempted<()> = policy
            .run("test", &cancel, || async {
                Err(ProviderError::Timeout {
                    message: String::from("slow"),
                })
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
        assert!(outcome.interrupted);
    }
}
