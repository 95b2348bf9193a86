//! Retry with exponential backoff for flaky registry and signing calls.
//!
//! Classification ([`is_retryable`]) is kept apart from the loop
//! ([`retry_async`]) so each can be tested on its own.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::Result;

/// Stderr fragments that mark a failure as transient.
pub const RETRYABLE_MARKERS: &[&str] = &["429", "500", "502", "503", "504", "timeout", "WARNING"];

/// Whether captured tool output indicates a transient failure.
pub fn is_retryable(stderr: &str) -> bool {
    RETRYABLE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles each time.
    pub base_delay: Duration,

    /// Add up to one second of uniform jitter to every delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::signing()
    }
}

impl RetryPolicy {
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

    /// 6 attempts, 10s base.
    pub fn signing() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Self::DEFAULT_BASE_DELAY,
            jitter: true,
        }
    }

    /// 10 attempts, 10s base.
    pub fn verification() -> Self {
        Self {
            max_attempts: 10,
            ..Self::signing()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after the zero-based `attempt` failed: `base * 2^attempt (+ U[0,1)s)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(factor);
        if self.jitter {
            let jitter: f64 = rand::rng().random_range(0.0..1.0);
            delay + Duration::from_secs_f64(jitter)
        } else {
            delay
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
///
/// Exhaustion yields [`ToolError::RetriesExhausted`] carrying the last stderr.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_stderr = String::new();

    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempts = attempt + 1, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                last_stderr = err.stderr().map(str::to_string).unwrap_or_else(|| err.to_string());
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(ToolError::RetriesExhausted {
        command: label.to_string(),
        attempts: max_attempts,
        stderr: last_stderr,
    })
}

/// [`retry_async`] specialised to one external command.
pub async fn run_with_retries(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    policy: &RetryPolicy,
) -> Result<CommandOutput> {
    let label = invocation.command_line();
    retry_async(policy, &label, || runner.run_checked(invocation)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ---- classification ----

    #[test]
    fn classification_table() {
        let table: &[(&str, bool)] = &[
            ("received unexpected HTTP status: 500 Internal Server Error", true),
            ("502 Bad Gateway", true),
            ("error: 503 Service Unavailable", true),
            ("504 Gateway Timeout", true),
            ("429 Too Many Requests", true),
            ("dial tcp: i/o timeout", true),
            ("WARNING: skipping transparency log upload", true),
            ("UNAUTHORIZED: authentication required", false),
            ("manifest unknown", false),
            ("no such image", false),
            ("", false),
            // Markers are case-sensitive.
            ("warning: something", false),
            ("TIMEOUT", false),
        ];
        for (stderr, expected) in table {
            assert_eq!(is_retryable(stderr), *expected, "stderr: {stderr:?}");
        }
    }

    // ---- delays ----

    #[test]
    fn delay_doubles_without_jitter() {
        let policy = RetryPolicy::signing().without_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(80));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::signing();
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_secs(10));
            assert!(d < Duration::from_secs(11));
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(RetryPolicy::signing().max_attempts, 6);
        assert_eq!(RetryPolicy::verification().max_attempts, 10);
        assert_eq!(RetryPolicy::default(), RetryPolicy::signing());
        assert_eq!(RetryPolicy::signing().with_max_attempts(0).max_attempts, 1);
    }

    // ---- loop ----

    fn transient() -> ToolError {
        ToolError::Failed {
            command: "cosign".into(),
            exit_code: 1,
            stderr: "503 Service Unavailable".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_retryable_attempts_exactly_max() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::signing();
        let result: Result<()> = retry_async(&policy, "sign", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        match result {
            Err(ToolError::RetriesExhausted { attempts, stderr, .. }) => {
                assert_eq!(attempts, 6);
                assert!(stderr.contains("503"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::signing();
        let result = retry_async(&policy, "sign", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 6 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .expect("should succeed on attempt 6");

        assert_eq!(result, 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_async(&RetryPolicy::signing(), "sign", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ToolError::Failed {
                    command: "cosign".into(),
                    exit_code: 1,
                    stderr: "UNAUTHORIZED".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ToolError::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_between_attempts_only() {
        let policy = RetryPolicy::signing()
            .with_max_attempts(3)
            .without_jitter();
        let start = tokio::time::Instant::now();
        let _: Result<()> = retry_async(&policy, "verify", || async { Err(transient()) }).await;
        // 10s + 20s; no sleep after the final attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }
}
