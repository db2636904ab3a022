use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay_ms: u64,
    multiplier: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms,
            multiplier: 2,
            max_delay_ms: 60_000,
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    /// Wait before attempt `attempt + 1`, where `attempt` is zero-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.min(32));
        let calculated = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }

    /// Total backoff spent when every attempt fails.
    pub fn worst_case_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1_000)
    }
}

/// Run `operation` until it succeeds or the policy runs out of attempts.
///
/// Waits between attempts are tokio timers, so other tasks keep running.
/// Cancelling `cancel` abandons the loop immediately, including mid-wait.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    action: &str,
    mut operation: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = policy.max_attempts();
    let mut last_error = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(AppError::cancelled(action));
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(action, attempt = attempt + 1, "retried operation succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                let remaining = attempts - attempt - 1;
                warn!(action, attempt = attempt + 1, remaining, error = %err, "attempt failed");
                last_error = Some(err);
                if remaining == 0 {
                    break;
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(action, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::cancelled(action)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    Err(AppError::fetch_failed(action, attempts, last_error.as_ref()))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;
    use crate::error::AppErrorCategory;

    type Calls = Arc<Mutex<Vec<Instant>>>;

    fn failing_until(calls: &Calls, succeed_on: usize) -> impl FnMut() -> std::future::Ready<Result<u32, AppError>> {
        let calls = Arc::clone(calls);
        move || {
            let mut seen = calls.lock().expect("calls lock");
            seen.push(Instant::now());
            let result = if seen.len() >= succeed_on {
                Ok(seen.len() as u32)
            } else {
                Err(AppError::remote_unavailable("service unavailable"))
            };
            std::future::ready(result)
        }
    }

    fn gaps(calls: &Calls) -> Vec<Duration> {
        let calls = calls.lock().expect("calls lock");
        calls.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    #[test]
    fn default_schedule_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 5);
        let schedule: Vec<_> = (0..4).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
                Duration::from_millis(8_000),
            ]
        );
        assert_eq!(policy.worst_case_backoff(), Duration::from_millis(15_000));
    }

    #[test]
    fn long_outages_wait_at_most_one_minute_between_attempts() {
        let policy = RetryPolicy::new(9, 500);
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(32_000));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(60_000));
        assert_eq!(policy.worst_case_backoff(), Duration::from_millis(123_500));

        let tight = policy.with_max_delay_ms(2_500);
        assert_eq!(tight.delay_for_attempt(3), Duration::from_millis(2_500));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        assert_eq!(RetryPolicy::new(0, 10).max_attempts(), 1);
    }

    #[tokio::test]
    async fn returns_first_success_without_waiting() {
        let calls = Calls::default();
        let cancel = CancellationToken::new();
        let value = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "load_users",
            failing_until(&calls, 1),
        )
        .await
        .expect("first attempt succeeds");

        assert_eq!(value, 1);
        assert_eq!(calls.lock().expect("calls lock").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fifth_attempt_with_doubling_gaps() {
        let calls = Calls::default();
        let cancel = CancellationToken::new();
        let value = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "load_users",
            failing_until(&calls, 5),
        )
        .await
        .expect("fifth attempt succeeds");

        assert_eq!(value, 5);
        let gaps = gaps(&calls);
        assert_eq!(gaps.len(), 4);
        for (gap, expected_ms) in gaps.iter().zip([1_000u64, 2_000, 4_000, 8_000]) {
            let expected = Duration::from_millis(expected_ms);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(5),
                "gap {gap:?} should be {expected:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Calls::default();
        let cancel = CancellationToken::new();
        let err = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "load_users",
            failing_until(&calls, usize::MAX),
        )
        .await
        .expect_err("every attempt fails");

        assert_eq!(err.category, AppErrorCategory::FetchFailed);
        assert_eq!(calls.lock().expect("calls lock").len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_backoff_wait() {
        let calls = Calls::default();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "load_users",
            failing_until(&calls, usize::MAX),
        )
        .await
        .expect_err("loop is cancelled");

        assert_eq!(err.category, AppErrorCategory::Cancelled);
        // Attempts at 0s and 1s; cancelled during the 2s wait.
        assert_eq!(calls.lock().expect("calls lock").len(), 2);
        assert!(started.elapsed() < Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_all_attempts() {
        let calls = Calls::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = retry_with_backoff(
            &RetryPolicy::default(),
            &cancel,
            "load_users",
            failing_until(&calls, 1),
        )
        .await
        .expect_err("already cancelled");

        assert_eq!(err.category, AppErrorCategory::Cancelled);
        assert!(calls.lock().expect("calls lock").is_empty());
    }
}
