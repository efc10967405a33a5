use crate::error::{AggregationError, Result};
use crate::schema::RetryPolicy;
use log::warn;
use std::time::Duration;

/// Exponential backoff: attempt `n` waits `base * 2^n` milliseconds until the
/// cumulative wait would pass the cap. The last wait is trimmed to the cap
/// and the helper reports that retries are exhausted.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_ms: u64,
    cap_ms: u64,
    attempt: u32,
    elapsed_ms: u64,
    max_retries_reached: bool,
    sleep: fn(Duration),
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            base_ms: policy.base_ms,
            cap_ms: policy.cap_ms,
            attempt: 0,
            elapsed_ms: 0,
            max_retries_reached: false,
            sleep: std::thread::sleep,
        }
    }

    /// Replaces the sleep function, e.g. with a no-op in tests.
    pub fn with_sleeper(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn max_retries_reached(&self) -> bool {
        self.max_retries_reached
    }

    /// Wait the next call to [`Self::backoff`] would take, ignoring the cap.
    pub fn next_wait_ms(&self) -> u64 {
        self.base_ms
            .saturating_mul(2u64.saturating_pow(self.attempt.saturating_add(1)))
    }

    /// Sleeps for the next interval and returns it.
    pub fn backoff(&mut self) -> Duration {
        let mut wait = self.next_wait_ms();
        self.attempt = self.attempt.saturating_add(1);

        if self.elapsed_ms.saturating_add(wait) > self.cap_ms {
            wait = self.cap_ms.saturating_sub(self.elapsed_ms);
            self.max_retries_reached = true;
        }

        let wait = Duration::from_millis(wait);
        (self.sleep)(wait);
        self.elapsed_ms = self.elapsed_ms.saturating_add(wait.as_millis() as u64);
        wait
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.elapsed_ms = 0;
        self.max_retries_reached = false;
    }

    /// Runs `op` until it succeeds or the cumulative wait reaches the cap.
    pub fn retry<T, F>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.reset();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if self.max_retries_reached => {
                    return Err(AggregationError::MaxRetriesReached {
                        attempts: self.attempt + 1,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let wait = self.backoff();
                    warn!(
                        "{} failed (attempt {}): {}; retrying after {:?}",
                        label, self.attempt, e, wait
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn no_sleep(_: Duration) {}

    fn policy(base_ms: u64, cap_ms: u64) -> RetryPolicy {
        RetryPolicy { base_ms, cap_ms }
    }

    #[test]
    fn test_waits_double_until_cap() {
        let mut backoff = ExponentialBackoff::new(policy(50, 1000)).with_sleeper(no_sleep);
        let waits: Vec<u64> = (0..4).map(|_| backoff.backoff().as_millis() as u64).collect();
        assert_eq!(waits, vec![100, 200, 400, 300]);
        assert!(backoff.max_retries_reached());
        assert_eq!(backoff.elapsed_ms(), 1000);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(!backoff.max_retries_reached());
        assert_eq!(backoff.next_wait_ms(), 100);
    }

    #[test]
    fn test_retry_recovers_after_transient_failures() {
        let mut backoff = ExponentialBackoff::new(policy(50, 60_000)).with_sleeper(no_sleep);
        let calls = Cell::new(0);
        let value = backoff
            .retry("put batch", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(AggregationError::StoreError("throttled".to_string()))
                } else {
                    Ok(calls.get())
                }
            })
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn test_retry_reports_max_retries() {
        let mut backoff = ExponentialBackoff::new(policy(50, 1000)).with_sleeper(no_sleep);
        let result: Result<()> = backoff.retry("put batch", || {
            Err(AggregationError::StoreError("down".to_string()))
        });
        match result {
            Err(AggregationError::MaxRetriesReached {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("down"));
            }
            other => panic!("expected MaxRetriesReached, got {:?}", other),
        }
    }
}
