//! Exponential backoff for blocking operations

use std::time::{Duration, Instant};

use super::CancelToken;

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries, including the first one
    pub attempts: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Upper bound of the random delay added to each backoff
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(500),
            multiplier: 2.0,
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Why [`RetryPolicy::run`] gave up
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error; not retried
    Fatal { attempts: u32, error: E },
    /// Cancelled while waiting for the next attempt
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Fatal { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, for tests
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            base: Duration::ZERO,
            multiplier: 1.0,
            max: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base.as_millis() as f64 * factor;
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay(retry);
        }
        self.delay(retry) + Duration::from_millis(rand_jitter(jitter_ms))
    }

    /// Run `op` until it succeeds, fails fatally or attempts run out
    ///
    /// `op` receives the 1-based attempt number. Backoff sleeps observe
    /// `cancel`; a cancelled wait returns the last error without retrying.
    pub fn run<T, E>(
        &self,
        cancel: &CancelToken,
        op: impl FnMut(u32) -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>> {
        self.run_within(cancel, Duration::MAX, op, retryable)
    }

    /// Like [`run`](Self::run), but gives up instead of backing off past `budget`
    ///
    /// The first attempt always runs. A retry whose backoff would end after
    /// the budget returns [`RetryError::Exhausted`] right away.
    pub fn run_within<T, E>(
        &self,
        cancel: &CancelToken,
        budget: Duration,
        mut op: impl FnMut(u32) -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>> {
        let attempts = self.attempts.max(1);
        let deadline = Instant::now().checked_add(budget);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) if !retryable(&error) => {
                    return Err(RetryError::Fatal { attempts: attempt, error });
                }
                Err(last) if attempt >= attempts => {
                    return Err(RetryError::Exhausted { attempts: attempt, last });
                }
                Err(last) => {
                    let delay = self.jittered(attempt);
                    if let Some(deadline) = deadline
                        && deadline.saturating_duration_since(Instant::now()) <= delay
                    {
                        log::debug!(
                            "attempt {}/{} failed, no time left for a {:?} backoff",
                            attempt,
                            attempts,
                            delay
                        );
                        return Err(RetryError::Exhausted { attempts: attempt, last });
                    }
                    log::debug!(
                        "attempt {}/{} failed, retrying in {:?}",
                        attempt,
                        attempts,
                        delay
                    );
                    if !cancel.sleep(delay) {
                        return Err(RetryError::Cancelled { attempts: attempt, last });
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Random value in `0..bound` without pulling in a RNG crate
fn rand_jitter(bound: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            attempts: 10,
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(1000),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bound() {
        for _ in 0..50 {
            assert!(rand_jitter(10) < 10);
        }
    }

    #[test]
    fn test_succeeds_after_retryable_failures() {
        let policy = RetryPolicy::immediate(3);
        let mut calls = 0;
        let result: Result<u32, RetryError<&str>> = policy.run(
            &CancelToken::new(),
            |attempt| {
                calls += 1;
                if attempt < 3 { Err("busy") } else { Ok(attempt) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_exhausted_reports_attempts() {
        let policy = RetryPolicy::immediate(3);
        let result: Result<(), _> = policy.run(&CancelToken::new(), |_| Err("busy"), |_| true);
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "busy"
            })
        );
    }

    #[test]
    fn test_fatal_error_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let mut calls = 0;
        let result: Result<(), _> = policy.run(
            &CancelToken::new(),
            |_| {
                calls += 1;
                Err("revoked")
            },
            |_| false,
        );
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[test]
    fn test_cancelled_during_backoff() {
        let policy = RetryPolicy {
            base: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        let cancel = CancelToken::new();
        cancel.cancel();

        let result: Result<(), _> = policy.run(&cancel, |_| Err("busy"), |_| true);
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }

    #[test]
    fn test_budget_cuts_long_backoff() {
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_secs(30),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: Duration::ZERO,
        };
        let started = Instant::now();
        let result: Result<(), _> = policy.run_within(
            &CancelToken::new(),
            Duration::from_millis(50),
            |_| Err("busy"),
            |_| true,
        );

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 1,
                last: "busy"
            })
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_budget_allows_short_backoff() {
        let policy = RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            multiplier: 1.0,
            max: Duration::from_millis(1),
            jitter: Duration::ZERO,
        };
        let result: Result<u32, RetryError<&str>> = policy.run_within(
            &CancelToken::new(),
            Duration::from_secs(10),
            |attempt| if attempt < 3 { Err("busy") } else { Ok(attempt) },
            |_| true,
        );
        assert_eq!(result, Ok(3));
    }
}
