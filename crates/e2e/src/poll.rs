//! Eventually-consistent condition polling with exponential backoff.
//!
//! A predicate performs one observation of the remote system (one HTTP call
//! plus a comparison, one file read, ...) and reports an [`Outcome`].
//! [`poll_until`] keeps re-evaluating it until it succeeds, reports a fatal
//! condition, or the policy's elapsed-time budget runs out.

use std::{fmt::Display, future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Shape of the waits between two observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Wait after the first failed observation.
    pub initial_interval: Duration,
    /// Cap on wait growth.
    pub max_interval: Duration,
    /// Total budget; no new attempt is scheduled past it.
    pub max_elapsed_time: Duration,
    /// Growth factor applied after every wait.
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("initial interval must be greater than zero")]
    ZeroInitialInterval,
    #[error("multiplier must be a finite number greater than 1, got {0}")]
    Multiplier(f64),
    #[error("max interval {max:?} is shorter than initial interval {initial:?}")]
    MaxBelowInitial { initial: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Suite default shape (500ms doubling up to 5s) bounded by `max_elapsed_time`.
    pub fn new(max_elapsed_time: Duration) -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed_time,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// A budget shorter than `initial_interval` is accepted on purpose: it
    /// allows exactly one observation before timing out.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.initial_interval.is_zero() {
            return Err(PolicyError::ZeroInitialInterval);
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(PolicyError::Multiplier(self.multiplier));
        }
        if self.max_interval < self.initial_interval {
            return Err(PolicyError::MaxBelowInitial {
                initial: self.initial_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }

    /// `min(current * multiplier, max_interval)`, saturating on overflow.
    pub fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map(|next| next.min(self.max_interval))
            .unwrap_or(self.max_interval)
    }
}

/// Result of one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The observed state is the desired one.
    Success(T),
    /// Not there yet; observe again later.
    Retry(String),
    /// The desired state can never be reached; stop now.
    Fatal(String),
}

impl<T> Outcome<T> {
    pub fn retry(reason: impl Into<String>) -> Self {
        Outcome::Retry(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Outcome::Fatal(reason.into())
    }

    /// Transport failures are retryable: the remote side may simply not be up yet.
    pub fn transport(err: impl Display) -> Self {
        Outcome::Retry(format!("transport error: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("invalid backoff policy: {0}")]
    InvalidPolicy(#[from] PolicyError),
    #[error("{label}: gave up after {attempts} attempt(s) in {elapsed:?}: {last_reason}")]
    Timeout {
        label: String,
        attempts: u32,
        elapsed: Duration,
        last_reason: String,
    },
    #[error("{label}: attempt {attempt} failed permanently: {reason}")]
    Fatal {
        label: String,
        attempt: u32,
        reason: String,
    },
}

impl PollError {
    /// Number of predicate evaluations performed before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::InvalidPolicy(_) => 0,
            PollError::Timeout { attempts, .. } => *attempts,
            PollError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Evaluate `predicate` until it succeeds, fails fatally, or `policy` runs out of time.
///
/// Evaluations are strictly sequential. Waits start at `initial_interval` and
/// grow by `multiplier` up to `max_interval`. A retry is only scheduled when it
/// fits in `max_elapsed_time`, so the total wall clock never exceeds the budget
/// by more than the duration of the last predicate call.
pub async fn poll_until<T, F, Fut>(
    label: &str,
    policy: &BackoffPolicy,
    mut predicate: F,
) -> Result<PollReport<T>, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T>>,
{
    policy.validate()?;

    let start = Instant::now();
    let mut attempt: u32 = 1;
    let mut wait = policy.initial_interval;

    loop {
        let outcome = predicate().await;
        let elapsed = start.elapsed();
        match outcome {
            Outcome::Success(value) => {
                info!(
                    label,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "condition met"
                );
                return Ok(PollReport {
                    value,
                    attempts: attempt,
                    elapsed,
                });
            }
            Outcome::Fatal(reason) => {
                error!(
                    label,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    %reason,
                    "condition can never be met"
                );
                return Err(PollError::Fatal {
                    label: label.to_string(),
                    attempt,
                    reason,
                });
            }
            Outcome::Retry(reason) => {
                if elapsed.saturating_add(wait) > policy.max_elapsed_time {
                    warn!(
                        label,
                        attempts = attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        %reason,
                        "condition not met before the deadline"
                    );
                    return Err(PollError::Timeout {
                        label: label.to_string(),
                        attempts: attempt,
                        elapsed,
                        last_reason: reason,
                    });
                }
                warn!(
                    label,
                    attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    next_wait_ms = wait.as_millis() as u64,
                    %reason,
                    "condition not met yet"
                );
                sleep(wait).await;
                wait = policy.next_interval(wait);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn policy(initial: u64, max: u64, elapsed: u64, multiplier: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_secs(initial),
            max_interval: Duration::from_secs(max),
            max_elapsed_time: Duration::from_secs(elapsed),
            multiplier,
        }
    }

    #[test]
    fn default_shape_matches_suite_settings() {
        let policy = BackoffPolicy::new(Duration::from_secs(60));
        assert_eq!(policy.initial_interval, Duration::from_millis(500));
        assert_eq!(policy.max_interval, Duration::from_secs(5));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn validate_rejects_degenerate_policies() {
        let zero = policy(1, 30, 60, 2.0).with_initial_interval(Duration::ZERO);
        assert_eq!(zero.validate(), Err(PolicyError::ZeroInitialInterval));

        let flat = policy(1, 30, 60, 1.0);
        assert_eq!(flat.validate(), Err(PolicyError::Multiplier(1.0)));

        let nan = policy(1, 30, 60, f64::NAN);
        assert!(matches!(nan.validate(), Err(PolicyError::Multiplier(_))));

        let inverted = policy(10, 5, 60, 2.0);
        assert!(matches!(
            inverted.validate(),
            Err(PolicyError::MaxBelowInitial { .. })
        ));
    }

    #[test]
    fn intervals_grow_and_cap() {
        let policy = policy(1, 30, 600, 2.0);
        let mut current = policy.initial_interval;
        let mut seen = vec![current];
        for _ in 0..8 {
            current = policy.next_interval(current);
            seen.push(current);
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|d| *d <= policy.max_interval));
        assert_eq!(seen[..5], [1, 2, 4, 8, 16].map(Duration::from_secs));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn next_interval_saturates_on_overflow() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::MAX,
            max_elapsed_time: Duration::MAX,
            multiplier: 1e300,
        };
        assert_eq!(policy.next_interval(Duration::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_waits_do_not_overflow_the_deadline_check() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::MAX,
            max_elapsed_time: Duration::MAX,
            multiplier: 1e300,
        };
        let calls = &RefCell::new(0u32);
        let report = poll_until("unbounded", &policy, move || async move {
            let mut calls = calls.borrow_mut();
            *calls += 1;
            if *calls <= 2 {
                Outcome::retry("not yet")
            } else {
                Outcome::Success(*calls)
            }
        })
        .await
        .expect("poll should succeed");
        assert_eq!(report.value, 3);
        assert_eq!(report.attempts, 3);

        let bounded = BackoffPolicy {
            max_elapsed_time: Duration::from_secs(10),
            ..policy
        };
        let err = poll_until("bounded", &bounded, || async { Outcome::<()>::retry("never") })
            .await
            .expect_err("second wait exceeds the budget");
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_takes_one_attempt() {
        let calls = &RefCell::new(0u32);
        let report = poll_until("immediate", &policy(1, 30, 60, 2.0), move || async move {
            *calls.borrow_mut() += 1;
            Outcome::Success("done")
        })
        .await
        .expect("poll should succeed");

        assert_eq!(report.value, "done");
        assert_eq!(report.attempts, 1);
        assert_eq!(report.elapsed, Duration::ZERO);
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_three_retries_with_doubling_waits() {
        let started = Instant::now();
        let seen = &RefCell::new(Vec::new());
        let report = poll_until("doubling", &policy(1, 30, 60, 2.0), move || async move {
            let mut seen = seen.borrow_mut();
            seen.push(started.elapsed());
            if seen.len() <= 3 {
                Outcome::retry("not yet")
            } else {
                Outcome::Success(seen.len())
            }
        })
        .await
        .expect("poll should succeed");

        assert_eq!(report.value, 4);
        assert_eq!(report.attempts, 4);
        let seen = seen.take();
        let waits: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(waits, [1, 2, 4].map(Duration::from_secs));
        assert_eq!(report.elapsed, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn always_retry_times_out_within_budget() {
        let policy = policy(1, 30, 60, 2.0);
        let calls = &RefCell::new(0u32);
        let started = Instant::now();
        let err = poll_until("never", &policy, move || async move {
            *calls.borrow_mut() += 1;
            Outcome::<()>::retry("still waiting")
        })
        .await
        .expect_err("poll should time out");

        let elapsed = started.elapsed();
        assert!(err.is_timeout());
        assert!(elapsed <= policy.max_elapsed_time);
        // waits 1+2+4+8+16 = 31s; the next 30s wait would overshoot 60s
        assert_eq!(elapsed, Duration::from_secs(31));
        assert_eq!(err.attempts(), 6);
        assert_eq!(*calls.borrow(), 6);
        assert!(err.to_string().contains("still waiting"));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_below_initial_interval_allows_a_single_attempt() {
        let policy = BackoffPolicy {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Duration::from_secs(2),
            multiplier: 2.0,
        };
        let calls = &RefCell::new(0u32);
        let err = poll_until("short budget", &policy, move || async move {
            *calls.borrow_mut() += 1;
            Outcome::<()>::retry("nope")
        })
        .await
        .expect_err("poll should time out");

        assert!(err.is_timeout());
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_stops_immediately() {
        let calls = &RefCell::new(0u32);
        let started = Instant::now();
        let err = poll_until("fatal", &policy(1, 30, 3600, 2.0), move || async move {
            let mut calls = calls.borrow_mut();
            *calls += 1;
            if *calls < 3 {
                Outcome::<()>::retry("warming up")
            } else {
                Outcome::fatal("token revoked")
            }
        })
        .await
        .expect_err("poll should fail");

        match &err {
            PollError::Fatal { attempt, reason, .. } => {
                assert_eq!(*attempt, 3);
                assert_eq!(reason, "token revoked");
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
        assert_eq!(*calls.borrow(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_never_exceed_max_interval() {
        let started = Instant::now();
        let seen = &RefCell::new(Vec::new());
        let _ = poll_until("capped", &policy(1, 3, 40, 2.0), move || async move {
            seen.borrow_mut().push(started.elapsed());
            Outcome::<()>::retry("again")
        })
        .await;

        let seen = seen.take();
        let waits: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(waits.len() > 3);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert!(waits.iter().all(|w| *w <= Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn invalid_policy_never_calls_predicate() {
        let calls = &RefCell::new(0u32);
        let err = poll_until("invalid", &policy(1, 30, 60, 0.5), move || async move {
            *calls.borrow_mut() += 1;
            Outcome::Success(())
        })
        .await
        .expect_err("policy should be rejected");

        assert!(matches!(err, PollError::InvalidPolicy(_)));
        assert_eq!(err.attempts(), 0);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn transport_errors_are_retryable() {
        let outcome: Outcome<()> = Outcome::transport("connection refused");
        assert_eq!(
            outcome,
            Outcome::Retry("transport error: connection refused".into())
        );
    }
}
