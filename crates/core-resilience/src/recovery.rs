//! Error recovery: bounded retries with adaptive backoff behind a circuit breaker
//!
//! [`ErrorRecovery`] runs an operation in an explicit attempt loop:
//! - the breaker is consulted before every attempt, so an open circuit
//!   rejects without invoking the operation
//! - non-retryable failures (auth, other 4xx) return at once
//! - retryable failures sleep for an exponential, jittered backoff scaled by a
//!   per-error-kind multiplier
//! - rate-limit failures never wait less than the server's `retry-after`
//!
//! The per-kind multipliers are learned from whether retries after that kind
//! of error went on to succeed. They are independent of any delay planner
//! state.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ErrorKind, ResilienceError, UpstreamError};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Lower bound of a per-kind backoff multiplier
pub const MIN_KIND_MULTIPLIER: f64 = 0.5;
/// Upper bound of a per-kind backoff multiplier
pub const MAX_KIND_MULTIPLIER: f64 = 3.0;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Maximum delay between retries (the rate-limit floor may exceed it)
    pub max_delay: Duration,

    /// Growth factor per attempt
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0); each delay is stretched by up to this fraction
    pub jitter_factor: f64,

    /// Minimum wait after a rate-limit error without `retry-after`
    pub rate_limit_floor: Duration,

    /// Trailing window for per-kind outcome samples
    pub learning_window: Duration,

    /// Samples required before a kind's multiplier moves
    pub min_samples: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            rate_limit_floor: Duration::from_secs(1),
            learning_window: Duration::from_secs(300),
            min_samples: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before retry number `attempt` (1-based).
    ///
    /// `jitter` is a sample in `[0, 1)` that is scaled by `jitter_factor`.
    pub fn calculate_delay(
        &self,
        kind: ErrorKind,
        attempt: u32,
        kind_multiplier: f64,
        retry_after: Option<Duration>,
        jitter: f64,
    ) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay.as_secs_f64()
            * self.backoff_multiplier.powi(exponent)
            * kind_multiplier
            * (1.0 + jitter.clamp(0.0, 1.0) * self.jitter_factor);

        // Cap at max_delay
        let capped = Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()).max(0.0));

        if kind == ErrorKind::RateLimit {
            capped.max(retry_after.unwrap_or(self.rate_limit_floor))
        } else {
            capped
        }
    }
}

/// Successful result of [`ErrorRecovery::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered<T> {
    pub value: T,
    /// Total attempts, including the successful one
    pub attempts: u32,
}

/// Recovery counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    /// Operations started
    pub operations: u64,
    /// Upstream attempts made
    pub attempts: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Operations that succeeded after at least one retry
    pub recovered: u64,
    /// Operations that ran out of retries
    pub exhausted: u64,
    /// Operations stopped by a non-retryable error
    pub aborted: u64,
    /// Attempts rejected by an open circuit
    pub rejections: u64,
    /// Failed attempts by kind
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

#[derive(Debug)]
struct KindLearning {
    samples: VecDeque<(Instant, bool)>,
    multiplier: f64,
}

impl Default for KindLearning {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            multiplier: 1.0,
        }
    }
}

/// Retry executor with circuit breaking and per-kind adaptive backoff
#[derive(Debug)]
pub struct ErrorRecovery {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    learning: Mutex<HashMap<ErrorKind, KindLearning>>,
    stats: Mutex<RecoveryStats>,
}

impl ErrorRecovery {
    pub fn new(policy: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self {
            policy,
            breaker,
            learning: Mutex::new(HashMap::new()),
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current backoff multiplier for an error kind
    pub fn multiplier_for(&self, kind: ErrorKind) -> f64 {
        self.learning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|l| l.multiplier)
            .unwrap_or(1.0)
    }

    /// Record whether a retry that followed an error of `kind` succeeded.
    ///
    /// Once enough samples exist inside the learning window, poor outcomes
    /// grow the kind's multiplier and good ones shrink it, always within
    /// [`MIN_KIND_MULTIPLIER`, `MAX_KIND_MULTIPLIER`].
    pub fn record_outcome(&self, kind: ErrorKind, success: bool) {
        let now = Instant::now();
        let mut learning = self.learning.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = learning.entry(kind).or_default();

        entry.samples.push_back((now, success));
        while let Some(&(at, _)) = entry.samples.front() {
            if now.duration_since(at) > self.policy.learning_window {
                entry.samples.pop_front();
            } else {
                break;
            }
        }

        if entry.samples.len() < self.policy.min_samples {
            return;
        }

        let successes = entry.samples.iter().filter(|(_, ok)| *ok).count();
        let rate = successes as f64 / entry.samples.len() as f64;
        let previous = entry.multiplier;
        if rate < 0.5 {
            entry.multiplier *= 1.2;
        } else if rate > 0.8 {
            entry.multiplier *= 0.9;
        }
        entry.multiplier = entry.multiplier.clamp(MIN_KIND_MULTIPLIER, MAX_KIND_MULTIPLIER);

        if (entry.multiplier - previous).abs() > f64::EPSILON {
            debug!(
                kind = %kind,
                success_rate = rate,
                multiplier = entry.multiplier,
                "Adjusted retry multiplier"
            );
        }
    }

    /// Backoff before retry number `attempt` after an error of `kind`
    pub fn compute_backoff(
        &self,
        kind: ErrorKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        let jitter = if self.policy.jitter_factor > 0.0 {
            rand::rng().random_range(0.0..1.0)
        } else {
            0.0
        };
        self.policy
            .calculate_delay(kind, attempt, self.multiplier_for(kind), retry_after, jitter)
    }

    /// Execute an operation with retry logic
    ///
    /// Returns the value with the number of attempts it took, or a
    /// [`ResilienceError`] tagged with the attempts made before giving up.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<Recovered<T>, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        self.with_stats(|s| s.operations += 1);

        let mut attempt: u32 = 0;
        let mut previous_kind: Option<ErrorKind> = None;

        loop {
            // Check circuit breaker before every attempt, retries included
            if let Err(err) = self.breaker.try_acquire().await {
                self.with_stats(|s| s.rejections += 1);
                return Err(match err {
                    ResilienceError::CircuitOpen { retry_in, .. } => ResilienceError::CircuitOpen {
                        retry_in,
                        attempts: attempt,
                    },
                    other => other,
                });
            }

            attempt += 1;
            self.with_stats(|s| {
                s.attempts += 1;
                if attempt > 1 {
                    s.retries += 1;
                }
            });

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success().await;
                    if let Some(kind) = previous_kind {
                        self.record_outcome(kind, true);
                        self.with_stats(|s| s.recovered += 1);
                    }
                    return Ok(Recovered {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    if let Some(kind) = previous_kind {
                        self.record_outcome(kind, false);
                    }
                    if error.kind.trips_breaker() {
                        self.breaker.record_failure().await;
                    }
                    self.with_stats(|s| *s.errors_by_kind.entry(error.kind).or_insert(0) += 1);

                    if !error.kind.is_retryable() {
                        self.with_stats(|s| s.aborted += 1);
                        debug!(kind = %error.kind, attempt, "Non-retryable failure");
                        return Err(ResilienceError::NonRetryable {
                            attempts: attempt,
                            last: error,
                        });
                    }

                    if attempt > self.policy.max_retries {
                        self.with_stats(|s| s.exhausted += 1);
                        warn!(kind = %error.kind, attempts = attempt, "Retries exhausted");
                        return Err(ResilienceError::Exhausted {
                            attempts: attempt,
                            last: error,
                        });
                    }

                    // Calculate and apply delay
                    let delay = self.compute_backoff(error.kind, attempt, error.retry_after);
                    debug!(
                        kind = %error.kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    previous_kind = Some(error.kind);
                    sleep(delay).await;
                }
            }
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut RecoveryStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    fn recovery(policy: RetryPolicy, failure_threshold: usize) -> ErrorRecovery {
        ErrorRecovery::new(
            policy,
            CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold,
                success_threshold: 1,
                cooldown: Duration::from_secs(30),
            }),
        )
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = no_jitter();

        let d = |attempt| policy.calculate_delay(ErrorKind::ServerError, attempt, 1.0, None, 0.0);
        assert_eq!(d(1), Duration::from_millis(100));
        assert_eq!(d(2), Duration::from_millis(200));
        assert_eq!(d(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_max_delay_cap() {
        let policy = no_jitter();

        let delay = policy.calculate_delay(ErrorKind::Timeout, 30, 3.0, None, 0.0);
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stretches_within_factor() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..no_jitter()
        };
        let delay = policy.calculate_delay(ErrorKind::Network, 1, 1.0, None, 0.999);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(150));
    }

    #[test]
    fn test_rate_limit_floor_uses_retry_after() {
        let policy = no_jitter();

        let delay = policy.calculate_delay(
            ErrorKind::RateLimit,
            1,
            1.0,
            Some(Duration::from_secs(12)),
            0.0,
        );
        assert_eq!(delay, Duration::from_secs(12));

        let floor = policy.calculate_delay(ErrorKind::RateLimit, 1, 1.0, None, 0.0);
        assert_eq!(floor, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let recovery = recovery(no_jitter(), 10);
        let calls = AtomicU32::new(0);

        let result = recovery
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UpstreamError::from_status(503, "unavailable"))
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "ok");
        assert_eq!(result.attempts, 3);
        let stats = recovery.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.errors_by_kind.get(&ErrorKind::ServerError), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_never_retries() {
        let recovery = recovery(no_jitter(), 10);
        let calls = AtomicU32::new(0);

        let err = recovery
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::from_status(401, "bad token"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ResilienceError::NonRetryable { attempts: 1, .. }));
        assert_eq!(recovery.stats().aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_total_attempts() {
        let recovery = recovery(
            RetryPolicy {
                max_retries: 2,
                ..no_jitter()
            },
            10,
        );

        let err = recovery
            .execute(|| async { Err::<(), _>(UpstreamError::from_message("connection reset")) })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 3);
        assert_eq!(err.kind(), Some(ErrorKind::Network));
        assert!(matches!(err, ResilienceError::Exhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rechecked_between_retries() {
        let recovery = recovery(
            RetryPolicy {
                max_retries: 5,
                ..no_jitter()
            },
            2,
        );
        let calls = AtomicU32::new(0);

        let err = recovery
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::from_status(500, "boom"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, ResilienceError::CircuitOpen { attempts: 2, .. }));
        assert!(matches!(
            recovery.breaker().get_state().await,
            CircuitState::Open { .. }
        ));
        assert_eq!(recovery.stats().rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_keep_circuit_closed() {
        let recovery = recovery(no_jitter(), 1);

        for _ in 0..3 {
            let _ = recovery
                .execute(|| async { Err::<(), _>(UpstreamError::from_status(422, "bad serial")) })
                .await;
        }
        assert_eq!(recovery.breaker().get_state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_multiplier_bounded_and_converges() {
        let recovery = recovery(no_jitter(), 10);

        for _ in 0..200 {
            recovery.record_outcome(ErrorKind::Timeout, false);
        }
        assert_eq!(recovery.multiplier_for(ErrorKind::Timeout), MAX_KIND_MULTIPLIER);

        // Only the failing kind moved
        assert_eq!(recovery.multiplier_for(ErrorKind::Network), 1.0);

        // Old samples age out, then good outcomes pull the multiplier down
        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..200 {
            recovery.record_outcome(ErrorKind::Timeout, true);
        }
        assert_eq!(recovery.multiplier_for(ErrorKind::Timeout), MIN_KIND_MULTIPLIER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_hold_multiplier_steady() {
        let recovery = recovery(no_jitter(), 10);

        for i in 0..100 {
            recovery.record_outcome(ErrorKind::ServerError, i % 3 != 0);
        }
        let m = recovery.multiplier_for(ErrorKind::ServerError);
        assert!((MIN_KIND_MULTIPLIER..=MAX_KIND_MULTIPLIER).contains(&m));
        assert!(m > 0.7 && m < 1.5, "multiplier drifted to {}", m);
    }
}
