//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when the
//! upstream is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Upstream is unhealthy, requests fail immediately
//! - HalfOpen: Testing if the upstream has recovered
//!
//! The only reachable edges are Closed → Open, Open → HalfOpen,
//! HalfOpen → Closed and HalfOpen → Open. Every transition happens under the
//! state lock, so concurrent callers observe them in a single order.

use super::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Maximum transitions kept in the breaker's log
const TRANSITION_LOG_CAPACITY: usize = 64;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    /// Next probe time indicates when to try half-open
    Open { next_probe: Instant },
    /// Circuit is half-open, testing upstream recovery
    HalfOpen,
}

impl CircuitState {
    /// The state without its timing payload
    pub fn phase(&self) -> CircuitPhase {
        match self {
            CircuitState::Closed => CircuitPhase::Closed,
            CircuitState::Open { .. } => CircuitPhase::Open,
            CircuitState::HalfOpen => CircuitPhase::HalfOpen,
        }
    }
}

/// Serializable circuit phase for snapshots and transition logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitPhase {
    /// Check if `self → next` is an edge of the breaker state machine
    pub fn can_transition_to(&self, next: CircuitPhase) -> bool {
        matches!(
            (self, next),
            (CircuitPhase::Closed, CircuitPhase::Open)
                | (CircuitPhase::Open, CircuitPhase::HalfOpen)
                | (CircuitPhase::HalfOpen, CircuitPhase::Closed)
                | (CircuitPhase::HalfOpen, CircuitPhase::Open)
        )
    }
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "CLOSED"),
            CircuitPhase::Open => write!(f, "OPEN"),
            CircuitPhase::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: usize,
    /// Duration to wait before transitioning from open to half-open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub phase: CircuitPhase,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Milliseconds until an open circuit allows a probe
    pub probe_in_ms: Option<u64>,
    pub times_opened: u64,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    /// Current state of the circuit
    state: CircuitState,
    /// Consecutive failure count
    consecutive_failures: usize,
    /// Consecutive success count (used in half-open state)
    consecutive_successes: usize,
    /// Recent (from, to) transitions, oldest first
    transitions: VecDeque<(CircuitPhase, CircuitPhase)>,
    times_opened: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            transitions: VecDeque::with_capacity(TRANSITION_LOG_CAPACITY),
            times_opened: 0,
        }
    }

    fn transition(&mut self, next: CircuitState) {
        let from = self.state.phase();
        let to = next.phase();
        debug_assert!(from.can_transition_to(to), "illegal edge {} -> {}", from, to);

        self.state = next;
        if self.transitions.len() >= TRANSITION_LOG_CAPACITY {
            self.transitions.pop_front();
        }
        self.transitions.push_back((from, to));

        match to {
            CircuitPhase::Open => {
                self.times_opened += 1;
                warn!(from = %from, "Circuit breaker opened");
            }
            _ => info!(from = %from, to = %to, "Circuit breaker transition"),
        }
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// # Example
/// ```no_run
/// use pacekeeper_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
///     breaker.try_acquire().await?;
///     // ... call the upstream ...
///     breaker.record_success().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Get the breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        let state = self.state.lock().await;
        state.state
    }

    /// Get current failure count
    pub async fn get_failure_count(&self) -> usize {
        let state = self.state.lock().await;
        state.consecutive_failures
    }

    /// Recent transitions, oldest first
    pub async fn transitions(&self) -> Vec<(CircuitPhase, CircuitPhase)> {
        let state = self.state.lock().await;
        state.transitions.iter().copied().collect()
    }

    /// Snapshot for status reporting
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock().await;
        let probe_in_ms = match state.state {
            CircuitState::Open { next_probe } => Some(
                next_probe
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        CircuitSnapshot {
            phase: state.state.phase(),
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            probe_in_ms,
            times_opened: state.times_opened,
        }
    }

    /// Time left before an open circuit allows a probe.
    ///
    /// Returns `None` when the circuit would let a call through right now.
    /// Does not change state; the Open → HalfOpen edge is taken by
    /// [`CircuitBreaker::try_acquire`].
    pub async fn remaining_cooldown(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        match state.state {
            CircuitState::Open { next_probe } => {
                let now = Instant::now();
                if now >= next_probe {
                    None
                } else {
                    Some(next_probe - now)
                }
            }
            _ => None,
        }
    }

    /// Reset the circuit breaker to closed state
    ///
    /// Administrative escape hatch; bypasses the transition rules and is
    /// not recorded in the transition log.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Check circuit state and update if necessary
    ///
    /// Takes the Open → HalfOpen edge once the cooldown has elapsed. Rejects
    /// with [`ResilienceError::CircuitOpen`] while it has not.
    pub async fn try_acquire(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { next_probe } => {
                let now = Instant::now();
                if now >= next_probe {
                    // Transition to half-open for testing
                    state.consecutive_successes = 0;
                    state.transition(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(ResilienceError::CircuitOpen {
                        retry_in: next_probe - now,
                        attempts: 0,
                    })
                }
            }
            CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                // Reset failure count on success
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.config.success_threshold {
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open { .. } => {
                // A call admitted before the circuit opened finished late.
                // Open only leaves through HalfOpen, so ignore it.
            }
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;

                if state.consecutive_failures >= self.config.failure_threshold {
                    state.consecutive_failures = 0;
                    state.transition(CircuitState::Open {
                        next_probe: Instant::now() + self.config.cooldown,
                    });
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state reopens the circuit
                state.consecutive_successes = 0;
                state.transition(CircuitState::Open {
                    next_probe: Instant::now() + self.config.cooldown,
                });
            }
            CircuitState::Open { .. } => {
                // Already open, nothing to do
            }
        }
    }

    /// Record the outcome of a call
    pub async fn record(&self, result: &Result<(), ResilienceError>) {
        match result {
            Ok(()) => self.record_success().await,
            Err(e) if e.should_trip_breaker() => self.record_failure().await,
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn fast_config(failure_threshold: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 2,
            cooldown: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new(fast_config(3));

        for _ in 0..3 {
            tokio_test::assert_ok!(breaker.try_acquire().await);
            breaker.record_failure().await;
        }

        match breaker.get_state().await {
            CircuitState::Open { .. } => (),
            state => panic!("Expected Open state, got {:?}", state),
        }
        let err = tokio_test::assert_err!(breaker.try_acquire().await);
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(fast_config(3));

        breaker.record_failure().await;
        breaker.record_failure().await;
        breaker.record_success().await;
        breaker.record_failure().await;

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_to_closed() {
        let breaker = CircuitBreaker::new(fast_config(2));

        breaker.record_failure().await;
        breaker.record_failure().await;
        assert!(breaker.remaining_cooldown().await.is_some());

        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(breaker.remaining_cooldown().await.is_none());

        assert!(breaker.try_acquire().await.is_ok());
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config(1));

        breaker.record_failure().await;
        tokio::time::advance(Duration::from_millis(110)).await;
        breaker.try_acquire().await.unwrap();
        assert_eq!(breaker.get_state().await, CircuitState::HalfOpen);

        breaker.record_failure().await;
        assert!(matches!(
            breaker.get_state().await,
            CircuitState::Open { .. }
        ));
        assert_eq!(
            breaker.transitions().await,
            vec![
                (CircuitPhase::Closed, CircuitPhase::Open),
                (CircuitPhase::Open, CircuitPhase::HalfOpen),
                (CircuitPhase::HalfOpen, CircuitPhase::Open),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_outcomes_only_take_legal_edges() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::from_millis(50),
        });
        let mut rng = StdRng::seed_from_u64(0xB4EA);

        for _ in 0..2_000 {
            match rng.random_range(0..4) {
                0 => tokio::time::advance(Duration::from_millis(rng.random_range(0..80))).await,
                1 => breaker.record_success().await,
                _ => {
                    if breaker.try_acquire().await.is_ok() {
                        if rng.random_bool(0.6) {
                            breaker.record_failure().await;
                        } else {
                            breaker.record_success().await;
                        }
                    }
                }
            }
        }

        let transitions = breaker.transitions().await;
        assert!(!transitions.is_empty());
        for (from, to) in transitions {
            assert!(from.can_transition_to(to), "{} -> {}", from, to);
        }
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip() {
        use crate::error::UpstreamError;

        let breaker = CircuitBreaker::new(fast_config(1));
        let err = ResilienceError::Upstream(UpstreamError::from_status(404, "no such device"));
        breaker.record(&Err(err)).await;
        assert_eq!(breaker.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new(fast_config(1));

        breaker.record_failure().await;
        breaker.reset().await;

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 0);
    }
}
