//! Pacekeeper Core Resilience: Pure-logic pacing and fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the Pacekeeper governor uses to
//! talk to a rate-limited, unreliable upstream. It includes:
//!
//! - **Rate State**: Sliding request windows with limits learned from headers or repeated 429s
//! - **Burst Coordinator**: Short, time-boxed bursts when the window has headroom
//! - **Delay Planner**: Weighted delay recommendation with online base/multiplier learning
//! - **Circuit Breaker**: Fails fast while the upstream is unhealthy
//! - **Error Recovery**: Bounded retries with exponential, jittered, per-kind adaptive backoff
//! - **Dead-Letter Queue**: Bounded record of items that failed for good
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Transport (HTTP clients, vendor APIs)
//! - Persistence
//! - Scheduling of work items
//!
//! Timing uses `tokio::time::Instant`, so every component can be driven on a
//! paused test clock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Governor (pacekeeper)           │
//! └─────────────┬───────────────────────────┘
//!               │ plan
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │  Rate State · Burst · Delay Planner     │  ← When to send
//! │  (windows, learned limits, weights)     │
//! └─────────────┬───────────────────────────┘
//!               │ execute
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Error Recovery                    │  ← How to recover
//! │  (Circuit Breaker + Retry Policy)       │
//! └─────────────┬───────────────────────────┘
//!               │ terminal failure?
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Dead-Letter Queue                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use pacekeeper_core_resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, ErrorRecovery, ResilienceError, RetryPolicy,
//!     UpstreamError,
//! };
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     success_threshold: 2,
//!     cooldown: Duration::from_secs(60),
//! });
//! let recovery = ErrorRecovery::new(RetryPolicy::default(), breaker);
//!
//! let outcome = recovery
//!     .execute(|| async {
//!         // Your potentially failing upstream call
//!         Ok::<_, UpstreamError>(42)
//!     })
//!     .await?;
//! assert_eq!(outcome.value, 42);
//! # Ok(())
//! # }
//! ```

pub mod burst;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod delay_planner;
pub mod error;
pub mod rate_state;
pub mod recovery;

// Re-export main types for convenience
pub use burst::{BurstConfig, BurstCoordinator, BurstDecision, BurstEndReason, BurstSnapshot};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitSnapshot, CircuitState,
};
pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats, FailureReason};
pub use delay_planner::{DelayContext, DelayPlanner, DelayPlannerConfig, ResponseFeedback};
pub use error::{ErrorKind, ResilienceError, UpstreamError};
pub use rate_state::{
    DetectedLimits, LearnedLimit, LimitSource, RateLimitConfig, RateLimitHeaders, RateState,
    RateWindowCounts, RequestRecord, SendSlot,
};
pub use recovery::{ErrorRecovery, Recovered, RecoveryStats, RetryPolicy};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use pacekeeper_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::burst::{BurstConfig, BurstCoordinator, BurstEndReason};
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPhase};
    pub use super::dead_letter::{DeadLetterEntry, DeadLetterQueue, FailureReason};
    pub use super::delay_planner::{DelayContext, DelayPlanner, DelayPlannerConfig};
    pub use super::error::{ErrorKind, ResilienceError, UpstreamError};
    pub use super::rate_state::{RateLimitConfig, RateLimitHeaders, RateState, RequestRecord};
    pub use super::recovery::{ErrorRecovery, RetryPolicy};
}
