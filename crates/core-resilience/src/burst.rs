//! Burst coordination
//!
//! A burst lets a short run of requests skip the per-minute pacing when the
//! window has plenty of headroom. Bursts are small, time-boxed and separated
//! by a cooldown. A rate-limit hit during a burst stops it at once and puts
//! the coordinator into conservative mode, where no further bursts are
//! granted until conservative mode is lifted.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for burst behavior
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Largest burst ever granted
    pub max_burst_size: u32,
    /// Bursts smaller than this are refused
    pub min_burst_size: u32,
    /// Maximum burst duration
    pub window: Duration,
    /// Quiet period after a burst ends
    pub cooldown: Duration,
    /// Share of remaining capacity a burst may take
    pub capacity_fraction: f64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            max_burst_size: 10,
            min_burst_size: 3,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            capacity_fraction: 0.5,
        }
    }
}

/// Answer to [`BurstCoordinator::can_burst`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstDecision {
    pub allowed: bool,
    pub size: u32,
    pub reason: String,
}

impl BurstDecision {
    fn refuse(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            size: 0,
            reason: reason.into(),
        }
    }
}

/// Why a burst ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstEndReason {
    /// The burst window elapsed
    Timeout,
    /// The burst used its budget or was ended by the caller
    Completed,
    /// The upstream pushed back during the burst
    RateLimited,
}

impl fmt::Display for BurstEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BurstEndReason::Timeout => write!(f, "timeout"),
            BurstEndReason::Completed => write!(f, "completed"),
            BurstEndReason::RateLimited => write!(f, "rate_limited"),
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveBurst {
    started: Instant,
    size: u32,
    used: u32,
    successes: u32,
    failures: u32,
}

/// Burst counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BurstStats {
    pub started: u64,
    pub ended_timeout: u64,
    pub ended_completed: u64,
    pub ended_rate_limited: u64,
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct BurstSnapshot {
    pub active: bool,
    pub size: u32,
    pub used: u32,
    pub conservative: bool,
    pub cooldown_remaining_ms: Option<u64>,
    pub stats: BurstStats,
}

/// Grants and tracks bursts for one upstream
#[derive(Debug)]
pub struct BurstCoordinator {
    config: BurstConfig,
    active: Option<ActiveBurst>,
    last_ended: Option<Instant>,
    conservative: bool,
    stats: BurstStats,
}

impl BurstCoordinator {
    pub fn new(config: BurstConfig) -> Self {
        Self {
            config,
            active: None,
            last_ended: None,
            conservative: false,
            stats: BurstStats::default(),
        }
    }

    /// Decide whether a burst may start given the current window load
    pub fn can_burst(&mut self, current_load: u32, limit: u32) -> BurstDecision {
        self.check_timeout();

        if self.active.is_some() {
            return BurstDecision::refuse("burst already active");
        }
        if self.conservative {
            return BurstDecision::refuse("conservative mode");
        }
        if let Some(remaining) = self.cooldown_remaining() {
            return BurstDecision::refuse(format!("cooling down for {}ms", remaining.as_millis()));
        }

        let remaining_capacity = limit.saturating_sub(current_load);
        let size = self
            .config
            .max_burst_size
            .min((remaining_capacity as f64 * self.config.capacity_fraction).floor() as u32);

        if size < self.config.min_burst_size {
            return BurstDecision::refuse(format!(
                "burst of {} below minimum {}",
                size, self.config.min_burst_size
            ));
        }

        BurstDecision {
            allowed: true,
            size,
            reason: format!("{} of {} requests free", remaining_capacity, limit),
        }
    }

    /// Start a burst. Returns false if one is already running.
    pub fn start(&mut self, size: u32) -> bool {
        self.check_timeout();
        if self.active.is_some() {
            return false;
        }

        self.active = Some(ActiveBurst {
            started: Instant::now(),
            size,
            used: 0,
            successes: 0,
            failures: 0,
        });
        self.stats.started += 1;
        info!(size, "Burst started");
        true
    }

    /// End the running burst, if any
    pub fn end(&mut self, reason: BurstEndReason) {
        let Some(burst) = self.active.take() else {
            return;
        };
        self.last_ended = Some(Instant::now());

        match reason {
            BurstEndReason::Timeout => self.stats.ended_timeout += 1,
            BurstEndReason::Completed => self.stats.ended_completed += 1,
            BurstEndReason::RateLimited => {
                self.stats.ended_rate_limited += 1;
                self.conservative = true;
            }
        }

        if reason == BurstEndReason::RateLimited {
            warn!(
                used = burst.used,
                size = burst.size,
                "Burst stopped by rate limit, entering conservative mode"
            );
        } else {
            info!(
                reason = %reason,
                used = burst.used,
                successes = burst.successes,
                failures = burst.failures,
                "Burst ended"
            );
        }
    }

    /// Claim one request from the running burst's budget
    pub fn take_slot(&mut self) -> bool {
        self.check_timeout();
        match self.active.as_mut() {
            Some(burst) if burst.used < burst.size => {
                burst.used += 1;
                true
            }
            _ => false,
        }
    }

    /// Record an outcome that happened while a burst was running
    pub fn record_during_burst(&mut self, success: bool, rate_limit_hit: bool) {
        let Some(burst) = self.active.as_mut() else {
            return;
        };

        if rate_limit_hit {
            self.end(BurstEndReason::RateLimited);
            return;
        }

        if success {
            burst.successes += 1;
        } else {
            burst.failures += 1;
        }
        debug!(successes = burst.successes, failures = burst.failures, "Burst outcome");

        if burst.successes + burst.failures >= burst.size {
            self.end(BurstEndReason::Completed);
        }
    }

    /// End the burst if its window has elapsed. Returns true if one is running.
    pub fn check_timeout(&mut self) -> bool {
        let expired = self
            .active
            .as_ref()
            .is_some_and(|b| b.started.elapsed() >= self.config.window);
        if expired {
            self.end(BurstEndReason::Timeout);
        }
        self.active.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|b| b.started.elapsed() < self.config.window)
    }

    /// Check if the running burst still has unclaimed slots
    pub fn has_budget(&self) -> bool {
        self.is_active() && self.active.as_ref().is_some_and(|b| b.used < b.size)
    }

    /// Unclaimed slots in the running burst
    pub fn remaining_budget(&self) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.active
            .as_ref()
            .map(|b| b.size.saturating_sub(b.used))
            .unwrap_or(0)
    }

    pub fn is_conservative(&self) -> bool {
        self.conservative
    }

    pub fn set_conservative(&mut self, conservative: bool) {
        if self.conservative != conservative {
            info!(conservative, "Burst conservative mode changed");
        }
        self.conservative = conservative;
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let ended = self.last_ended?;
        let elapsed = ended.elapsed();
        (elapsed < self.config.cooldown).then(|| self.config.cooldown - elapsed)
    }

    pub fn stats(&self) -> &BurstStats {
        &self.stats
    }

    pub fn snapshot(&self) -> BurstSnapshot {
        let active = self.is_active();
        let (size, used) = match &self.active {
            Some(b) if active => (b.size, b.used),
            _ => (0, 0),
        };
        BurstSnapshot {
            active,
            size,
            used,
            conservative: self.conservative,
            cooldown_remaining_ms: self.cooldown_remaining().map(|d| d.as_millis() as u64),
            stats: self.stats.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> BurstCoordinator {
        BurstCoordinator::new(BurstConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_from_remaining_capacity() {
        let mut burst = coordinator();

        let decision = burst.can_burst(40, 60);
        assert!(decision.allowed);
        assert_eq!(decision.size, 10);

        let decision = burst.can_burst(50, 60);
        assert!(decision.allowed);
        assert_eq!(decision.size, 5);

        // floor(5 * 0.5) = 2 is not worth it
        let decision = burst.can_burst(55, 60);
        assert!(!decision.allowed);
        assert_eq!(decision.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_while_active_and_during_cooldown() {
        let mut burst = coordinator();
        assert!(burst.start(5));
        assert!(!burst.start(5));
        assert_eq!(burst.can_burst(0, 100).reason, "burst already active");

        burst.end(BurstEndReason::Completed);
        assert!(!burst.can_burst(0, 100).allowed);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(burst.can_burst(0, 100).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hit_is_hard_stop() {
        let mut burst = coordinator();
        burst.start(8);
        assert!(burst.take_slot());
        burst.record_during_burst(true, false);
        burst.record_during_burst(false, true);

        assert!(!burst.is_active());
        assert!(burst.is_conservative());
        assert_eq!(burst.stats().ended_rate_limited, 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(burst.can_burst(0, 100).reason, "conservative mode");

        burst.set_conservative(false);
        assert!(burst.can_burst(0, 100).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_times_out() {
        let mut burst = coordinator();
        burst.start(10);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(!burst.is_active());
        assert!(!burst.take_slot());
        assert_eq!(burst.stats().ended_timeout, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_completes_burst() {
        let mut burst = coordinator();
        burst.start(3);
        for _ in 0..3 {
            assert!(burst.take_slot());
        }
        assert!(!burst.take_slot());
        assert!(!burst.has_budget());

        for _ in 0..3 {
            burst.record_during_burst(true, false);
        }
        assert!(!burst.is_active());
        assert_eq!(burst.stats().ended_completed, 1);
        assert!(!burst.is_conservative());
    }
}
