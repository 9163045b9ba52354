//! Weighted delay planning with online learning
//!
//! The planner blends three factors into one multiplier:
//! - performance, from trailing latency and success rate
//! - proximity to the rate limit, from the window usage ratio
//! - processing context (burst, retry, failure streak, near completion)
//!
//! The blended factor scales a learned base delay and an adaptive multiplier.
//! Both learned values move by one learning-rate step per response and are
//! clamped, so the planner settles instead of oscillating without bound.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Configuration for the delay planner
#[derive(Debug, Clone)]
pub struct DelayPlannerConfig {
    pub min_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub performance_weight: f64,
    pub rate_limit_weight: f64,
    pub context_weight: f64,
    /// Step size for base and multiplier adaptation
    pub learning_rate: f64,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
    /// Latency at or below which a response counts as fast
    pub fast_latency: Duration,
    /// Latency above which a response counts as slow
    pub slow_latency: Duration,
    /// Responses kept for the performance factor
    pub history_size: usize,
}

impl Default for DelayPlannerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            performance_weight: 0.4,
            rate_limit_weight: 0.4,
            context_weight: 0.2,
            learning_rate: 0.1,
            min_multiplier: 0.5,
            max_multiplier: 3.0,
            fast_latency: Duration::from_millis(500),
            slow_latency: Duration::from_secs(3),
            history_size: 50,
        }
    }
}

/// What the next request looks like
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayContext {
    pub is_burst: bool,
    pub is_retry: bool,
    pub consecutive_failures: u32,
    /// Share of the batch already done, 0-1
    pub progress: f64,
    /// Window usage against the rate limit, 0-1+
    pub usage_ratio: f64,
}

/// Outcome of one response, fed back into the planner
#[derive(Debug, Clone, Copy)]
pub struct ResponseFeedback {
    pub success: bool,
    pub latency: Duration,
    pub rate_limited: bool,
    /// Delay that preceded the request
    pub delay_used: Duration,
}

/// Factor breakdown of one planned delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayBreakdown {
    pub performance: f64,
    pub proximity: f64,
    pub context: f64,
    pub combined: f64,
    pub multiplier: f64,
    pub delay: Duration,
}

#[derive(Debug)]
pub struct DelayPlanner {
    config: DelayPlannerConfig,
    base: Duration,
    multiplier: f64,
    history: VecDeque<(bool, Duration)>,
}

impl DelayPlanner {
    pub fn new(config: DelayPlannerConfig) -> Self {
        let base = config.base_delay;
        Self {
            config,
            base,
            multiplier: 1.0,
            history: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DelayPlannerConfig {
        &self.config
    }

    /// Current learned base delay
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Current adaptive multiplier
    pub fn adaptive_multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Recommended delay for the next request
    pub fn delay(&self, ctx: &DelayContext) -> Duration {
        self.breakdown(ctx).delay
    }

    /// Recommended delay with its factor breakdown
    pub fn breakdown(&self, ctx: &DelayContext) -> DelayBreakdown {
        let performance = self.performance_factor();
        let proximity = proximity_factor(ctx.usage_ratio);
        let context = context_factor(ctx);

        let combined = self.config.performance_weight * performance
            + self.config.rate_limit_weight * proximity
            + self.config.context_weight * context;

        let raw = self.base.as_secs_f64() * combined * self.multiplier;
        let delay = self.clamp(Duration::from_secs_f64(raw.max(0.0)));

        DelayBreakdown {
            performance,
            proximity,
            context,
            combined,
            multiplier: self.multiplier,
            delay,
        }
    }

    /// Learn from a response
    pub fn record_response(&mut self, feedback: ResponseFeedback) {
        self.history.push_back((feedback.success, feedback.latency));
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }

        let step = self.config.learning_rate;
        let (base_factor, multiplier_factor) = if feedback.rate_limited {
            (1.0 + 2.0 * step, 1.0 + 2.0 * step)
        } else if !feedback.success {
            (1.0 + step, 1.0 + step)
        } else if feedback.latency <= self.config.fast_latency && feedback.delay_used >= self.base {
            // Fast answer after a generous wait: the wait was more than needed
            (1.0 - step, 1.0 - step / 2.0)
        } else {
            (1.0, 1.0)
        };

        if base_factor == 1.0 && multiplier_factor == 1.0 {
            return;
        }

        self.base = self.clamp(Duration::from_secs_f64(self.base.as_secs_f64() * base_factor));
        self.multiplier = (self.multiplier * multiplier_factor)
            .clamp(self.config.min_multiplier, self.config.max_multiplier);

        debug!(
            base_ms = self.base.as_millis() as u64,
            multiplier = self.multiplier,
            success = feedback.success,
            rate_limited = feedback.rate_limited,
            "Delay planner adapted"
        );
    }

    /// Scale the base delay, staying inside the delay bounds
    pub fn scale_base(&mut self, factor: f64) {
        let scaled = self.base.as_secs_f64() * factor.max(0.0);
        self.base = self.clamp(Duration::from_secs_f64(scaled));
    }

    /// Success rate over the history, 1.0 when empty
    pub fn success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        self.history.iter().filter(|(ok, _)| *ok).count() as f64 / self.history.len() as f64
    }

    pub fn average_latency(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        self.history.iter().map(|(_, l)| *l).sum::<Duration>() / self.history.len() as u32
    }

    fn performance_factor(&self) -> f64 {
        if self.history.is_empty() {
            return 1.0;
        }
        let success_rate = self.success_rate();
        let latency = self.average_latency();
        let fast = self.config.fast_latency;
        let slow = self.config.slow_latency;

        if success_rate >= 0.95 && latency <= fast {
            0.7
        } else if success_rate >= 0.9 && latency <= slow / 2 {
            0.8
        } else if success_rate < 0.7 || latency > slow.mul_f64(1.5) {
            1.5
        } else if success_rate < 0.85 || latency > slow {
            1.3
        } else {
            1.0
        }
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.max(self.config.min_delay).min(self.config.max_delay)
    }
}

fn proximity_factor(usage_ratio: f64) -> f64 {
    if usage_ratio > 0.95 {
        2.5
    } else if usage_ratio > 0.8 {
        1.5
    } else if usage_ratio < 0.3 {
        0.7
    } else {
        1.0
    }
}

fn context_factor(ctx: &DelayContext) -> f64 {
    let mut factor = 1.0;
    if ctx.is_burst {
        factor *= 0.3;
    }
    if ctx.is_retry {
        factor *= 1.4;
    }
    if ctx.consecutive_failures > 2 {
        factor *= 1.6;
    }
    if ctx.progress > 0.8 {
        factor *= 0.9;
    }
    factor
}
