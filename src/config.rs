/*!
 * Configuration types for Pacekeeper
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analytics::AnalyticsConfig;
use crate::error::{GovernorError, Result};
use crate::orchestrator::OptimizerConfig;
use crate::pool::PoolConfig;
use pacekeeper_core_resilience::{
    BurstConfig, CircuitBreakerConfig, DelayPlannerConfig, RateLimitConfig, RetryPolicy,
};

/// Main configuration for one governor instance (one upstream)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Rate windows, delay bounds and limit learning
    #[serde(default)]
    pub rate: RateSection,

    /// Burst behavior
    #[serde(default)]
    pub burst: BurstSection,

    /// Delay planner weights and learning
    #[serde(default)]
    pub planner: PlannerSection,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub breaker: BreakerSection,

    /// Per-request retry policy
    #[serde(default)]
    pub retry: RetrySection,

    /// Worker pool and concurrency adaptation
    #[serde(default)]
    pub pool: PoolSection,

    /// Aggregation and recommendations
    #[serde(default)]
    pub analytics: AnalyticsSection,

    /// Background optimizer and plan heuristics
    #[serde(default)]
    pub optimizer: OptimizerSection,

    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSection {
    /// Per-minute limit used until one is learned
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Per-hour limit used until one is learned
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of a learned limit actually used
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,

    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Window in which repeated 429s combine into a limit estimate
    #[serde(default = "default_hit_learning_window_secs")]
    pub hit_learning_window_secs: u64,
}

impl Default for RateSection {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            min_delay_ms: default_min_delay_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            safety_margin: default_safety_margin(),
            retention_secs: default_retention_secs(),
            max_records: default_max_records(),
            hit_learning_window_secs: default_hit_learning_window_secs(),
        }
    }
}

impl RateSection {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.requests_per_minute,
            requests_per_hour: self.requests_per_hour,
            min_delay: Duration::from_millis(self.min_delay_ms),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            safety_margin: self.safety_margin,
            retention: Duration::from_secs(self.retention_secs),
            max_records: self.max_records,
            hit_learning_window: Duration::from_secs(self.hit_learning_window_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurstSection {
    /// Allow bursts at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_burst_size")]
    pub max_burst_size: u32,

    #[serde(default = "default_min_burst_size")]
    pub min_burst_size: u32,

    #[serde(default = "default_burst_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_burst_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Share of remaining window capacity a burst may take
    #[serde(default = "default_capacity_fraction")]
    pub capacity_fraction: f64,
}

impl Default for BurstSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_burst_size: default_max_burst_size(),
            min_burst_size: default_min_burst_size(),
            window_ms: default_burst_window_ms(),
            cooldown_ms: default_burst_cooldown_ms(),
            capacity_fraction: default_capacity_fraction(),
        }
    }
}

impl BurstSection {
    pub fn to_config(&self) -> BurstConfig {
        BurstConfig {
            max_burst_size: self.max_burst_size,
            min_burst_size: self.min_burst_size,
            window: Duration::from_millis(self.window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            capacity_fraction: self.capacity_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,

    #[serde(default = "default_rate_limit_weight")]
    pub rate_limit_weight: f64,

    #[serde(default = "default_context_weight")]
    pub context_weight: f64,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_max_adaptive_multiplier")]
    pub max_adaptive_multiplier: f64,

    #[serde(default = "default_fast_latency_ms")]
    pub fast_latency_ms: u64,

    #[serde(default = "default_slow_latency_ms")]
    pub slow_latency_ms: u64,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            performance_weight: default_performance_weight(),
            rate_limit_weight: default_rate_limit_weight(),
            context_weight: default_context_weight(),
            learning_rate: default_learning_rate(),
            max_adaptive_multiplier: default_max_adaptive_multiplier(),
            fast_latency_ms: default_fast_latency_ms(),
            slow_latency_ms: default_slow_latency_ms(),
        }
    }
}

impl PlannerSection {
    /// Planner configuration; delay bounds come from the rate section
    pub fn to_config(&self, rate: &RateSection) -> DelayPlannerConfig {
        DelayPlannerConfig {
            min_delay: Duration::from_millis(rate.min_delay_ms),
            base_delay: Duration::from_millis(rate.base_delay_ms),
            max_delay: Duration::from_millis(rate.max_delay_ms),
            performance_weight: self.performance_weight,
            rate_limit_weight: self.rate_limit_weight,
            context_weight: self.context_weight,
            learning_rate: self.learning_rate,
            min_multiplier: 0.5,
            max_multiplier: self.max_adaptive_multiplier,
            fast_latency: Duration::from_millis(self.fast_latency_ms),
            slow_latency: Duration::from_millis(self.slow_latency_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Consecutive half-open successes that close it again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: usize,

    /// Time the circuit stays open before a probe
    #[serde(default = "default_recovery_time_ms")]
    pub recovery_time_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_time_ms: default_recovery_time_ms(),
        }
    }
}

impl BreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            cooldown: Duration::from_millis(self.recovery_time_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Wait after a 429 that carries no retry-after
    #[serde(default = "default_rate_limit_floor_ms")]
    pub rate_limit_floor_ms: u64,

    #[serde(default = "default_hit_learning_window_secs")]
    pub learning_window_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            rate_limit_floor_ms: default_rate_limit_floor_ms(),
            learning_window_secs: default_hit_learning_window_secs(),
        }
    }
}

impl RetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            rate_limit_floor: Duration::from_millis(self.rate_limit_floor_ms),
            learning_window: Duration::from_secs(self.learning_window_secs),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_initial_concurrency")]
    pub initial_concurrency: usize,

    /// Attempts per item across requeues
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Sleep between polls of a saturated pool or an empty queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_adaptation_interval_ms")]
    pub adaptation_interval_ms: u64,

    /// Multiplier applied when backing concurrency off
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Multiplier applied when concurrency recovers
    #[serde(default = "default_recovery_factor")]
    pub recovery_factor: f64,

    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Error rate above which concurrency backs off
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            initial_concurrency: default_initial_concurrency(),
            max_attempts: default_max_attempts(),
            queue_timeout_ms: default_queue_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            adaptation_interval_ms: default_adaptation_interval_ms(),
            backoff_factor: default_backoff_factor(),
            recovery_factor: default_recovery_factor(),
            latency_threshold_ms: default_latency_threshold_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl PoolSection {
    pub fn to_config(&self) -> PoolConfig {
        PoolConfig {
            min_concurrency: self.min_concurrency,
            max_concurrency: self.max_concurrency,
            initial_concurrency: self.initial_concurrency,
            max_attempts: self.max_attempts,
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            adaptation_interval: Duration::from_millis(self.adaptation_interval_ms),
            backoff_factor: self.backoff_factor,
            recovery_factor: self.recovery_factor,
            latency_threshold: Duration::from_millis(self.latency_threshold_ms),
            error_rate_threshold: self.error_rate_threshold,
            dead_letter_capacity: self.dead_letter_capacity,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSection {
    #[serde(default = "default_aggregation_interval_ms")]
    pub aggregation_interval_ms: u64,

    #[serde(default = "default_recommendation_interval_ms")]
    pub recommendation_interval_ms: u64,

    /// History considered for recommendations
    #[serde(default = "default_analytics_learning_window_secs")]
    pub learning_window_secs: u64,

    /// Maximum age of a closed window
    #[serde(default = "default_analytics_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_alert_ttl_ms")]
    pub alert_ttl_ms: u64,

    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
}

impl Default for AnalyticsSection {
    fn default() -> Self {
        Self {
            aggregation_interval_ms: default_aggregation_interval_ms(),
            recommendation_interval_ms: default_recommendation_interval_ms(),
            learning_window_secs: default_analytics_learning_window_secs(),
            retention_secs: default_analytics_retention_secs(),
            alert_ttl_ms: default_alert_ttl_ms(),
            latency_threshold_ms: default_latency_threshold_ms(),
        }
    }
}

impl AnalyticsSection {
    /// Analytics configuration; the confidence filter comes from the optimizer
    pub fn to_config(&self, optimizer: &OptimizerSection) -> AnalyticsConfig {
        AnalyticsConfig {
            aggregation_interval: Duration::from_millis(self.aggregation_interval_ms),
            recommendation_interval: Duration::from_millis(self.recommendation_interval_ms),
            learning_window: Duration::from_secs(self.learning_window_secs),
            retention: Duration::from_secs(self.retention_secs),
            alert_ttl: Duration::from_millis(self.alert_ttl_ms),
            latency_threshold: Duration::from_millis(self.latency_threshold_ms),
            confidence_threshold: optimizer.confidence_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_optimizer_interval_ms")]
    pub interval_ms: u64,

    /// Recommendations below this confidence are ignored
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Re-plans after a blocked plan before executing anyway
    #[serde(default = "default_max_plan_rounds")]
    pub max_plan_rounds: u32,

    /// Recent success rate required before bursting
    #[serde(default = "default_burst_min_success_rate")]
    pub burst_min_success_rate: f64,

    /// Recent latency ceiling for bursting
    #[serde(default = "default_burst_max_latency_ms")]
    pub burst_max_latency_ms: u64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            interval_ms: default_optimizer_interval_ms(),
            confidence_threshold: default_confidence_threshold(),
            max_plan_rounds: default_max_plan_rounds(),
            burst_min_success_rate: default_burst_min_success_rate(),
            burst_max_latency_ms: default_burst_max_latency_ms(),
        }
    }
}

impl OptimizerSection {
    pub fn to_config(&self, burst_enabled: bool) -> OptimizerConfig {
        OptimizerConfig {
            interval: Duration::from_millis(self.interval_ms),
            confidence_threshold: self.confidence_threshold,
            max_plan_rounds: self.max_plan_rounds,
            burst_enabled,
            burst_min_success_rate: self.burst_min_success_rate,
            burst_max_latency: Duration::from_millis(self.burst_max_latency_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Logging level
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_requests_per_hour() -> u32 {
    1000
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_safety_margin() -> f64 {
    0.8
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_records() -> usize {
    10_000
}

fn default_hit_learning_window_secs() -> u64 {
    300
}

fn default_max_burst_size() -> u32 {
    10
}

fn default_min_burst_size() -> u32 {
    3
}

fn default_burst_window_ms() -> u64 {
    10_000
}

fn default_burst_cooldown_ms() -> u64 {
    30_000
}

fn default_capacity_fraction() -> f64 {
    0.5
}

fn default_performance_weight() -> f64 {
    0.4
}

fn default_rate_limit_weight() -> f64 {
    0.4
}

fn default_context_weight() -> f64 {
    0.2
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_max_adaptive_multiplier() -> f64 {
    3.0
}

fn default_fast_latency_ms() -> u64 {
    500
}

fn default_slow_latency_ms() -> u64 {
    3000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_success_threshold() -> usize {
    2
}

fn default_recovery_time_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_rate_limit_floor_ms() -> u64 {
    1000
}

fn default_min_concurrency() -> usize {
    1
}

fn default_max_concurrency() -> usize {
    10
}

fn default_initial_concurrency() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_queue_timeout_ms() -> u64 {
    300_000 // 5 min
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_adaptation_interval_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    0.6
}

fn default_recovery_factor() -> f64 {
    1.2
}

fn default_latency_threshold_ms() -> u64 {
    5000
}

fn default_error_rate_threshold() -> f64 {
    0.2
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_aggregation_interval_ms() -> u64 {
    60_000
}

fn default_recommendation_interval_ms() -> u64 {
    300_000
}

fn default_analytics_learning_window_secs() -> u64 {
    1800
}

fn default_analytics_retention_secs() -> u64 {
    86_400
}

fn default_alert_ttl_ms() -> u64 {
    300_000
}

fn default_optimizer_interval_ms() -> u64 {
    60_000
}

fn default_confidence_threshold() -> f64 {
    0.75
}

fn default_max_plan_rounds() -> u32 {
    5
}

fn default_burst_min_success_rate() -> f64 {
    0.9
}

fn default_burst_max_latency_ms() -> u64 {
    2000
}

impl GovernorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GovernorConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the configuration for values the governor cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let rate = &self.rate;
        if rate.requests_per_minute == 0 || rate.requests_per_hour == 0 {
            problems.push("rate limits must be positive".to_string());
        }
        if !(rate.min_delay_ms <= rate.base_delay_ms && rate.base_delay_ms <= rate.max_delay_ms) {
            problems.push(format!(
                "rate delays must satisfy min <= base <= max (got {} / {} / {})",
                rate.min_delay_ms, rate.base_delay_ms, rate.max_delay_ms
            ));
        }
        if !(rate.safety_margin > 0.0 && rate.safety_margin <= 1.0) {
            problems.push(format!("rate.safety_margin must be in (0, 1], got {}", rate.safety_margin));
        }

        let burst = &self.burst;
        if burst.min_burst_size > burst.max_burst_size {
            problems.push("burst.min_burst_size exceeds burst.max_burst_size".to_string());
        }
        if !(burst.capacity_fraction > 0.0 && burst.capacity_fraction <= 1.0) {
            problems.push("burst.capacity_fraction must be in (0, 1]".to_string());
        }

        let planner = &self.planner;
        let weights = planner.performance_weight + planner.rate_limit_weight + planner.context_weight;
        if (weights - 1.0).abs() > 1e-6 {
            problems.push(format!("planner weights must sum to 1, got {:.3}", weights));
        }
        if !(planner.learning_rate > 0.0 && planner.learning_rate < 1.0) {
            problems.push("planner.learning_rate must be in (0, 1)".to_string());
        }
        if planner.max_adaptive_multiplier < 1.0 {
            problems.push("planner.max_adaptive_multiplier must be at least 1".to_string());
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            problems.push("breaker thresholds must be positive".to_string());
        }

        let retry = &self.retry;
        if retry.backoff_multiplier < 1.0 {
            problems.push("retry.backoff_multiplier must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            problems.push("retry.jitter_factor must be in [0, 1]".to_string());
        }

        let pool = &self.pool;
        if pool.min_concurrency == 0
            || pool.min_concurrency > pool.initial_concurrency
            || pool.initial_concurrency > pool.max_concurrency
        {
            problems.push(format!(
                "pool concurrency must satisfy 1 <= min <= initial <= max (got {} / {} / {})",
                pool.min_concurrency, pool.initial_concurrency, pool.max_concurrency
            ));
        }
        if pool.max_attempts == 0 {
            problems.push("pool.max_attempts must be positive".to_string());
        }
        if pool.poll_interval_ms == 0 {
            problems.push("pool.poll_interval_ms must be nonzero".to_string());
        }
        if !(pool.backoff_factor > 0.0 && pool.backoff_factor < 1.0) {
            problems.push("pool.backoff_factor must be in (0, 1)".to_string());
        }
        if pool.recovery_factor <= 1.0 {
            problems.push("pool.recovery_factor must exceed 1".to_string());
        }

        if self.analytics.aggregation_interval_ms == 0
            || self.analytics.recommendation_interval_ms == 0
            || self.optimizer.interval_ms == 0
        {
            problems.push("background intervals must be nonzero".to_string());
        }
        if !(0.0..=1.0).contains(&self.optimizer.confidence_threshold) {
            problems.push("optimizer.confidence_threshold must be in [0, 1]".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GovernorError::Config(problems.join("; ")))
        }
    }

    /// Create a configuration for fragile or undocumented upstreams
    pub fn conservative_preset() -> Self {
        Self {
            rate: RateSection {
                requests_per_minute: 30,
                requests_per_hour: 500,
                base_delay_ms: 2000,
                safety_margin: 0.6,
                ..Default::default()
            },
            burst: BurstSection {
                enabled: false,
                ..Default::default()
            },
            breaker: BreakerSection {
                failure_threshold: 3,
                recovery_time_ms: 120_000,
                ..Default::default()
            },
            retry: RetrySection {
                max_retries: 5,
                base_delay_ms: 2000,
                ..Default::default()
            },
            pool: PoolSection {
                min_concurrency: 1,
                initial_concurrency: 1,
                max_concurrency: 3,
                ..Default::default()
            },
            optimizer: OptimizerSection {
                confidence_threshold: 0.8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration for well-provisioned upstreams
    pub fn aggressive_preset() -> Self {
        Self {
            rate: RateSection {
                requests_per_minute: 120,
                requests_per_hour: 5000,
                min_delay_ms: 50,
                base_delay_ms: 250,
                max_delay_ms: 15_000,
                safety_margin: 0.9,
                ..Default::default()
            },
            burst: BurstSection {
                max_burst_size: 20,
                cooldown_ms: 15_000,
                ..Default::default()
            },
            retry: RetrySection {
                base_delay_ms: 500,
                max_delay_ms: 15_000,
                ..Default::default()
            },
            pool: PoolSection {
                min_concurrency: 2,
                initial_concurrency: 5,
                max_concurrency: 20,
                ..Default::default()
            },
            optimizer: OptimizerSection {
                confidence_threshold: 0.7,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        assert_eq!(config.rate.requests_per_minute, 60);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.pool.max_concurrency, 10);
        assert_eq!(config.optimizer.max_plan_rounds, 5);
        assert!(config.burst.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let conservative = GovernorConfig::conservative_preset();
        assert!(conservative.validate().is_ok());
        assert!(!conservative.burst.enabled);
        assert_eq!(conservative.pool.max_concurrency, 3);

        let aggressive = GovernorConfig::aggressive_preset();
        assert!(aggressive.validate().is_ok());
        assert!(aggressive.pool.max_concurrency > conservative.pool.max_concurrency);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: GovernorConfig = toml::from_str(
            r#"
            [rate]
            requests_per_minute = 20

            [pool]
            max_concurrency = 4
            queue_timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.rate.requests_per_minute, 20);
        assert_eq!(config.rate.requests_per_hour, 1000);
        assert_eq!(config.pool.max_concurrency, 4);
        assert_eq!(config.pool.to_config().queue_timeout, Duration::from_secs(5));
        assert_eq!(config.breaker, BreakerSection::default());
    }

    #[test]
    fn test_file_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let config = GovernorConfig::aggressive_preset();

        config.to_file(file.path()).unwrap();
        let loaded = GovernorConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let mut config = GovernorConfig::default();
        config.planner.context_weight = 0.5;
        config.pool.min_concurrency = 8;
        config.pool.initial_concurrency = 2;
        config.pool.poll_interval_ms = 0;

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("weights must sum to 1"));
        assert!(message.contains("pool concurrency"));
        assert!(message.contains("poll_interval_ms"));
        assert_eq!(err.exit_code(), crate::error::EXIT_FATAL);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[rate]\nrequests_per_minute = \"many\"").unwrap();
        let err = GovernorConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, GovernorError::Config(_)));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
