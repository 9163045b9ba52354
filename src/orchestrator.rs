/*!
 * The governor: plan, execute and learn for every request
 *
 * One [`Governor`] owns every piece of learning state for one upstream. Each
 * request is planned from the circuit breaker, the rate windows, the burst
 * coordinator and the delay planner, executed through the retry wrapper,
 * and its outcome fed back into all of them. Background tasks aggregate
 * analytics and apply confident recommendations while the governor lives.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analytics::{
    Analytics, AnalyticsSummary, PerformanceReport, Recommendation, SuggestedAction,
};
use crate::config::GovernorConfig;
use crate::error::{GovernorError, Result};
use crate::pool::{BatchReport, ConcurrencySnapshot, ConcurrencyController, ConcurrentProcessor, ItemHandler, TaskReport};
use crate::work::{ResponseMeta, Work, WorkItem};
use pacekeeper_core_resilience::{
    BurstCoordinator, BurstSnapshot, CircuitBreaker, CircuitPhase, CircuitSnapshot, DelayContext,
    DelayPlanner, DetectedLimits, ErrorKind, ErrorRecovery, RateState, RateWindowCounts,
    Recovered, RecoveryStats, RequestRecord, ResponseFeedback, SendSlot, UpstreamError,
};

/// Records needed before burst heuristics trust the recent history
const MIN_BURST_HISTORY: usize = 5;

/// Optimizer and planning knobs
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub interval: Duration,
    /// Recommendations below this confidence are never applied
    pub confidence_threshold: f64,
    /// Plans made per request before executing regardless
    pub max_plan_rounds: u32,
    pub burst_enabled: bool,
    pub burst_min_success_rate: f64,
    pub burst_max_latency: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            confidence_threshold: 0.75,
            max_plan_rounds: 5,
            burst_enabled: true,
            burst_min_success_rate: 0.9,
            burst_max_latency: Duration::from_secs(2),
        }
    }
}

/// How a request will be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    Normal,
    Burst { size: u32 },
    RateLimited,
    CircuitOpen,
}

impl Strategy {
    /// Whether the request may go out once the delay has passed
    pub fn is_executable(&self) -> bool {
        matches!(self, Strategy::Normal | Strategy::Burst { .. })
    }
}

/// The decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub strategy: Strategy,
    pub delay: Duration,
    pub reason: String,
}

/// Caller-side context for one request
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub is_retry: bool,
    /// Batch progress in [0, 1]
    pub progress: f64,
}

/// Progress of the batch currently running
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchProgress {
    pub running: bool,
    pub total: usize,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed_dispatches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerStatus {
    pub base_delay_ms: u64,
    pub adaptive_multiplier: f64,
    pub recent_success_rate: f64,
}

/// Serializable snapshot of everything the governor knows
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub circuit: CircuitSnapshot,
    pub concurrency: ConcurrencySnapshot,
    pub recent_success_rate: f64,
    pub recent_avg_latency_ms: u64,
    pub rate_windows: RateWindowCounts,
    pub effective_per_minute: u32,
    pub effective_per_hour: u32,
    pub blocked_for_ms: Option<u64>,
    pub detected_limits: DetectedLimits,
    pub planner: PlannerStatus,
    pub burst: BurstSnapshot,
    pub recovery: RecoveryStats,
    pub analytics: AnalyticsSummary,
    pub recommendations: Vec<Recommendation>,
    pub report: Option<PerformanceReport>,
    pub progress: BatchProgress,
    pub optimizer_runs: u64,
}

struct Inner {
    optimizer: OptimizerConfig,
    rate: Mutex<RateState>,
    burst: Mutex<BurstCoordinator>,
    planner: Mutex<DelayPlanner>,
    analytics: Mutex<Analytics>,
    recovery: ErrorRecovery,
    controller: Arc<ConcurrencyController>,
    pool: ConcurrentProcessor,
    consecutive_failures: AtomicU32,
    progress: Mutex<BatchProgress>,
    optimizer_runs: AtomicU64,
    applied_generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adaptive governor for one upstream
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Example
/// ```no_run
/// use pacekeeper::config::GovernorConfig;
/// use pacekeeper::orchestrator::{Governor, RequestContext};
/// use pacekeeper::work::{work_fn, ResponseMeta, WorkSuccess, WorkFailure};
///
/// # async fn demo() -> pacekeeper::error::Result<()> {
/// let governor = Governor::new(GovernorConfig::default())?;
/// governor.start();
///
/// let lookup = work_fn(|serial: &String| {
///     let serial = serial.clone();
///     async move {
///         Ok::<_, WorkFailure>(WorkSuccess::new(serial.len(), ResponseMeta::default()))
///     }
/// });
/// let report = governor
///     .execute_request(&lookup, &"SN-1".to_string(), RequestContext::default())
///     .await;
/// println!("{:?}", report.result);
///
/// governor.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    /// Build a governor from a validated configuration
    pub fn new(config: GovernorConfig) -> Result<Self> {
        config.validate()?;

        let optimizer = config.optimizer.to_config(config.burst.enabled);
        let breaker = CircuitBreaker::new(config.breaker.to_config());
        let controller = Arc::new(ConcurrencyController::new(config.pool.to_config()));

        let inner = Inner {
            optimizer,
            rate: Mutex::new(RateState::new(config.rate.to_config())),
            burst: Mutex::new(BurstCoordinator::new(config.burst.to_config())),
            planner: Mutex::new(DelayPlanner::new(config.planner.to_config(&config.rate))),
            analytics: Mutex::new(Analytics::new(config.analytics.to_config(&config.optimizer))),
            recovery: ErrorRecovery::new(config.retry.to_policy(), breaker),
            pool: ConcurrentProcessor::new(controller.clone()),
            controller,
            consecutive_failures: AtomicU32::new(0),
            progress: Mutex::new(BatchProgress::default()),
            optimizer_runs: AtomicU64::new(0),
            applied_generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.inner.controller
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.inner.recovery.breaker()
    }

    /// Decide strategy and delay for the next request
    pub async fn plan(&self, ctx: &RequestContext) -> RequestPlan {
        let breaker = self.inner.recovery.breaker();
        if let Some(retry_in) = breaker.remaining_cooldown().await {
            return RequestPlan {
                strategy: Strategy::CircuitOpen,
                delay: retry_in,
                reason: format!("circuit open, probe in {}ms", retry_in.as_millis()),
            };
        }
        let phase = breaker.get_state().await.phase();

        let inner = &self.inner;
        let mut burst = lock(&inner.burst);
        burst.check_timeout();
        let burst_running = burst.is_active() && burst.has_budget();

        let rate = lock(&inner.rate);
        if !rate.can_proceed(burst_running) {
            let blocked = rate.blocked_for().unwrap_or_default();
            let delay = rate.optimal_delay().max(blocked);
            return RequestPlan {
                strategy: Strategy::RateLimited,
                delay,
                reason: if blocked.is_zero() {
                    "rate window full".to_string()
                } else {
                    format!("blocked by upstream for {}ms", blocked.as_millis())
                },
            };
        }

        let mut delay_ctx = DelayContext {
            is_burst: false,
            is_retry: ctx.is_retry,
            consecutive_failures: inner.consecutive_failures.load(Ordering::SeqCst),
            progress: ctx.progress,
            usage_ratio: rate.usage_ratio(),
        };
        let planner = lock(&inner.planner);

        if burst_running {
            delay_ctx.is_burst = true;
            return RequestPlan {
                strategy: Strategy::Burst {
                    size: burst.remaining_budget(),
                },
                delay: planner.delay(&delay_ctx),
                reason: "burst in progress".to_string(),
            };
        }

        let healthy = rate.record_count() >= MIN_BURST_HISTORY
            && rate.recent_success_rate() > inner.optimizer.burst_min_success_rate
            && rate.recent_avg_latency() < inner.optimizer.burst_max_latency;
        if inner.optimizer.burst_enabled && !ctx.is_retry && phase == CircuitPhase::Closed && healthy {
            let load = rate.window_counts().last_minute as u32;
            let decision = burst.can_burst(load, rate.effective_per_minute());
            if decision.allowed {
                delay_ctx.is_burst = true;
                return RequestPlan {
                    strategy: Strategy::Burst {
                        size: decision.size,
                    },
                    delay: planner.delay(&delay_ctx),
                    reason: decision.reason,
                };
            }
        }

        RequestPlan {
            strategy: Strategy::Normal,
            delay: planner.delay(&delay_ctx),
            reason: "normal pacing".to_string(),
        }
    }

    /// Plan, wait, execute through the retry wrapper, and learn from the outcome.
    ///
    /// Circuit-open and rate-limited plans are waited out and re-planned up to
    /// the configured number of rounds. After the last round a rate-limited
    /// plan is still waited out; a circuit-open one is not, and the breaker
    /// rejects the call. Every attempt, retries included, takes a send slot
    /// from the rate windows before it goes out.
    pub async fn execute_request<I, T, W>(&self, work: &W, item: &I, ctx: RequestContext) -> TaskReport<T>
    where
        W: Work<I, T> + ?Sized,
        I: Sync,
        T: Send,
    {
        let max_rounds = self.inner.optimizer.max_plan_rounds.max(1);
        let mut rounds = 0;
        let plan = loop {
            let plan = self.plan(&ctx).await;
            rounds += 1;
            debug!(
                strategy = ?plan.strategy,
                delay_ms = plan.delay.as_millis() as u64,
                round = rounds,
                reason = %plan.reason,
                "Request planned"
            );

            let last_round = rounds >= max_rounds;
            if plan.strategy == Strategy::CircuitOpen && last_round {
                break plan;
            }
            if !plan.delay.is_zero() {
                sleep(plan.delay).await;
            }
            if plan.strategy.is_executable() || last_round {
                break plan;
            }
        };

        let in_burst = match plan.strategy {
            Strategy::Burst { size } => {
                let mut burst = lock(&self.inner.burst);
                if !burst.is_active() {
                    burst.start(size);
                }
                burst.take_slot()
            }
            _ => false,
        };

        let tally = AttemptTally::default();
        let delay_used = plan.delay;
        let (this, tally_ref) = (self, &tally);
        let outcome = self
            .inner
            .recovery
            .execute(move || this.attempt(work, item, delay_used, in_burst, tally_ref))
            .await;

        let latency = tally.latency();
        let rate_limited = tally.rate_limited.load(Ordering::SeqCst);
        match outcome {
            Ok(Recovered { value, attempts }) => TaskReport {
                result: Ok(value),
                attempts,
                latency,
                rate_limited,
            },
            Err(err) => {
                let attempts = err.attempts();
                TaskReport {
                    result: Err(GovernorError::from(err)),
                    attempts,
                    latency,
                    rate_limited,
                }
            }
        }
    }

    async fn attempt<I, T, W>(
        &self,
        work: &W,
        item: &I,
        delay_used: Duration,
        in_burst: bool,
        tally: &AttemptTally,
    ) -> std::result::Result<T, UpstreamError>
    where
        W: Work<I, T> + ?Sized,
        I: Sync,
        T: Send,
    {
        let slot = self.admit(in_burst).await;
        let started = Instant::now();
        let outcome = work.perform(item).await;
        let elapsed = started.elapsed();

        let latency_of = |meta: &ResponseMeta| {
            if meta.latency.is_zero() {
                elapsed
            } else {
                meta.latency
            }
        };

        match outcome {
            Ok(success) => {
                let latency = latency_of(&success.meta);
                tally.add(latency, false);
                self.learn(slot, &success.meta, None, latency, delay_used, in_burst);
                Ok(success.value)
            }
            Err(failure) => {
                let latency = latency_of(&failure.meta);
                let kind = failure.kind();
                tally.add(latency, kind == ErrorKind::RateLimit);
                self.learn(slot, &failure.meta, Some(kind), latency, delay_used, in_burst);
                Err(failure.to_upstream_error())
            }
        }
    }

    /// Wait for a free send slot in the rate windows
    async fn admit(&self, in_burst: bool) -> SendSlot {
        loop {
            let reserved = lock(&self.inner.rate).try_reserve(in_burst);
            match reserved {
                Ok(slot) => return slot,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Waiting for a send slot");
                    sleep(wait).await;
                }
            }
        }
    }

    /// Feed one attempt into rate state, planner, analytics and burst tracking
    fn learn(
        &self,
        slot: SendSlot,
        meta: &ResponseMeta,
        error: Option<ErrorKind>,
        latency: Duration,
        delay_used: Duration,
        in_burst: bool,
    ) {
        let inner = &self.inner;
        let success = error.is_none();
        let record = match error {
            None => RequestRecord::success(latency),
            Some(kind) => RequestRecord::failure(latency, kind),
        }
        .sent_at(slot.sent_at())
        .with_delay(delay_used)
        .with_concurrency(inner.controller.current())
        .in_burst(in_burst);
        let rate_limited = record.rate_limit_hit;

        {
            let mut rate = lock(&inner.rate);
            if let Some(headers) = &meta.rate_limit {
                rate.observe_headers(headers);
            }
            if rate_limited {
                rate.record_rate_limit_signal(meta.retry_after);
            }
            rate.complete(slot, record.clone());
        }

        lock(&inner.planner).record_response(ResponseFeedback {
            success,
            latency,
            rate_limited,
            delay_used,
        });
        lock(&inner.analytics).record(&record);

        if in_burst {
            lock(&inner.burst).record_during_burst(success, rate_limited);
        }

        if success {
            inner.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            inner.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Process a batch on the worker pool.
    ///
    /// Every item ends in the report's results, its expired list, or (after
    /// `cancel` fires) its unprocessed list.
    pub async fn process_items<I, T, W>(
        &self,
        items: Vec<WorkItem<I>>,
        work: Arc<W>,
        cancel: CancellationToken,
    ) -> BatchReport<I, T>
    where
        I: Send + Sync + 'static,
        T: Send + 'static,
        W: Work<I, T> + 'static,
    {
        *lock(&self.inner.progress) = BatchProgress {
            running: true,
            total: items.len(),
            ..Default::default()
        };

        let handler = Arc::new(GovernedWork {
            governor: self.clone(),
            work,
            _marker: PhantomData,
        });
        let report = self.inner.pool.process(items, handler, cancel).await;

        lock(&self.inner.progress).running = false;
        report
    }

    fn progress_ratio(&self) -> f64 {
        let progress = lock(&self.inner.progress);
        if progress.total == 0 {
            0.0
        } else {
            (progress.dispatched as f64 / progress.total as f64).min(1.0)
        }
    }

    fn note_dispatch(&self, success: bool) {
        let mut progress = lock(&self.inner.progress);
        progress.dispatched += 1;
        if success {
            progress.succeeded += 1;
        } else {
            progress.failed_dispatches += 1;
        }
    }

    /// Spawn the aggregation, recommendation and optimizer tasks.
    ///
    /// Calling it again while they run does nothing.
    pub fn start(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if !tasks.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }

        let (aggregation, recommendation) = {
            let analytics = lock(&self.inner.analytics);
            (
                analytics.config().aggregation_interval,
                analytics.config().recommendation_interval,
            )
        };

        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.clone();
        tasks.push(tokio::spawn(ticker(weak.clone(), aggregation, cancel.clone(), "aggregation", |g| {
            g.aggregate_now();
        })));
        tasks.push(tokio::spawn(ticker(weak.clone(), recommendation, cancel.clone(), "recommendation", |g| {
            g.recommend_now();
        })));
        tasks.push(tokio::spawn(ticker(weak, self.inner.optimizer.interval, cancel, "optimizer", |g| {
            g.optimize_now();
        })));
        info!("Governor background tasks started");
    }

    /// Cancel the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *lock(&self.inner.tasks));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
        info!("Governor stopped");
    }

    /// Close the current analytics window
    pub fn aggregate_now(&self) -> bool {
        lock(&self.inner.analytics).aggregate().is_some()
    }

    /// Regenerate recommendations; returns those above the confidence threshold
    pub fn recommend_now(&self) -> Vec<Recommendation> {
        let mut analytics = lock(&self.inner.analytics);
        analytics.generate_recommendations();
        analytics.recommendations_above(self.inner.optimizer.confidence_threshold)
    }

    /// Apply confident recommendations not yet applied. Returns the actions taken.
    pub fn optimize_now(&self) -> Vec<SuggestedAction> {
        let inner = &self.inner;
        inner.optimizer_runs.fetch_add(1, Ordering::SeqCst);

        let (generation, recommendations) = {
            let analytics = lock(&inner.analytics);
            (
                analytics.generation(),
                analytics.recommendations_above(inner.optimizer.confidence_threshold),
            )
        };
        if inner.applied_generation.swap(generation, Ordering::SeqCst) == generation {
            return Vec::new();
        }

        let actions = merge_actions(&recommendations);
        for action in &actions {
            self.apply(*action);
        }
        if !actions.is_empty() {
            info!(generation, actions = actions.len(), "Applied tuning recommendations");
        }
        actions
    }

    fn apply(&self, action: SuggestedAction) {
        let inner = &self.inner;
        match action {
            SuggestedAction::IncreaseDelay { factor } | SuggestedAction::DecreaseDelay { factor } => {
                lock(&inner.rate).adjust_base_delay(factor);
                lock(&inner.planner).scale_base(factor);
            }
            SuggestedAction::ReduceConcurrency => {
                inner.controller.decrease("optimizer recommendation");
            }
            SuggestedAction::IncreaseConcurrency => {
                inner.controller.increase("optimizer recommendation");
            }
            SuggestedAction::EnterConservative => {
                warn!("Entering conservative burst mode");
                lock(&inner.burst).set_conservative(true);
            }
            SuggestedAction::LeaveConservative => {
                lock(&inner.burst).set_conservative(false);
            }
        }
    }

    /// Snapshot for dashboards and the CLI
    pub async fn status(&self) -> GovernorStatus {
        let inner = &self.inner;
        let circuit = inner.recovery.breaker().snapshot().await;

        let (recent_success_rate, recent_avg_latency_ms, rate_windows, per_minute, per_hour, blocked, detected_limits) = {
            let rate = lock(&inner.rate);
            (
                rate.recent_success_rate(),
                rate.recent_avg_latency().as_millis() as u64,
                rate.window_counts(),
                rate.effective_per_minute(),
                rate.effective_per_hour(),
                rate.blocked_for().map(|d| d.as_millis() as u64),
                rate.detected_limits().clone(),
            )
        };
        let planner = {
            let planner = lock(&inner.planner);
            PlannerStatus {
                base_delay_ms: planner.base().as_millis() as u64,
                adaptive_multiplier: planner.adaptive_multiplier(),
                recent_success_rate: planner.success_rate(),
            }
        };
        let (analytics, recommendations, report) = {
            let analytics = lock(&inner.analytics);
            (
                analytics.summary(),
                analytics.recommendations_above(inner.optimizer.confidence_threshold),
                analytics.report().cloned(),
            )
        };

        GovernorStatus {
            circuit,
            concurrency: inner.controller.snapshot(),
            recent_success_rate,
            recent_avg_latency_ms,
            rate_windows,
            effective_per_minute: per_minute,
            effective_per_hour: per_hour,
            blocked_for_ms: blocked,
            detected_limits,
            planner,
            burst: lock(&inner.burst).snapshot(),
            recovery: inner.recovery.stats(),
            analytics,
            recommendations,
            report,
            progress: lock(&inner.progress).clone(),
            optimizer_runs: inner.optimizer_runs.load(Ordering::SeqCst),
        }
    }
}

/// Collapse recommendations into at most one action per concern.
///
/// Delay increases win over decreases and take the largest factor; a
/// concurrency reduction wins over an increase; entering conservative mode
/// wins over leaving it.
fn merge_actions(recommendations: &[Recommendation]) -> Vec<SuggestedAction> {
    let mut increase: Option<f64> = None;
    let mut decrease: Option<f64> = None;
    let mut reduce = false;
    let mut grow = false;
    let mut enter = false;
    let mut leave = false;

    for action in recommendations.iter().flat_map(|r| r.suggested_actions.iter()) {
        match *action {
            SuggestedAction::IncreaseDelay { factor } => {
                increase = Some(increase.map_or(factor, |f| f.max(factor)));
            }
            SuggestedAction::DecreaseDelay { factor } => {
                decrease = Some(decrease.map_or(factor, |f| f.min(factor)));
            }
            SuggestedAction::ReduceConcurrency => reduce = true,
            SuggestedAction::IncreaseConcurrency => grow = true,
            SuggestedAction::EnterConservative => enter = true,
            SuggestedAction::LeaveConservative => leave = true,
        }
    }

    let mut actions = Vec::new();
    match (increase, decrease) {
        (Some(factor), _) => actions.push(SuggestedAction::IncreaseDelay { factor }),
        (None, Some(factor)) => actions.push(SuggestedAction::DecreaseDelay { factor }),
        (None, None) => {}
    }
    if reduce {
        actions.push(SuggestedAction::ReduceConcurrency);
    } else if grow {
        actions.push(SuggestedAction::IncreaseConcurrency);
    }
    if enter {
        actions.push(SuggestedAction::EnterConservative);
    } else if leave {
        actions.push(SuggestedAction::LeaveConservative);
    }
    actions
}

async fn ticker(
    inner: Weak<Inner>,
    period: Duration,
    cancel: CancellationToken,
    name: &'static str,
    tick: fn(&Governor),
) {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                tick(&Governor { inner });
            }
        }
    }
    debug!(task = name, "Background task stopped");
}

#[derive(Default)]
struct AttemptTally {
    latency_us: AtomicU64,
    rate_limited: AtomicBool,
}

impl AttemptTally {
    fn add(&self, latency: Duration, rate_limited: bool) {
        self.latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::SeqCst);
        if rate_limited {
            self.rate_limited.store(true, Ordering::SeqCst);
        }
    }

    fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::SeqCst))
    }
}

/// Runs each pool dispatch through the governor
struct GovernedWork<W, I, T> {
    governor: Governor,
    work: Arc<W>,
    _marker: PhantomData<fn(I) -> T>,
}

#[async_trait]
impl<W, I, T> ItemHandler<I, T> for GovernedWork<W, I, T>
where
    W: Work<I, T> + 'static,
    I: Send + Sync + 'static,
    T: Send + 'static,
{
    async fn handle(&self, item: &WorkItem<I>, attempt: u32) -> TaskReport<T> {
        let ctx = RequestContext {
            is_retry: attempt > 1,
            progress: self.governor.progress_ratio(),
        };
        let report = self
            .governor
            .execute_request(self.work.as_ref(), &item.payload, ctx)
            .await;
        self.governor.note_dispatch(report.result.is_ok());
        report
    }
}
