/*!
 * Bounded worker pool with adaptive concurrency
 *
 * A fixed set of workers pull items from a shared queue. How many of them
 * may run at once is decided by the governor's [`ConcurrencyController`],
 * which a periodic adaptation tick moves up or down in discrete steps from
 * live success rate, latency and rate-limit signals. Workers that find the
 * ceiling met sleep for a bounded poll interval; lowering the ceiling never
 * interrupts a running item.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GovernorError;
use crate::work::{ItemResult, WorkItem};
use pacekeeper_core_resilience::{DeadLetterEntry, DeadLetterQueue, DeadLetterStats, FailureReason};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    /// Dispatches per item before a failure is final
    pub max_attempts: u32,
    /// Items waiting longer than this are dropped and reported as expired
    pub queue_timeout: Duration,
    /// Sleep between polls of a saturated pool or an empty queue
    pub poll_interval: Duration,
    pub adaptation_interval: Duration,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub latency_threshold: Duration,
    pub error_rate_threshold: f64,
    /// Live samples kept for adaptation
    pub sample_window: usize,
    /// Samples required before an adaptation tick acts
    pub min_samples: usize,
    pub dead_letter_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 10,
            initial_concurrency: 3,
            max_attempts: 3,
            queue_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(50),
            adaptation_interval: Duration::from_secs(30),
            backoff_factor: 0.6,
            recovery_factor: 1.2,
            latency_threshold: Duration::from_secs(5),
            error_rate_threshold: 0.2,
            sample_window: 100,
            min_samples: 5,
            dead_letter_capacity: 1000,
        }
    }
}

/// A change of the concurrency level
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyChange {
    pub from: usize,
    pub to: usize,
    pub reason: String,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencySnapshot {
    pub current: usize,
    pub min: usize,
    pub max: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency: Duration,
    rate_limited: bool,
}

/// Current concurrency level plus the live samples that move it
///
/// One controller belongs to one governor and is shared by every batch it
/// runs, so the ceiling applies across batches.
#[derive(Debug)]
pub struct ConcurrencyController {
    config: PoolConfig,
    current: AtomicUsize,
    in_flight: AtomicUsize,
    queue_depth: AtomicUsize,
    samples: Mutex<VecDeque<Sample>>,
}

impl ConcurrencyController {
    pub fn new(config: PoolConfig) -> Self {
        let min = config.min_concurrency.max(1);
        let max = config.max_concurrency.max(min);
        let initial = config.initial_concurrency.clamp(min, max);
        Self {
            config: PoolConfig {
                min_concurrency: min,
                max_concurrency: max,
                initial_concurrency: initial,
                ..config
            },
            current: AtomicUsize::new(initial),
            in_flight: AtomicUsize::new(0),
            queue_depth: AtomicUsize::new(0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            current: self.current(),
            min: self.config.min_concurrency,
            max: self.config.max_concurrency,
            in_flight: self.in_flight(),
            queue_depth: self.queue_depth(),
        }
    }

    /// Record a live outcome for the next adaptation tick
    pub fn record(&self, success: bool, latency: Duration, rate_limited: bool) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back(Sample {
            success,
            latency,
            rate_limited,
        });
        while samples.len() > self.config.sample_window.max(1) {
            samples.pop_front();
        }
    }

    /// Recompute the concurrency level from the samples since the last tick
    pub fn evaluate(&self) -> Option<ConcurrencyChange> {
        let samples: Vec<Sample> = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            if samples.len() < self.config.min_samples.max(1) {
                return None;
            }
            samples.drain(..).collect()
        };

        let n = samples.len() as f64;
        let rate_limited = samples.iter().filter(|s| s.rate_limited).count();
        let success_rate = samples.iter().filter(|s| s.success).count() as f64 / n;
        let avg_latency = samples.iter().map(|s| s.latency).sum::<Duration>() / samples.len() as u32;

        if rate_limited > 0 {
            self.decrease(format!("{} rate-limit hit(s)", rate_limited))
        } else if 1.0 - success_rate > self.config.error_rate_threshold {
            self.decrease(format!("error rate {:.0}%", (1.0 - success_rate) * 100.0))
        } else if success_rate > 0.95 && avg_latency < self.config.latency_threshold / 2 {
            self.increase(format!(
                "success rate {:.0}%, latency {}ms",
                success_rate * 100.0,
                avg_latency.as_millis()
            ))
        } else {
            None
        }
    }

    /// Back off by the backoff factor, at least one step
    pub fn decrease(&self, reason: impl Into<String>) -> Option<ConcurrencyChange> {
        let min = self.config.min_concurrency;
        let factor = self.config.backoff_factor;
        self.apply(reason.into(), |cur| {
            ((cur as f64 * factor).floor() as usize)
                .min(cur.saturating_sub(1))
                .max(min)
        })
    }

    /// Recover by the recovery factor, at least one step
    pub fn increase(&self, reason: impl Into<String>) -> Option<ConcurrencyChange> {
        let max = self.config.max_concurrency;
        let factor = self.config.recovery_factor;
        self.apply(reason.into(), |cur| {
            ((cur as f64 * factor).floor() as usize).max(cur + 1).min(max)
        })
    }

    fn apply(&self, reason: String, step: impl Fn(usize) -> usize) -> Option<ConcurrencyChange> {
        let from = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                let next = step(cur);
                (next != cur).then_some(next)
            })
            .ok()?;
        let to = self.current();
        info!(from, to, reason = %reason, "Concurrency adjusted");
        Some(ConcurrencyChange { from, to, reason })
    }

    /// Claim an execution slot if the ceiling allows it
    fn try_claim(&self) -> bool {
        let current = self.current();
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < current).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn add_queued(&self, n: usize) {
        self.queue_depth.fetch_add(n, Ordering::SeqCst);
    }

    fn remove_queued(&self, n: usize) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(n)));
    }
}

/// Outcome of one dispatch of an item
#[derive(Debug)]
pub struct TaskReport<T> {
    pub result: std::result::Result<T, GovernorError>,
    /// Upstream attempts made during this dispatch
    pub attempts: u32,
    pub latency: Duration,
    pub rate_limited: bool,
}

/// Runs one dispatch of an item
#[async_trait]
pub trait ItemHandler<I, T>: Send + Sync {
    /// `attempt` is 1 for the first dispatch of the item
    async fn handle(&self, item: &WorkItem<I>, attempt: u32) -> TaskReport<T>;
}

/// An item dropped from the queue after waiting too long
#[derive(Debug, Clone, Serialize)]
pub struct ExpiredItem {
    pub key: String,
    pub waited_ms: u64,
    /// Dispatches before it expired
    pub attempts: u32,
}

/// Pool counters for one batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub expired: usize,
    pub unprocessed: usize,
    pub requeues: u64,
    pub peak_concurrency: usize,
    pub final_concurrency: usize,
    pub elapsed_ms: u64,
}

/// Everything a batch produced
#[derive(Debug)]
pub struct BatchReport<I, T> {
    pub results: HashMap<String, ItemResult<T>>,
    pub expired: Vec<ExpiredItem>,
    /// Items never finished because processing was stopped
    pub unprocessed: Vec<WorkItem<I>>,
    pub dead_letters: Vec<DeadLetterEntry>,
    /// Counters of the dead-letter queue, including entries dropped at capacity
    pub dead_letter_stats: DeadLetterStats,
    pub stats: PoolStats,
}

impl<I, T> BatchReport<I, T> {
    pub fn succeeded(&self) -> usize {
        self.stats.succeeded
    }

    pub fn failed(&self) -> usize {
        self.stats.failed
    }

    /// Check that every item ended in a result, an expiry or the unprocessed list
    pub fn is_complete(&self) -> bool {
        self.results.len() + self.expired.len() + self.unprocessed.len() == self.stats.total_items
    }
}

struct QueueItem<I> {
    work: WorkItem<I>,
    dispatches: u32,
    upstream_attempts: u32,
    total_latency: Duration,
    enqueued_at: Instant,
    first_failed_at: Option<SystemTime>,
}

struct BatchState<I, T> {
    queue: VecDeque<QueueItem<I>>,
    in_flight: usize,
    peak: usize,
    results: HashMap<String, ItemResult<T>>,
    expired: Vec<ExpiredItem>,
    dead_letters: DeadLetterQueue,
    requeues: u64,
}

enum Next<I> {
    Run(QueueItem<I>),
    Wait,
    Done,
}

struct Shared<I, T> {
    config: PoolConfig,
    controller: Arc<ConcurrencyController>,
    state: Mutex<BatchState<I, T>>,
}

impl<I, T> Shared<I, T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, BatchState<I, T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expire stale items, then claim the next one if the ceiling allows
    fn next_item(&self) -> Next<I> {
        let mut state = self.lock();
        let now = Instant::now();

        // Requeues refresh the timestamp and go to the back, so the queue is
        // ordered by enqueue time
        while let Some(front) = state.queue.front() {
            let waited = now.duration_since(front.enqueued_at);
            if waited <= self.config.queue_timeout {
                break;
            }
            if let Some(item) = state.queue.pop_front() {
                self.controller.remove_queued(1);
                warn!(key = %item.work.key, waited_ms = waited.as_millis() as u64, "Item expired in queue");
                state.dead_letters.push(
                    DeadLetterEntry::new(
                        item.work.key.clone(),
                        FailureReason::Expired { waited },
                        format!("waited {}ms in queue", waited.as_millis()),
                        item.upstream_attempts,
                    )
                    .first_failed(item.first_failed_at.unwrap_or_else(SystemTime::now)),
                );
                state.expired.push(ExpiredItem {
                    key: item.work.key,
                    waited_ms: waited.as_millis() as u64,
                    attempts: item.dispatches,
                });
            }
        }

        if state.queue.is_empty() {
            return if state.in_flight == 0 {
                Next::Done
            } else {
                Next::Wait
            };
        }

        if !self.controller.try_claim() {
            return Next::Wait;
        }

        match state.queue.pop_front() {
            Some(item) => {
                self.controller.remove_queued(1);
                state.in_flight += 1;
                state.peak = state.peak.max(state.in_flight);
                Next::Run(item)
            }
            None => {
                self.controller.release();
                Next::Wait
            }
        }
    }

    fn complete(&self, mut item: QueueItem<I>, report: TaskReport<T>) {
        self.controller
            .record(report.result.is_ok(), report.latency, report.rate_limited);

        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.controller.release();

        item.dispatches += 1;
        item.upstream_attempts += report.attempts;
        item.total_latency += report.latency;

        match report.result {
            Ok(value) => {
                state.results.insert(
                    item.work.key,
                    ItemResult {
                        value: Ok(value),
                        attempts: item.upstream_attempts,
                        total_latency: item.total_latency,
                    },
                );
            }
            Err(err) => {
                let first_failed = *item.first_failed_at.get_or_insert_with(SystemTime::now);

                if item.dispatches < self.config.max_attempts && err.is_retryable() {
                    debug!(
                        key = %item.work.key,
                        dispatches = item.dispatches,
                        error = %err,
                        "Requeueing item"
                    );
                    item.enqueued_at = Instant::now();
                    state.queue.push_back(item);
                    state.requeues += 1;
                    self.controller.add_queued(1);
                    return;
                }

                let reason = failure_reason(&err, item.upstream_attempts);
                warn!(key = %item.work.key, reason = %reason, "Item failed");
                state.dead_letters.push(
                    DeadLetterEntry::new(
                        item.work.key.clone(),
                        reason,
                        err.to_string(),
                        item.upstream_attempts,
                    )
                    .first_failed(first_failed),
                );
                state.results.insert(
                    item.work.key,
                    ItemResult {
                        value: Err(err),
                        attempts: item.upstream_attempts,
                        total_latency: item.total_latency,
                    },
                );
            }
        }
    }

    /// Record a dispatch whose task died without reporting
    fn abandon(&self, key: String, message: String) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.controller.release();
        state.dead_letters.push(DeadLetterEntry::new(
            key.clone(),
            FailureReason::RetriesExhausted { attempts: 0 },
            message.clone(),
            0,
        ));
        state.results.insert(
            key,
            ItemResult {
                value: Err(GovernorError::Other(message)),
                attempts: 0,
                total_latency: Duration::ZERO,
            },
        );
    }
}

/// Terminal dead-letter reason for a failed item
fn failure_reason(err: &GovernorError, attempts: u32) -> FailureReason {
    match err {
        GovernorError::ServiceUnavailable { .. } => FailureReason::ServiceUnavailable,
        GovernorError::Upstream { kind, .. } if !kind.is_retryable() => {
            FailureReason::NonRetryable { kind: *kind }
        }
        _ => FailureReason::RetriesExhausted { attempts },
    }
}

/// Runs batches on a fixed set of workers under the controller's ceiling
pub struct ConcurrentProcessor {
    controller: Arc<ConcurrencyController>,
}

impl ConcurrentProcessor {
    pub fn new(controller: Arc<ConcurrencyController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    /// Process a batch until every item resolves or `cancel` fires.
    ///
    /// On cancellation running items finish, nothing new starts, and queued
    /// items come back in [`BatchReport::unprocessed`].
    pub async fn process<I, T, H>(
        &self,
        items: Vec<WorkItem<I>>,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> BatchReport<I, T>
    where
        I: Send + Sync + 'static,
        T: Send + 'static,
        H: ItemHandler<I, T> + 'static,
    {
        let start = Instant::now();
        let config = self.controller.config().clone();
        let total_items = items.len();

        let queue: VecDeque<QueueItem<I>> = items
            .into_iter()
            .map(|work| QueueItem {
                work,
                dispatches: 0,
                upstream_attempts: 0,
                total_latency: Duration::ZERO,
                enqueued_at: start,
                first_failed_at: None,
            })
            .collect();
        self.controller.add_queued(queue.len());

        let shared = Arc::new(Shared {
            config: config.clone(),
            controller: self.controller.clone(),
            state: Mutex::new(BatchState {
                queue,
                in_flight: 0,
                peak: 0,
                results: HashMap::with_capacity(total_items),
                expired: Vec::new(),
                dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
                requeues: 0,
            }),
        });

        let adapt_cancel = cancel.child_token();
        let adaptation = tokio::spawn(adaptation_loop(
            self.controller.clone(),
            config.adaptation_interval,
            adapt_cancel.clone(),
        ));

        let worker_count = config.max_concurrency.min(total_items);
        info!(items = total_items, workers = worker_count, "Processing batch");

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(worker_loop(
                id,
                shared.clone(),
                handler.clone(),
                cancel.clone(),
            ));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        adapt_cancel.cancel();
        if let Err(e) = adaptation.await {
            error!("Adaptation task failed: {}", e);
        }

        let mut state = shared.lock();
        let unprocessed: Vec<WorkItem<I>> = state.queue.drain(..).map(|q| q.work).collect();
        self.controller.remove_queued(unprocessed.len());

        let succeeded = state.results.values().filter(|r| r.is_success()).count();
        let stats = PoolStats {
            total_items,
            succeeded,
            failed: state.results.len() - succeeded,
            expired: state.expired.len(),
            unprocessed: unprocessed.len(),
            requeues: state.requeues,
            peak_concurrency: state.peak,
            final_concurrency: self.controller.current(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            expired = stats.expired,
            unprocessed = stats.unprocessed,
            "Batch finished"
        );

        BatchReport {
            results: std::mem::take(&mut state.results),
            expired: std::mem::take(&mut state.expired),
            unprocessed,
            dead_letter_stats: state.dead_letters.stats(),
            dead_letters: state.dead_letters.drain(),
            stats,
        }
    }
}

async fn worker_loop<I, T, H>(
    id: usize,
    shared: Arc<Shared<I, T>>,
    handler: Arc<H>,
    cancel: CancellationToken,
) where
    I: Send + Sync + 'static,
    T: Send + 'static,
    H: ItemHandler<I, T> + 'static,
{
    let poll = shared.config.poll_interval.max(Duration::from_millis(1));

    loop {
        if cancel.is_cancelled() {
            debug!(worker = id, "Worker stopping");
            break;
        }

        match shared.next_item() {
            Next::Done => break,
            Next::Wait => {
                tokio::select! {
                    _ = sleep(poll) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            Next::Run(item) => {
                let key = item.work.key.clone();
                let attempt = item.dispatches + 1;
                let handler = handler.clone();

                // Run the dispatch in its own task so a panic cannot leak the slot
                let task = tokio::spawn(async move {
                    let report = handler.handle(&item.work, attempt).await;
                    (item, report)
                });

                match task.await {
                    Ok((item, report)) => shared.complete(item, report),
                    Err(e) => {
                        error!(worker = id, key = %key, "Item task failed: {}", e);
                        shared.abandon(key, format!("item task failed: {}", e));
                    }
                }
            }
        }
    }
}

async fn adaptation_loop(
    controller: Arc<ConcurrencyController>,
    period: Duration,
    cancel: CancellationToken,
) {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(change) = controller.evaluate() {
                    debug!(from = change.from, to = change.to, "Adaptation tick");
                }
            }
        }
    }
}
