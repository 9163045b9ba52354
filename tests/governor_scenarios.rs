use async_trait::async_trait;
use pacekeeper::config::{BreakerSection, BurstSection, GovernorConfig, PoolSection, RetrySection};
use pacekeeper::error::GovernorError;
use pacekeeper::orchestrator::{Governor, RequestContext, Strategy};
use pacekeeper::work::{work_fn, ResponseMeta, Work, WorkFailure, WorkItem, WorkSuccess};
use pacekeeper_core_resilience::{CircuitPhase, ErrorKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn base_config() -> GovernorConfig {
    GovernorConfig {
        burst: BurstSection {
            enabled: false,
            ..Default::default()
        },
        retry: RetrySection {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Work that always fails with `status`, counting calls
fn failing_work(status: u16, calls: Arc<AtomicUsize>) -> impl Work<u32, u32> {
    work_fn(move |_: &u32| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<WorkSuccess<u32>, _>(WorkFailure::new(
                format!("upstream said {}", status),
                ResponseMeta::new(Duration::from_millis(30)).with_status(status),
            ))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_and_rejects_without_calling() {
    let mut config = base_config();
    config.breaker = BreakerSection {
        failure_threshold: 5,
        ..Default::default()
    };
    config.optimizer.max_plan_rounds = 1;
    let governor = Governor::new(config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let work = failing_work(500, calls.clone());

    for i in 0..5 {
        let report = governor
            .execute_request(&work, &i, RequestContext::default())
            .await;
        assert_err!(report.result);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(
        governor.breaker().get_state().await.phase(),
        CircuitPhase::Open
    );

    let plan = governor.plan(&RequestContext::default()).await;
    assert_eq!(plan.strategy, Strategy::CircuitOpen);

    let started = Instant::now();
    let report = governor
        .execute_request(&work, &5, RequestContext::default())
        .await;
    let err = assert_err!(report.result);
    assert!(err.is_service_unavailable(), "got {}", err);
    assert_eq!(calls.load(Ordering::SeqCst), 5, "open circuit invoked the work");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_holds_next_plan() {
    let governor = Governor::new(base_config()).unwrap();

    let work = work_fn(|_: &u32| async {
        Err::<WorkSuccess<u32>, _>(WorkFailure::new(
            "Too Many Requests",
            ResponseMeta::new(Duration::from_millis(15))
                .with_headers([("Retry-After", "10"), ("X-RateLimit-Remaining", "0")])
                .with_status(429),
        ))
    });

    let report = governor
        .execute_request(&work, &1, RequestContext::default())
        .await;
    assert!(report.rate_limited);

    let plan = governor.plan(&RequestContext::default()).await;
    assert_eq!(plan.strategy, Strategy::RateLimited);
    assert!(plan.delay >= Duration::from_secs(10), "delay {:?}", plan.delay);

    // Once the block passes, pacing goes back to normal
    tokio::time::advance(Duration::from_secs(11)).await;
    let plan = governor.plan(&RequestContext::default()).await;
    assert_eq!(plan.strategy, Strategy::Normal);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_is_not_retried() {
    let mut config = base_config();
    config.retry.max_retries = 5;
    let governor = Governor::new(config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let work = failing_work(401, calls.clone());

    let report = governor
        .execute_request(&work, &1, RequestContext::default())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.attempts, 1);
    match report.result.unwrap_err() {
        GovernorError::Upstream { kind, status, .. } => {
            assert_eq!(kind, ErrorKind::AuthError);
            assert_eq!(status, Some(401));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_recover() {
    let mut config = base_config();
    config.retry.max_retries = 3;
    let governor = Governor::new(config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let work = work_fn(move |n: &u32| {
        let n = *n;
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(WorkFailure::new(
                    "Service Unavailable",
                    ResponseMeta::new(Duration::from_millis(40)).with_status(503),
                ))
            } else {
                Ok(WorkSuccess::new(n * 3, ResponseMeta::new(Duration::from_millis(40))))
            }
        }
    });

    let report = governor
        .execute_request(&work, &7, RequestContext::default())
        .await;
    assert_eq!(assert_ok!(report.result), 21);
    assert_eq!(report.attempts, 3);

    let status = governor.status().await;
    assert_eq!(status.recovery.recovered, 1);
    assert_eq!(status.circuit.phase, CircuitPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_are_all_recorded() {
    let governor = Governor::new(base_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let work = work_fn(move |n: &u32| {
        let n = *n;
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, WorkFailure>(WorkSuccess::new(n, ResponseMeta::new(Duration::from_millis(50))))
        }
    });

    let requests = (0..20u32).map(|i| {
        let governor = governor.clone();
        let work = &work;
        async move {
            governor
                .execute_request(work, &i, RequestContext::default())
                .await
        }
    });
    let reports = futures::future::join_all(requests).await;

    assert!(reports.iter().all(|r| r.result.is_ok()));
    assert_eq!(calls.load(Ordering::SeqCst), 20);

    let status = governor.status().await;
    assert_eq!(status.rate_windows.last_minute, 20);
    assert_eq!(status.recovery.operations, 20);
    assert_eq!(status.analytics.current_window_requests, 20);
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_without_traffic_is_noop() {
    let governor = Governor::new(base_config()).unwrap();
    assert!(!governor.aggregate_now());

    let status = governor.status().await;
    assert_eq!(status.analytics.windows, 0);
    assert!(status.analytics.last_window.is_none());
    assert!(governor.recommend_now().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_thin_history_recommendations_are_withheld() {
    let governor = Governor::new(base_config()).unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let work = work_fn(move |n: &u32| {
        let n = *n;
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call % 2 == 0 {
                Err(WorkFailure::new(
                    "slow down",
                    ResponseMeta::new(Duration::from_millis(20))
                        .with_status(429)
                        .with_retry_after(Duration::from_secs(1)),
                ))
            } else {
                Ok(WorkSuccess::new(n, ResponseMeta::new(Duration::from_millis(20))))
            }
        }
    });

    for i in 0..10 {
        governor
            .execute_request(&work, &i, RequestContext::default())
            .await;
    }

    assert!(governor.aggregate_now());
    // Ten requests are far too few to reach the default confidence threshold
    assert!(governor.recommend_now().is_empty());
    assert!(governor.optimize_now().is_empty());

    let status = governor.status().await;
    assert_eq!(status.analytics.windows, 1);
    let window = status.analytics.last_window.unwrap();
    assert_eq!(window.total_requests, 10);
    assert_eq!(window.rate_limit_hits, 5);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_transitions_follow_state_machine() {
    let mut rng = StdRng::seed_from_u64(0xb4ea);

    for _ in 0..20 {
        let mut config = base_config();
        config.breaker = BreakerSection {
            failure_threshold: rng.random_range(1..=4),
            success_threshold: rng.random_range(1..=3),
            recovery_time_ms: rng.random_range(100..=5_000),
        };
        config.optimizer.max_plan_rounds = rng.random_range(1..=3);
        let governor = Governor::new(config).unwrap();

        let failure_rate: f64 = rng.random_range(0.1..0.9);
        let seed: u64 = rng.random();
        let outcomes = Arc::new(std::sync::Mutex::new(StdRng::seed_from_u64(seed)));
        let work = work_fn(move |n: &u32| {
            let n = *n;
            let fail = outcomes
                .lock()
                .unwrap()
                .random_bool(failure_rate);
            async move {
                if fail {
                    Err(WorkFailure::new(
                        "bad gateway",
                        ResponseMeta::new(Duration::from_millis(25)).with_status(502),
                    ))
                } else {
                    Ok(WorkSuccess::new(n, ResponseMeta::new(Duration::from_millis(25))))
                }
            }
        });

        for i in 0..30 {
            let report = governor
                .execute_request(&work, &i, RequestContext::default())
                .await;
            if let Err(GovernorError::ServiceUnavailable { attempts, .. }) = &report.result {
                assert_eq!(*attempts, 0);
            }
        }

        for (from, to) in governor.breaker().transitions().await {
            assert!(from.can_transition_to(to), "illegal edge {} -> {}", from, to);
        }
    }
}

/// Upstream that logs when each call arrives and how many overlap
struct MeteredUpstream {
    sends: std::sync::Mutex<Vec<Instant>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    work_time: Duration,
}

impl MeteredUpstream {
    fn new(work_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            sends: std::sync::Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            work_time,
        })
    }

    fn sends(&self) -> Vec<Instant> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl Work<u32, u32> for MeteredUpstream {
    async fn perform(&self, item: &u32) -> Result<WorkSuccess<u32>, WorkFailure> {
        self.sends.lock().unwrap().push(Instant::now());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.work_time).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(WorkSuccess::new(*item, ResponseMeta::new(self.work_time)))
    }
}

/// Most calls that fall inside any closed 60 second span
fn busiest_minute(sends: &[Instant]) -> usize {
    let mut sends = sends.to_vec();
    sends.sort();
    sends
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            sends[i..]
                .iter()
                .take_while(|&&at| at.duration_since(start) <= Duration::from_secs(60))
                .count()
        })
        .max()
        .unwrap_or(0)
}

fn paced_config(per_minute: u32, min: usize, initial: usize, max: usize) -> GovernorConfig {
    let mut config = base_config();
    config.rate.requests_per_minute = per_minute;
    config.pool = PoolSection {
        min_concurrency: min,
        initial_concurrency: initial,
        max_concurrency: max,
        queue_timeout_ms: 3_600_000,
        ..Default::default()
    };
    config
}

fn numbered(n: u32) -> Vec<WorkItem<u32>> {
    (0..n).map(|i| WorkItem::new(format!("item-{:03}", i), i)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_parallel_workers_share_the_minute_limit() {
    let governor = Governor::new(paced_config(5, 10, 10, 10)).unwrap();
    let upstream = MeteredUpstream::new(Duration::from_secs(2));

    let report = governor
        .process_items(numbered(20), upstream.clone(), CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.succeeded(), 20);

    let sends = upstream.sends();
    assert_eq!(sends.len(), 20);
    let busiest = busiest_minute(&sends);
    assert!(busiest <= 5, "{} calls inside one minute with a limit of 5", busiest);
}

#[tokio::test(start_paused = true)]
async fn test_hundred_items_through_governor_respect_ceiling_and_limit() {
    let governor = Governor::new(paced_config(30, 1, 4, 4)).unwrap();
    let upstream = MeteredUpstream::new(Duration::from_millis(500));

    let report = governor
        .process_items(numbered(100), upstream.clone(), CancellationToken::new())
        .await;

    assert!(report.is_complete());
    assert_eq!(report.succeeded(), 100);
    assert_eq!(report.results["item-042"].value.as_ref().unwrap(), &42);

    let peak = upstream.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency {}", peak);
    assert!(report.stats.peak_concurrency <= 4);

    let sends = upstream.sends();
    assert_eq!(sends.len(), 100);
    let busiest = busiest_minute(&sends);
    assert!(busiest <= 30, "{} calls inside one minute with a limit of 30", busiest);

    let status = governor.status().await;
    assert_eq!(status.recovery.operations, 100);
    assert_eq!(status.rate_windows.last_hour, 100);
}

#[tokio::test(start_paused = true)]
async fn test_retries_wait_for_a_send_slot() {
    let mut config = base_config();
    config.rate.requests_per_minute = 2;
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 100;
    let governor = Governor::new(config).unwrap();

    let sends = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = sends.clone();
    let work = work_fn(move |n: &u32| {
        let n = *n;
        let attempt = {
            let mut log = log.lock().unwrap();
            log.push(Instant::now());
            log.len()
        };
        async move {
            if attempt < 3 {
                Err(WorkFailure::new(
                    "Service Unavailable",
                    ResponseMeta::new(Duration::from_millis(30)).with_status(503),
                ))
            } else {
                Ok(WorkSuccess::new(n, ResponseMeta::new(Duration::from_millis(30))))
            }
        }
    });

    let report = governor
        .execute_request(&work, &9, RequestContext::default())
        .await;
    assert_eq!(assert_ok!(report.result), 9);
    assert_eq!(report.attempts, 3);

    let sends = sends.lock().unwrap().clone();
    assert_eq!(sends.len(), 3);
    assert!(
        sends[2].duration_since(sends[0]) > Duration::from_secs(60),
        "third attempt went out {:?} after the first",
        sends[2].duration_since(sends[0])
    );
}
