use criterion::{criterion_group, criterion_main, Criterion};
use pacekeeper::config::GovernorConfig;
use pacekeeper::orchestrator::{Governor, RequestContext};
use pacekeeper_core_resilience::{
    DelayContext, DelayPlanner, DelayPlannerConfig, ErrorKind, RateLimitConfig, RateState,
    RequestRecord, ResponseFeedback,
};
use std::hint::black_box;
use std::time::Duration;

fn benchmark_delay_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("delay_planner");

    let mut planner = DelayPlanner::new(DelayPlannerConfig::default());
    for i in 0..200u64 {
        planner.record_response(ResponseFeedback {
            latency: Duration::from_millis(100 + (i * 37) % 900),
            success: i % 7 != 0,
            rate_limited: i % 31 == 0,
            delay_used: Duration::from_millis(1_000),
        });
    }

    let ctx = DelayContext {
        is_burst: false,
        is_retry: false,
        consecutive_failures: 1,
        progress: 0.4,
        usage_ratio: 0.6,
    };

    group.bench_function("delay", |b| {
        b.iter(|| black_box(planner.delay(black_box(&ctx))));
    });
    group.bench_function("breakdown", |b| {
        b.iter(|| black_box(planner.breakdown(black_box(&ctx))));
    });

    group.finish();
}

fn benchmark_rate_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_state");

    // Rate windows read tokio's clock, so build and query inside a runtime
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let _guard = runtime.enter();

    let mut state = RateState::new(RateLimitConfig::default());
    for i in 0..5_000u64 {
        let latency = Duration::from_millis(50 + i % 400);
        let record = if i % 25 == 0 {
            RequestRecord::failure(latency, ErrorKind::ServerError)
        } else {
            RequestRecord::success(latency)
        };
        state.record_attempt(record);
    }

    group.bench_function("optimal_delay", |b| {
        b.iter(|| black_box(state.optimal_delay()));
    });
    group.bench_function("can_proceed", |b| {
        b.iter(|| black_box(state.can_proceed(black_box(false))));
    });

    group.finish();
}

fn benchmark_governor_plan(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let governor = runtime.block_on(async { Governor::new(GovernorConfig::default()).expect("governor") });
    let ctx = RequestContext {
        is_retry: false,
        progress: 0.5,
    };

    c.bench_function("governor_plan", |b| {
        b.iter(|| runtime.block_on(governor.plan(black_box(&ctx))));
    });
}

criterion_group!(
    benches,
    benchmark_delay_planner,
    benchmark_rate_state,
    benchmark_governor_plan
);
criterion_main!(benches);
