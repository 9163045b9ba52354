/*!
 * Synthetic upstream for demos and tests
 *
 * Behaves like a flaky warranty-lookup API: a hidden per-minute limit
 * enforced with 429s and rate-limit headers, random server errors and
 * timeouts, and the occasional 401.
 */

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::work::{ResponseMeta, Work, WorkFailure, WorkItem, WorkSuccess};
use pacekeeper_core_resilience::ErrorKind;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SimulatedUpstreamConfig {
    /// Requests per minute before the upstream starts returning 429
    pub hidden_per_minute: u32,
    pub base_latency: Duration,
    /// Uniform extra latency on top of the base
    pub latency_jitter: Duration,
    pub server_error_rate: f64,
    pub timeout_rate: f64,
    pub auth_error_rate: f64,
    /// Attach X-RateLimit-* headers to responses
    pub send_headers: bool,
    pub seed: Option<u64>,
}

impl Default for SimulatedUpstreamConfig {
    fn default() -> Self {
        Self {
            hidden_per_minute: 40,
            base_latency: Duration::from_millis(150),
            latency_jitter: Duration::from_millis(250),
            server_error_rate: 0.05,
            timeout_rate: 0.02,
            auth_error_rate: 0.005,
            send_headers: false,
            seed: None,
        }
    }
}

/// What the upstream saw
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationStats {
    pub calls: u64,
    pub succeeded: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub timeouts: u64,
    pub auth_errors: u64,
}

enum Outcome {
    Ok,
    RateLimited { reset: Duration },
    ServerError,
    Timeout,
    Unauthorized,
}

struct SimState {
    window: VecDeque<Instant>,
    rng: StdRng,
    stats: SimulationStats,
}

pub struct SimulatedUpstream {
    config: SimulatedUpstreamConfig,
    state: Mutex<SimState>,
}

impl SimulatedUpstream {
    pub fn new(config: SimulatedUpstreamConfig) -> Self {
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        Self {
            config,
            state: Mutex::new(SimState {
                window: VecDeque::new(),
                rng: StdRng::seed_from_u64(seed),
                stats: SimulationStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> SimulationStats {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
            .clone()
    }

    /// Roll the outcome and latency of one call
    fn roll(&self) -> (Outcome, Duration, u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while state
            .window
            .front()
            .is_some_and(|&at| now.duration_since(at) >= WINDOW)
        {
            state.window.pop_front();
        }

        state.stats.calls += 1;
        let jitter_ms = self.config.latency_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(if jitter_ms == 0 {
            0
        } else {
            state.rng.random_range(0..=jitter_ms)
        });
        let latency = self.config.base_latency + jitter;
        let limit = self.config.hidden_per_minute;

        if state.window.len() as u32 >= limit {
            state.stats.rate_limited += 1;
            let reset = state
                .window
                .front()
                .map(|&oldest| WINDOW.saturating_sub(now.duration_since(oldest)))
                .unwrap_or(WINDOW);
            return (Outcome::RateLimited { reset }, latency / 4, 0);
        }
        state.window.push_back(now);
        let remaining = limit.saturating_sub(state.window.len() as u32);

        let roll: f64 = state.rng.random_range(0.0..1.0);
        let auth = self.config.auth_error_rate;
        let timeout = auth + self.config.timeout_rate;
        let server = timeout + self.config.server_error_rate;

        let outcome = if roll < auth {
            state.stats.auth_errors += 1;
            Outcome::Unauthorized
        } else if roll < timeout {
            state.stats.timeouts += 1;
            Outcome::Timeout
        } else if roll < server {
            state.stats.server_errors += 1;
            Outcome::ServerError
        } else {
            state.stats.succeeded += 1;
            Outcome::Ok
        };
        (outcome, latency, remaining)
    }

    fn meta(&self, latency: Duration, remaining: u32, reset: Duration) -> ResponseMeta {
        let meta = ResponseMeta::new(latency);
        if !self.config.send_headers {
            return meta;
        }
        let limit = self.config.hidden_per_minute.to_string();
        let remaining = remaining.to_string();
        let reset = reset.as_secs().max(1).to_string();
        meta.with_headers([
            ("X-RateLimit-Limit", limit.as_str()),
            ("X-RateLimit-Remaining", remaining.as_str()),
            ("X-RateLimit-Reset", reset.as_str()),
        ])
    }
}

#[async_trait]
impl Work<String, String> for SimulatedUpstream {
    async fn perform(&self, serial: &String) -> Result<WorkSuccess<String>, WorkFailure> {
        let (outcome, latency, remaining) = self.roll();
        sleep(latency).await;

        match outcome {
            Outcome::Ok => Ok(WorkSuccess::new(
                format!("{}:covered", serial),
                self.meta(latency, remaining, WINDOW).with_status(200),
            )),
            Outcome::RateLimited { reset } => {
                let wait = reset.max(Duration::from_secs(1));
                Err(WorkFailure::new(
                    "Too Many Requests",
                    self.meta(latency, 0, reset)
                        .with_status(429)
                        .with_retry_after(Duration::from_secs(wait.as_secs().max(1))),
                ))
            }
            Outcome::ServerError => Err(WorkFailure::new(
                "Service Unavailable",
                self.meta(latency, remaining, WINDOW).with_status(503),
            )),
            Outcome::Timeout => Err(WorkFailure::new(
                format!("request for {} timed out", serial),
                ResponseMeta::new(latency * 4),
            )
            .with_kind(ErrorKind::Timeout)),
            Outcome::Unauthorized => Err(WorkFailure::new(
                "token rejected",
                ResponseMeta::new(latency).with_status(401),
            )),
        }
    }
}

/// Generate `count` device serial numbers as work items
pub fn serial_items(count: usize) -> Vec<WorkItem<String>> {
    (1..=count)
        .map(|i| {
            let serial = format!("SN-{:06}", i);
            WorkItem::new(serial.clone(), serial)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reliable(limit: u32) -> SimulatedUpstreamConfig {
        SimulatedUpstreamConfig {
            hidden_per_minute: limit,
            server_error_rate: 0.0,
            timeout_rate: 0.0,
            auth_error_rate: 0.0,
            send_headers: true,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_limit_returns_429() {
        let upstream = SimulatedUpstream::new(reliable(3));
        let serial = "SN-1".to_string();

        for _ in 0..3 {
            assert!(upstream.perform(&serial).await.is_ok());
        }
        let err = upstream.perform(&serial).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(err.meta.retry_after.unwrap() >= Duration::from_secs(1));
        assert_eq!(err.meta.rate_limit.as_ref().and_then(|h| h.remaining), Some(0));

        // The window slides
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(upstream.perform(&serial).await.is_ok());

        let stats = upstream.stats();
        assert_eq!(stats.calls, 5);
        assert_eq!(stats.rate_limited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_carries_headers() {
        let upstream = SimulatedUpstream::new(reliable(10));
        let ok = upstream.perform(&"SN-9".to_string()).await.unwrap();
        assert_eq!(ok.value, "SN-9:covered");
        let headers = ok.meta.rate_limit.unwrap();
        assert_eq!(headers.limit, Some(10));
        assert_eq!(headers.remaining, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failures() {
        let upstream = SimulatedUpstream::new(SimulatedUpstreamConfig {
            auth_error_rate: 1.0,
            ..reliable(10)
        });
        let err = upstream.perform(&"SN-2".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[test]
    fn test_serial_items() {
        let items = serial_items(3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].key, "SN-000003");
    }
}
