//! Sliding-window request accounting with learned upstream limits
//!
//! `RateState` keeps the send history for one upstream and answers two
//! questions: may another request go out now, and how long should the next
//! one wait. A send is counted from the moment it is admitted through
//! [`RateState::try_reserve`], so concurrent callers cannot all pass the same
//! check. Limits start at the configured defaults and are replaced by learned
//! values, either from rate-limit headers or from repeated 429s when the
//! upstream publishes nothing.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Records considered for the recent success rate and latency
const RECENT_SAMPLE: usize = 50;

/// Reset values above this are unix timestamps rather than delta seconds
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Added to slot waits so a send is past its window when the wait ends
const SLOT_GRANULARITY: Duration = Duration::from_millis(1);

/// Configuration for rate accounting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Default per-minute limit until one is learned
    pub requests_per_minute: u32,
    /// Default per-hour limit until one is learned
    pub requests_per_hour: u32,
    pub min_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of a learned limit that is actually used (0-1]
    pub safety_margin: f64,
    /// Maximum age of a retained record
    pub retention: Duration,
    /// Maximum number of retained records
    pub max_records: usize,
    /// Window in which repeated 429s are combined into an estimate
    pub hit_learning_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            min_delay: Duration::from_millis(100),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            safety_margin: 0.8,
            retention: HOUR,
            max_records: 10_000,
            hit_learning_window: Duration::from_secs(300),
        }
    }
}

/// One completed attempt against the upstream, stamped with its send time
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub at: Instant,
    pub success: bool,
    pub latency: Duration,
    pub rate_limit_hit: bool,
    pub error_kind: Option<ErrorKind>,
    pub delay_used: Duration,
    pub concurrency: usize,
    pub burst_mode: bool,
}

impl RequestRecord {
    pub fn success(latency: Duration) -> Self {
        Self {
            at: Instant::now(),
            success: true,
            latency,
            rate_limit_hit: false,
            error_kind: None,
            delay_used: Duration::ZERO,
            concurrency: 1,
            burst_mode: false,
        }
    }

    pub fn failure(latency: Duration, kind: ErrorKind) -> Self {
        Self {
            at: Instant::now(),
            success: false,
            latency,
            rate_limit_hit: kind == ErrorKind::RateLimit,
            error_kind: Some(kind),
            delay_used: Duration::ZERO,
            concurrency: 1,
            burst_mode: false,
        }
    }

    /// Stamp the record with the time the request went out
    pub fn sent_at(mut self, at: Instant) -> Self {
        self.at = at;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_used = delay;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn in_burst(mut self, burst_mode: bool) -> Self {
        self.burst_mode = burst_mode;
        self
    }
}

/// Where a learned limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitSource {
    Headers,
    Estimated,
}

/// A learned limit, already scaled by the safety margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedLimit {
    pub value: u32,
    pub source: LimitSource,
}

/// Limits learned from the upstream, `None` while unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLimits {
    pub per_minute: Option<LearnedLimit>,
    pub per_hour: Option<LearnedLimit>,
    pub burst_size: Option<u32>,
}

/// A send admitted into the rate windows and not yet recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSlot {
    id: u64,
    at: Instant,
}

impl SendSlot {
    pub fn sent_at(&self) -> Instant {
        self.at
    }
}

/// Request counts inside the rate windows, admitted sends included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateWindowCounts {
    pub last_minute: usize,
    pub last_hour: usize,
}

/// Rate-limit metadata from a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the limit window resets
    pub reset: Option<Duration>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse rate-limit headers from name/value pairs
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_pairs_at(pairs, now_unix)
    }

    /// Parse rate-limit headers, resolving epoch resets against `now_unix`
    pub fn from_pairs_at<'a, I>(pairs: I, now_unix: u64) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = Self::default();

        for (name, value) in pairs {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "x-ratelimit-limit" | "ratelimit-limit" => headers.limit = value.parse().ok(),
                "x-ratelimit-remaining" | "ratelimit-remaining" => {
                    headers.remaining = value.parse().ok()
                }
                "x-ratelimit-reset" | "ratelimit-reset" => {
                    headers.reset = value.parse::<u64>().ok().map(|secs| {
                        if secs > EPOCH_THRESHOLD {
                            Duration::from_secs(secs.saturating_sub(now_unix))
                        } else {
                            Duration::from_secs(secs)
                        }
                    })
                }
                "retry-after" => headers.retry_after = value.parse().ok().map(Duration::from_secs),
                _ => {}
            }
        }

        headers
    }

    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset.is_none()
            && self.retry_after.is_none()
    }
}

/// Rolling request history and learned limits for one upstream
#[derive(Debug)]
pub struct RateState {
    config: RateLimitConfig,
    /// Ordered by send time
    records: VecDeque<RequestRecord>,
    /// Admitted sends whose outcome has not been recorded
    pending: VecDeque<SendSlot>,
    next_slot: u64,
    /// (hit time, requests in the last minute at that time)
    hits: VecDeque<(Instant, usize)>,
    detected: DetectedLimits,
    blocked_until: Option<Instant>,
}

impl RateState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: VecDeque::new(),
            pending: VecDeque::new(),
            next_slot: 0,
            hits: VecDeque::new(),
            detected: DetectedLimits::default(),
            blocked_until: None,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn detected_limits(&self) -> &DetectedLimits {
        &self.detected
    }

    /// Per-minute limit in force: learned if known, else configured
    pub fn effective_per_minute(&self) -> u32 {
        self.detected
            .per_minute
            .map(|l| l.value)
            .unwrap_or(self.config.requests_per_minute)
            .max(1)
    }

    /// Per-hour limit in force: learned if known, else configured
    pub fn effective_per_hour(&self) -> u32 {
        self.detected
            .per_hour
            .map(|l| l.value)
            .unwrap_or(self.config.requests_per_hour)
            .max(1)
    }

    pub fn window_counts(&self) -> RateWindowCounts {
        let now = Instant::now();
        let within = |window: Duration| {
            let recorded = self
                .records
                .iter()
                .rev()
                .take_while(|r| now.duration_since(r.at) <= window)
                .count();
            let pending = self
                .pending
                .iter()
                .filter(|s| now.duration_since(s.at) <= window)
                .count();
            recorded + pending
        };
        RateWindowCounts {
            last_minute: within(MINUTE),
            last_hour: within(HOUR),
        }
    }

    /// Time left on a retry-after or exhausted-quota block
    pub fn blocked_for(&self) -> Option<Duration> {
        let until = self.blocked_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Check whether a request may be sent now.
    ///
    /// `burst_active` lifts the per-minute check only. The per-hour limit
    /// and any retry-after block still apply.
    pub fn can_proceed(&self, burst_active: bool) -> bool {
        if self.blocked_for().is_some() {
            return false;
        }

        let counts = self.window_counts();
        let hour_ok = (counts.last_hour as u64) < self.effective_per_hour() as u64;
        let minute_ok = (counts.last_minute as u64) < self.effective_per_minute() as u64;

        hour_ok && (minute_ok || burst_active)
    }

    /// Fraction of the tighter window's capacity already used
    pub fn usage_ratio(&self) -> f64 {
        let counts = self.window_counts();
        let minute = counts.last_minute as f64 / self.effective_per_minute() as f64;
        let hour = counts.last_hour as f64 / self.effective_per_hour() as f64;
        minute.max(hour)
    }

    /// Admit one send, holding its place in the windows until
    /// [`RateState::complete`] records the outcome.
    ///
    /// Applies the same rules as [`RateState::can_proceed`]. When no slot is
    /// free, returns how long until one frees up.
    pub fn try_reserve(&mut self, burst_active: bool) -> Result<SendSlot, Duration> {
        if let Some(blocked) = self.blocked_for() {
            return Err(blocked);
        }

        let hour_wait = self.wait_for_room(HOUR, self.effective_per_hour());
        let minute_wait = if burst_active {
            None
        } else {
            self.wait_for_room(MINUTE, self.effective_per_minute())
        };
        if let Some(wait) = hour_wait.max(minute_wait) {
            return Err(wait);
        }

        let slot = SendSlot {
            id: self.next_slot,
            at: Instant::now(),
        };
        self.next_slot += 1;
        self.pending.push_back(slot);
        Ok(slot)
    }

    /// Record the outcome of an admitted send and release its slot.
    ///
    /// The record takes the slot's admission time.
    pub fn complete(&mut self, slot: SendSlot, record: RequestRecord) {
        self.pending.retain(|s| s.id != slot.id);
        self.record_attempt(record.sent_at(slot.at));
    }

    /// Admitted sends still waiting for an outcome
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Record a completed attempt
    pub fn record_attempt(&mut self, record: RequestRecord) {
        // Completions arrive out of send order
        let pos = self
            .records
            .iter()
            .rposition(|r| r.at <= record.at)
            .map_or(0, |i| i + 1);
        self.records.insert(pos, record);
        self.prune();
    }

    /// Wait until `window` has room for one more send, `None` if it has room now
    fn wait_for_room(&self, window: Duration, limit: u32) -> Option<Duration> {
        let now = Instant::now();
        let limit = limit as usize;
        let mut sends: Vec<Instant> = self
            .records
            .iter()
            .rev()
            .take_while(|r| now.duration_since(r.at) <= window)
            .map(|r| r.at)
            .chain(
                self.pending
                    .iter()
                    .filter(|s| now.duration_since(s.at) <= window)
                    .map(|s| s.at),
            )
            .collect();
        if sends.len() < limit {
            return None;
        }

        // Room appears once every send up to this one has left the window
        sends.sort_unstable();
        let leaving = sends[sends.len() - limit];
        Some((leaving + window + SLOT_GRANULARITY).saturating_duration_since(now))
    }

    /// Record an explicit rate-limit signal from the upstream.
    ///
    /// A `retry_after` blocks [`RateState::can_proceed`] until it elapses.
    /// Two or more signals inside the learning window produce a per-minute
    /// estimate, unless the headers already gave one.
    pub fn record_rate_limit_signal(&mut self, retry_after: Option<Duration>) {
        let now = Instant::now();
        if let Some(wait) = retry_after {
            self.block_until(now + wait);
        }

        let in_window = self.window_counts().last_minute;
        self.hits.push_back((now, in_window));
        while let Some(&(at, _)) = self.hits.front() {
            if now.duration_since(at) > self.config.hit_learning_window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        warn!(
            requests_last_minute = in_window,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Upstream rate limit hit"
        );

        let header_known = matches!(
            self.detected.per_minute,
            Some(LearnedLimit {
                source: LimitSource::Headers,
                ..
            })
        );
        if self.hits.len() < 2 || header_known {
            return;
        }

        let mean = self.hits.iter().map(|&(_, n)| n as f64).sum::<f64>() / self.hits.len() as f64;
        let estimate = ((mean * self.config.safety_margin).floor() as u32).max(1);
        if self.detected.per_minute.map(|l| l.value) != Some(estimate) {
            info!(
                estimate,
                samples = self.hits.len(),
                "Estimated per-minute limit from repeated rate-limit hits"
            );
        }
        self.detected.per_minute = Some(LearnedLimit {
            value: estimate,
            source: LimitSource::Estimated,
        });
        self.detected.burst_size = Some((estimate / 4).max(1));
    }

    /// Learn from rate-limit headers on a response
    pub fn observe_headers(&mut self, headers: &RateLimitHeaders) {
        let now = Instant::now();

        if let (Some(limit), Some(reset)) = (headers.limit, headers.reset) {
            let learned = LearnedLimit {
                value: ((limit as f64 * self.config.safety_margin).floor() as u32).max(1),
                source: LimitSource::Headers,
            };
            let slot = if reset <= MINUTE {
                Some(&mut self.detected.per_minute)
            } else if reset <= HOUR {
                Some(&mut self.detected.per_hour)
            } else {
                None
            };
            if let Some(slot) = slot {
                if *slot != Some(learned) {
                    debug!(limit, scaled = learned.value, reset_s = reset.as_secs(), "Learned limit from headers");
                }
                *slot = Some(learned);
            }
        }

        if let (Some(0), Some(reset)) = (headers.remaining, headers.reset) {
            self.block_until(now + reset);
        }
        if let Some(wait) = headers.retry_after {
            self.block_until(now + wait);
        }
    }

    /// Best delay before the next request.
    ///
    /// Grows multiplicatively with the recent failure rate and, above 80 %
    /// of window capacity, by `1 + usage`. Never below the even-spacing
    /// interval and always inside `[min_delay, max_delay]`.
    pub fn optimal_delay(&self) -> Duration {
        let spacing = MINUTE.as_secs_f64() / self.effective_per_minute() as f64;
        let failure_rate = 1.0 - self.recent_success_rate();

        let mut delay = self.config.base_delay.as_secs_f64() * (1.0 + 2.0 * failure_rate);
        let usage = self.usage_ratio();
        if usage > 0.8 {
            delay *= 1.0 + usage;
        }

        let delay = Duration::from_secs_f64(delay.max(spacing));
        delay.max(self.config.min_delay).min(self.config.max_delay)
    }

    /// Success rate over the most recent records, 1.0 with no history
    pub fn recent_success_rate(&self) -> f64 {
        let recent: Vec<_> = self.records.iter().rev().take(RECENT_SAMPLE).collect();
        if recent.is_empty() {
            return 1.0;
        }
        recent.iter().filter(|r| r.success).count() as f64 / recent.len() as f64
    }

    /// Mean latency over the most recent records
    pub fn recent_avg_latency(&self) -> Duration {
        let recent: Vec<_> = self.records.iter().rev().take(RECENT_SAMPLE).collect();
        if recent.is_empty() {
            return Duration::ZERO;
        }
        recent.iter().map(|r| r.latency).sum::<Duration>() / recent.len() as u32
    }

    /// Scale the base delay, staying inside the delay bounds
    pub fn adjust_base_delay(&mut self, factor: f64) {
        let scaled = self.config.base_delay.as_secs_f64() * factor.max(0.0);
        self.config.base_delay = Duration::from_secs_f64(scaled)
            .max(self.config.min_delay)
            .min(self.config.max_delay);
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn block_until(&mut self, until: Instant) {
        if self.blocked_until.map_or(true, |current| until > current) {
            self.blocked_until = Some(until);
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        // Slots never completed stop counting once they age out
        let retention = self.config.retention;
        self.pending.retain(|s| now.duration_since(s.at) <= retention);
        while let Some(front) = self.records.front() {
            if now.duration_since(front.at) > self.config.retention
                || self.records.len() > self.config.max_records
            {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config(per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: 1000,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_blocks_then_slides() {
        let mut state = RateState::new(config(3));
        for _ in 0..3 {
            assert!(state.can_proceed(false));
            state.record_attempt(RequestRecord::success(Duration::from_millis(50)));
        }
        assert!(!state.can_proceed(false));
        assert_eq!(state.window_counts().last_minute, 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(state.can_proceed(false));
        assert_eq!(
            state.window_counts(),
            RateWindowCounts {
                last_minute: 0,
                last_hour: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_lifts_only_minute_check() {
        let mut state = RateState::new(RateLimitConfig {
            requests_per_minute: 2,
            requests_per_hour: 3,
            ..Default::default()
        });
        state.record_attempt(RequestRecord::success(Duration::ZERO));
        state.record_attempt(RequestRecord::success(Duration::ZERO));
        assert!(!state.can_proceed(false));
        assert!(state.can_proceed(true));

        state.record_attempt(RequestRecord::success(Duration::ZERO));
        assert!(!state.can_proceed(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserved_slots_count_before_completion() {
        let mut state = RateState::new(config(3));
        let slots: Vec<SendSlot> = (0..3)
            .map(|_| state.try_reserve(false).unwrap())
            .collect();
        assert_eq!(state.in_flight(), 3);
        assert_eq!(state.window_counts().last_minute, 3);
        assert!(!state.can_proceed(false));

        let wait = state.try_reserve(false).unwrap_err();
        assert_eq!(wait, Duration::from_secs(60) + SLOT_GRANULARITY);

        // Completing a send does not free its place in the window
        tokio::time::advance(Duration::from_secs(2)).await;
        state.complete(slots[0], RequestRecord::success(Duration::from_secs(2)));
        assert_eq!(state.in_flight(), 2);
        assert_eq!(state.window_counts().last_minute, 3);
        assert!(state.try_reserve(false).is_err());

        tokio::time::advance(wait - Duration::from_secs(2)).await;
        assert!(state.try_reserve(false).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_record_keeps_send_time() {
        let mut state = RateState::new(config(10));
        let slot = state.try_reserve(false).unwrap();
        let sent = slot.sent_at();

        tokio::time::advance(Duration::from_secs(50)).await;
        state.complete(slot, RequestRecord::success(Duration::from_secs(50)));
        assert_eq!(state.window_counts().last_minute, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(Instant::now().duration_since(sent) > Duration::from_secs(60));
        assert_eq!(state.window_counts().last_minute, 0);
        assert_eq!(state.window_counts().last_hour, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completions_stay_sorted() {
        let mut state = RateState::new(config(10));
        let early = state.try_reserve(false).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let late = state.try_reserve(false).unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        state.complete(late, RequestRecord::success(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(1)).await;
        state.complete(early, RequestRecord::success(Duration::from_secs(32)));

        // The early send leaves the minute window first
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(state.window_counts().last_minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservation_respects_burst_and_hour_limits() {
        let mut state = RateState::new(RateLimitConfig {
            requests_per_minute: 1,
            requests_per_hour: 2,
            ..Default::default()
        });
        assert!(state.try_reserve(false).is_ok());
        assert!(state.try_reserve(false).is_err());
        assert!(state.try_reserve(true).is_ok());

        let wait = state.try_reserve(true).unwrap_err();
        assert_eq!(wait, Duration::from_secs(3600) + SLOT_GRANULARITY);

        state.record_rate_limit_signal(Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(state.try_reserve(false).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_blocks_even_in_burst() {
        let mut state = RateState::new(config(100));
        state.record_rate_limit_signal(Some(Duration::from_secs(10)));

        assert!(!state.can_proceed(true));
        assert_eq!(state.blocked_for(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(state.can_proceed(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_learns_limit_from_repeated_hits() {
        let mut state = RateState::new(config(100));
        for _ in 0..20 {
            state.record_attempt(RequestRecord::success(Duration::ZERO));
        }
        state.record_rate_limit_signal(None);
        assert!(state.detected_limits().per_minute.is_none());

        for _ in 0..10 {
            state.record_attempt(RequestRecord::success(Duration::ZERO));
        }
        state.record_rate_limit_signal(None);

        // mean(20, 30) * 0.8
        let learned = state.detected_limits().per_minute.unwrap();
        assert_eq!(learned.value, 20);
        assert_eq!(learned.source, LimitSource::Estimated);
        assert_eq!(state.effective_per_minute(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_outside_window_do_not_combine() {
        let mut state = RateState::new(config(100));
        state.record_rate_limit_signal(None);
        tokio::time::advance(Duration::from_secs(301)).await;
        state.record_rate_limit_signal(None);
        assert!(state.detected_limits().per_minute.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_classify_window_and_apply_margin() {
        let mut state = RateState::new(config(100));

        state.observe_headers(&RateLimitHeaders {
            limit: Some(50),
            remaining: Some(10),
            reset: Some(Duration::from_secs(30)),
            retry_after: None,
        });
        state.observe_headers(&RateLimitHeaders {
            limit: Some(500),
            remaining: Some(400),
            reset: Some(Duration::from_secs(1800)),
            retry_after: None,
        });

        let limits = state.detected_limits();
        assert_eq!(limits.per_minute.unwrap().value, 40);
        assert_eq!(limits.per_minute.unwrap().source, LimitSource::Headers);
        assert_eq!(limits.per_hour.unwrap().value, 400);

        // Header-derived values are not overwritten by estimates
        state.record_rate_limit_signal(None);
        state.record_rate_limit_signal(None);
        assert_eq!(state.detected_limits().per_minute.unwrap().source, LimitSource::Headers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_blocks_until_reset() {
        let mut state = RateState::new(config(100));
        state.observe_headers(&RateLimitHeaders {
            limit: Some(10),
            remaining: Some(0),
            reset: Some(Duration::from_secs(20)),
            retry_after: None,
        });
        assert!(!state.can_proceed(false));
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(state.can_proceed(false));
    }

    #[test]
    fn test_header_parsing() {
        let headers = RateLimitHeaders::from_pairs_at(
            [
                ("X-RateLimit-Limit", "100"),
                ("X-RateLimit-Remaining", " 7 "),
                ("X-RateLimit-Reset", "1700000045"),
                ("Retry-After", "3"),
                ("Content-Type", "application/json"),
            ],
            1_700_000_000,
        );
        assert_eq!(headers.limit, Some(100));
        assert_eq!(headers.remaining, Some(7));
        assert_eq!(headers.reset, Some(Duration::from_secs(45)));
        assert_eq!(headers.retry_after, Some(Duration::from_secs(3)));

        let delta = RateLimitHeaders::from_pairs_at([("x-ratelimit-reset", "30")], 1_700_000_000);
        assert_eq!(delta.reset, Some(Duration::from_secs(30)));
        assert!(RateLimitHeaders::from_pairs([("accept", "*/*")]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_delay_grows_with_failures() {
        let mut state = RateState::new(config(600));
        let healthy = state.optimal_delay();

        for _ in 0..10 {
            state.record_attempt(RequestRecord::failure(
                Duration::from_millis(100),
                ErrorKind::ServerError,
            ));
        }
        assert!(state.optimal_delay() > healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimal_delay_always_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let cfg = RateLimitConfig {
            requests_per_minute: 30,
            requests_per_hour: 200,
            min_delay: Duration::from_millis(200),
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let mut state = RateState::new(cfg.clone());

        for _ in 0..3_000 {
            match rng.random_range(0..10) {
                0 => state.record_rate_limit_signal(None),
                1 => tokio::time::advance(Duration::from_secs(rng.random_range(0..90))).await,
                2 => state.adjust_base_delay(rng.random_range(0.1..4.0)),
                3..=5 => state.record_attempt(RequestRecord::failure(
                    Duration::from_millis(rng.random_range(0..5_000)),
                    ErrorKind::ALL[rng.random_range(0..ErrorKind::ALL.len())],
                )),
                _ => state.record_attempt(RequestRecord::success(Duration::from_millis(
                    rng.random_range(0..5_000),
                ))),
            }
            let delay = state.optimal_delay();
            assert!(delay >= cfg.min_delay && delay <= cfg.max_delay, "{:?}", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_cap() {
        let mut state = RateState::new(RateLimitConfig {
            max_records: 100,
            requests_per_minute: 10_000,
            ..Default::default()
        });
        for _ in 0..250 {
            state.record_attempt(RequestRecord::success(Duration::ZERO));
        }
        assert_eq!(state.record_count(), 100);
    }
}
