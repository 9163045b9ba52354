/*!
 * Rolling-window analytics
 *
 * Raw per-attempt records accumulate into a window that is closed on every
 * aggregation tick. Closed windows feed alerts and, on a slower tick,
 * confidence-scored tuning recommendations for the optimizer.
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pacekeeper_core_resilience::RequestRecord;

/// Success rate below which a window raises an alert
const ALERT_SUCCESS_RATE: f64 = 0.8;
/// Success rate below which that alert is critical
const CRITICAL_SUCCESS_RATE: f64 = 0.5;
/// Rate-limit hit ratio above which a window raises an alert
const ALERT_RATE_LIMIT_RATIO: f64 = 0.05;
/// Relative change treated as noise when computing trends
const TREND_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub aggregation_interval: Duration,
    pub recommendation_interval: Duration,
    /// How far back recommendations look
    pub learning_window: Duration,
    /// How long closed windows are kept
    pub retention: Duration,
    pub alert_ttl: Duration,
    pub latency_threshold: Duration,
    /// Recommendations below this confidence are withheld
    pub confidence_threshold: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            aggregation_interval: Duration::from_secs(60),
            recommendation_interval: Duration::from_secs(300),
            learning_window: Duration::from_secs(1800),
            retention: Duration::from_secs(86_400),
            alert_ttl: Duration::from_secs(300),
            latency_threshold: Duration::from_secs(5),
            confidence_threshold: 0.75,
        }
    }
}

/// One closed aggregation window
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedWindow {
    pub window_start: DateTime<Utc>,
    #[serde(skip)]
    pub closed_at: Instant,
    pub duration_ms: u64,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limit_hits: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Requests per second over the window
    pub throughput: f64,
}

impl AggregatedWindow {
    pub fn success_rate(&self) -> f64 {
        ratio(self.successes, self.total_requests)
    }

    pub fn rate_limit_ratio(&self) -> f64 {
        ratio(self.rate_limit_hits, self.total_requests)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowSuccessRate,
    RateLimitPressure,
    HighLatency,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub raised_at: DateTime<Utc>,
    #[serde(skip)]
    pub raised: Instant,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    RateLimit,
    ResponseTime,
    SuccessRate,
    Throughput,
}

impl fmt::Display for RecommendationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationKind::RateLimit => write!(f, "rate_limit"),
            RecommendationKind::ResponseTime => write!(f, "response_time"),
            RecommendationKind::SuccessRate => write!(f, "success_rate"),
            RecommendationKind::Throughput => write!(f, "throughput"),
        }
    }
}

/// A concrete tuning step the optimizer can apply
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SuggestedAction {
    IncreaseDelay { factor: f64 },
    DecreaseDelay { factor: f64 },
    ReduceConcurrency,
    IncreaseConcurrency,
    EnterConservative,
    LeaveConservative,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub severity: Severity,
    pub rationale: String,
    pub suggested_actions: Vec<SuggestedAction>,
    /// In [0, 1], grows with the number of requests behind it
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceClass {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for PerformanceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceClass::Excellent => write!(f, "excellent"),
            PerformanceClass::Good => write!(f, "good"),
            PerformanceClass::Fair => write!(f, "fair"),
            PerformanceClass::Poor => write!(f, "poor"),
        }
    }
}

/// Performance over the learning window
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub class: PerformanceClass,
    pub success_rate: f64,
    pub rate_limit_rate: f64,
    pub avg_latency_ms: f64,
    pub success_trend: Trend,
    pub latency_trend: Trend,
    pub throughput_trend: Trend,
    pub total_requests: u64,
    pub windows: usize,
}

/// Dashboard view of the analytics state
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub windows: usize,
    pub current_window_requests: u64,
    pub last_window: Option<AggregatedWindow>,
    pub active_alerts: Vec<Alert>,
}

#[derive(Debug)]
struct Accumulator {
    started: Instant,
    started_at: DateTime<Utc>,
    count: u64,
    successes: u64,
    failures: u64,
    rate_limit_hits: u64,
    latency_sum: Duration,
    min_latency: Option<Duration>,
    max_latency: Duration,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            count: 0,
            successes: 0,
            failures: 0,
            rate_limit_hits: 0,
            latency_sum: Duration::ZERO,
            min_latency: None,
            max_latency: Duration::ZERO,
        }
    }

    fn add(&mut self, record: &RequestRecord) {
        self.count += 1;
        if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if record.rate_limit_hit {
            self.rate_limit_hits += 1;
        }
        self.latency_sum += record.latency;
        self.min_latency = Some(self.min_latency.map_or(record.latency, |m| m.min(record.latency)));
        self.max_latency = self.max_latency.max(record.latency);
    }

    fn close(&self, now: Instant) -> AggregatedWindow {
        let duration = now.duration_since(self.started);
        let secs = duration.as_secs_f64();
        AggregatedWindow {
            window_start: self.started_at,
            closed_at: now,
            duration_ms: duration.as_millis() as u64,
            total_requests: self.count,
            successes: self.successes,
            failures: self.failures,
            rate_limit_hits: self.rate_limit_hits,
            avg_latency_ms: self.latency_sum.as_secs_f64() * 1000.0 / self.count.max(1) as f64,
            min_latency_ms: self.min_latency.unwrap_or_default().as_millis() as u64,
            max_latency_ms: self.max_latency.as_millis() as u64,
            throughput: if secs > 0.0 {
                self.count as f64 / secs
            } else {
                self.count as f64
            },
        }
    }
}

/// Window aggregator, alert source and recommendation engine
#[derive(Debug)]
pub struct Analytics {
    config: AnalyticsConfig,
    current: Accumulator,
    windows: VecDeque<AggregatedWindow>,
    alerts: Vec<Alert>,
    latest: Vec<Recommendation>,
    report: Option<PerformanceReport>,
    generation: u64,
}

impl Analytics {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self {
            config,
            current: Accumulator::new(),
            windows: VecDeque::new(),
            alerts: Vec::new(),
            latest: Vec::new(),
            report: None,
            generation: 0,
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Add one completed attempt to the current window
    pub fn record(&mut self, record: &RequestRecord) {
        self.current.add(record);
    }

    /// Close the current window. Does nothing when it holds no requests.
    pub fn aggregate(&mut self) -> Option<AggregatedWindow> {
        if self.current.count == 0 {
            return None;
        }

        let now = Instant::now();
        let window = self.current.close(now);
        self.current = Accumulator::new();

        debug!(
            requests = window.total_requests,
            success_rate = window.success_rate(),
            avg_latency_ms = window.avg_latency_ms,
            "Window aggregated"
        );

        self.raise_alerts(&window);
        self.windows.push_back(window.clone());

        let retention = self.config.retention;
        while self
            .windows
            .front()
            .is_some_and(|w| now.duration_since(w.closed_at) > retention)
        {
            self.windows.pop_front();
        }
        let ttl = self.config.alert_ttl;
        self.alerts.retain(|a| now.duration_since(a.raised) < ttl);

        Some(window)
    }

    fn raise_alerts(&mut self, window: &AggregatedWindow) {
        let success_rate = window.success_rate();
        if success_rate < ALERT_SUCCESS_RATE {
            let severity = if success_rate < CRITICAL_SUCCESS_RATE {
                Severity::Critical
            } else {
                Severity::Warning
            };
            self.push_alert(
                AlertKind::LowSuccessRate,
                severity,
                format!("success rate {:.1}% in last window", success_rate * 100.0),
            );
        }

        let rate_limit_ratio = window.rate_limit_ratio();
        if rate_limit_ratio > ALERT_RATE_LIMIT_RATIO {
            self.push_alert(
                AlertKind::RateLimitPressure,
                Severity::Warning,
                format!("{:.1}% of requests rate limited", rate_limit_ratio * 100.0),
            );
        }

        let threshold_ms = self.config.latency_threshold.as_secs_f64() * 1000.0;
        if window.avg_latency_ms > threshold_ms {
            self.push_alert(
                AlertKind::HighLatency,
                Severity::Warning,
                format!("average latency {:.0}ms over {:.0}ms", window.avg_latency_ms, threshold_ms),
            );
        }
    }

    fn push_alert(&mut self, kind: AlertKind, severity: Severity, message: String) {
        warn!(kind = ?kind, severity = %severity, "{}", message);
        self.alerts.push(Alert {
            raised_at: Utc::now(),
            raised: Instant::now(),
            kind,
            severity,
            message,
        });
    }

    /// Alerts raised within the alert TTL
    pub fn active_alerts(&self) -> Vec<Alert> {
        let ttl = self.config.alert_ttl;
        self.alerts
            .iter()
            .filter(|a| a.raised.elapsed() < ttl)
            .cloned()
            .collect()
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Rebuild the performance report and recommendations from the learning window.
    ///
    /// Returns every recommendation regardless of confidence.
    pub fn generate_recommendations(&mut self) -> Vec<Recommendation> {
        self.generation += 1;
        let now = Instant::now();
        let learning_window = self.config.learning_window;
        let windows: Vec<&AggregatedWindow> = self
            .windows
            .iter()
            .filter(|w| now.duration_since(w.closed_at) <= learning_window)
            .collect();

        let Some(report) = build_report(&windows) else {
            self.latest.clear();
            self.report = None;
            return Vec::new();
        };

        let recommendations = recommend(&report, self.config.latency_threshold);
        info!(
            class = %report.class,
            total_requests = report.total_requests,
            recommendations = recommendations.len(),
            "Performance analyzed"
        );

        self.report = Some(report);
        self.latest = recommendations.clone();
        recommendations
    }

    /// Latest recommendations at or above the confidence threshold
    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.recommendations_above(self.config.confidence_threshold)
    }

    pub fn recommendations_above(&self, threshold: f64) -> Vec<Recommendation> {
        self.latest
            .iter()
            .filter(|r| r.confidence >= threshold)
            .cloned()
            .collect()
    }

    /// Bumped on every recommendation run
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn report(&self) -> Option<&PerformanceReport> {
        self.report.as_ref()
    }

    pub fn summary(&self) -> AnalyticsSummary {
        AnalyticsSummary {
            windows: self.windows.len(),
            current_window_requests: self.current.count,
            last_window: self.windows.back().cloned(),
            active_alerts: self.active_alerts(),
        }
    }
}

fn build_report(windows: &[&AggregatedWindow]) -> Option<PerformanceReport> {
    let total: u64 = windows.iter().map(|w| w.total_requests).sum();
    if total == 0 {
        return None;
    }
    let successes: u64 = windows.iter().map(|w| w.successes).sum();
    let hits: u64 = windows.iter().map(|w| w.rate_limit_hits).sum();
    let avg_latency_ms = windows
        .iter()
        .map(|w| w.avg_latency_ms * w.total_requests as f64)
        .sum::<f64>()
        / total as f64;

    let success_rate = ratio(successes, total);
    let rate_limit_rate = ratio(hits, total);

    Some(PerformanceReport {
        class: classify(success_rate, rate_limit_rate, avg_latency_ms),
        success_rate,
        rate_limit_rate,
        avg_latency_ms,
        success_trend: trend(windows, |w| w.success_rate(), true),
        latency_trend: trend(windows, |w| w.avg_latency_ms, false),
        throughput_trend: trend(windows, |w| w.throughput, true),
        total_requests: total,
        windows: windows.len(),
    })
}

fn classify(success_rate: f64, rate_limit_rate: f64, avg_latency_ms: f64) -> PerformanceClass {
    if success_rate >= 0.98 && rate_limit_rate < 0.01 && avg_latency_ms < 1000.0 {
        PerformanceClass::Excellent
    } else if success_rate >= 0.95 && rate_limit_rate < 0.03 && avg_latency_ms < 2000.0 {
        PerformanceClass::Good
    } else if success_rate >= 0.85 && rate_limit_rate < 0.1 {
        PerformanceClass::Fair
    } else {
        PerformanceClass::Poor
    }
}

/// Compare the most recent third of windows with the earliest third
fn trend(windows: &[&AggregatedWindow], metric: impl Fn(&AggregatedWindow) -> f64, higher_is_better: bool) -> Trend {
    let third = windows.len() / 3;
    if third == 0 {
        return Trend::Stable;
    }
    let mean = |slice: &[&AggregatedWindow]| slice.iter().map(|w| metric(w)).sum::<f64>() / slice.len() as f64;
    let early = mean(&windows[..third]);
    let recent = mean(&windows[windows.len() - third..]);

    let change = if early.abs() < f64::EPSILON {
        if recent.abs() < f64::EPSILON {
            0.0
        } else {
            1.0
        }
    } else {
        (recent - early) / early.abs()
    };

    if change.abs() < TREND_TOLERANCE {
        Trend::Stable
    } else if (change > 0.0) == higher_is_better {
        Trend::Improving
    } else {
        Trend::Degrading
    }
}

fn recommend(report: &PerformanceReport, latency_threshold: Duration) -> Vec<Recommendation> {
    let confidence = (report.total_requests as f64 / 100.0).min(1.0);
    let threshold_ms = latency_threshold.as_secs_f64() * 1000.0;
    let mut out = Vec::new();

    if report.rate_limit_rate > ALERT_RATE_LIMIT_RATIO {
        let critical = report.rate_limit_rate > 0.15;
        let mut actions = vec![
            SuggestedAction::IncreaseDelay { factor: 1.5 },
            SuggestedAction::ReduceConcurrency,
        ];
        if critical {
            actions.push(SuggestedAction::EnterConservative);
        }
        out.push(Recommendation {
            kind: RecommendationKind::RateLimit,
            severity: if critical { Severity::Critical } else { Severity::Warning },
            rationale: format!(
                "{:.1}% of requests hit the rate limit",
                report.rate_limit_rate * 100.0
            ),
            suggested_actions: actions,
            confidence,
        });
    }

    if report.avg_latency_ms > threshold_ms {
        out.push(Recommendation {
            kind: RecommendationKind::ResponseTime,
            severity: Severity::Warning,
            rationale: format!(
                "average latency {:.0}ms exceeds {:.0}ms",
                report.avg_latency_ms, threshold_ms
            ),
            suggested_actions: vec![
                SuggestedAction::ReduceConcurrency,
                SuggestedAction::IncreaseDelay { factor: 1.2 },
            ],
            confidence,
        });
    } else if report.latency_trend == Trend::Degrading {
        out.push(Recommendation {
            kind: RecommendationKind::ResponseTime,
            severity: Severity::Info,
            rationale: format!("latency trending up, now {:.0}ms", report.avg_latency_ms),
            suggested_actions: vec![SuggestedAction::IncreaseDelay { factor: 1.1 }],
            confidence,
        });
    }

    if report.success_rate < 0.9 {
        out.push(Recommendation {
            kind: RecommendationKind::SuccessRate,
            severity: if report.success_rate < 0.7 {
                Severity::Critical
            } else {
                Severity::Warning
            },
            rationale: format!("success rate {:.1}%", report.success_rate * 100.0),
            suggested_actions: vec![
                SuggestedAction::IncreaseDelay { factor: 1.3 },
                SuggestedAction::ReduceConcurrency,
            ],
            confidence,
        });
    }

    if report.class >= PerformanceClass::Good
        && report.rate_limit_rate == 0.0
        && report.avg_latency_ms < threshold_ms / 2.0
        && report.success_trend != Trend::Degrading
    {
        out.push(Recommendation {
            kind: RecommendationKind::Throughput,
            severity: Severity::Info,
            rationale: format!(
                "{} performance with no rate limiting, headroom available",
                report.class
            ),
            suggested_actions: vec![
                SuggestedAction::DecreaseDelay { factor: 0.8 },
                SuggestedAction::IncreaseConcurrency,
                SuggestedAction::LeaveConservative,
            ],
            confidence,
        });
    }

    out
}
