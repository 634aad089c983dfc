//! Request accounting
//!
//! Every completed request is recorded exactly once: [`MetricsCollector::record_start`]
//! hands out a [`RequestToken`] that [`MetricsCollector::record_end`] consumes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::bottleneck::{Bottleneck, BottleneckTracker};
use super::dashboard::PerformanceSummary;
use super::histogram::{Histogram, HistogramSnapshot};
use super::MetricsConfig;
use crate::types::CacheTier;

/// Metrics considered by the target-achievement rate
pub const ACHIEVEMENT_WINDOW: usize = 50;

/// Metrics considered by the performance summary
pub const SUMMARY_WINDOW: usize = 100;

// ============================================================================
// Records
// ============================================================================

/// Proof that a request started; consumed when it ends
#[derive(Debug)]
#[must_use = "a request token must be passed to record_end"]
pub struct RequestToken {
    operation: String,
    started: Instant,
}

impl RequestToken {
    /// Operation label the request will be recorded under
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Relabel the operation once the request knows which path it took
    pub fn set_operation(&mut self, operation: impl Into<String>) {
        self.operation = operation.into();
    }

    /// Time since the request started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// One completed request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceMetric {
    /// Engine credited with the request
    pub engine: String,
    /// Path the request took
    pub operation: String,
    /// Latency in milliseconds
    pub response_time_ms: u64,
    /// Tier that served the request
    pub cache_hit: Option<CacheTier>,
    /// Whether the request got an answer
    pub success: bool,
    /// When the request finished
    pub timestamp: DateTime<Utc>,
}

/// Per-engine breakdown
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Requests credited to the engine
    pub requests: u64,
    /// Answered requests
    pub successes: u64,
    /// Failed requests
    pub failures: u64,
    /// Incremental mean latency
    pub avg_latency_ms: f64,
}

/// Point-in-time counters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RollingMetrics {
    /// Recorded requests
    pub total_requests: u64,
    /// Answered requests
    pub successes: u64,
    /// Failed requests
    pub failures: u64,
    /// Requests served from cache
    pub cache_hits: u64,
    /// Requests started but not yet recorded
    pub in_flight: u64,
    /// Mean latency in milliseconds
    pub avg_response_time_ms: f64,
    /// Cache hits over total requests
    pub hit_rate: f64,
    /// Failures over total requests
    pub error_rate: f64,
}

/// Alert severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational
    Info,
    /// Latency or hit-rate threshold crossed
    Warning,
    /// Error-rate ceiling crossed
    Critical,
}

/// A threshold violation observed during analysis
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    /// Severity
    pub level: AlertLevel,
    /// Human-readable description
    pub message: String,
    /// When the alert was raised
    pub at: DateTime<Utc>,
}

// ============================================================================
// Collector
// ============================================================================

/// Thread-safe metrics sink shared by all requests
pub struct MetricsCollector {
    config: RwLock<MetricsConfig>,

    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    in_flight: AtomicU64,
    /// Rolling mean as `f64` bits
    avg_bits: AtomicU64,

    latency: Histogram,
    recent: Mutex<VecDeque<PerformanceMetric>>,
    engines: DashMap<String, EngineStats>,
    bottlenecks: BottleneckTracker,
    alerts: Mutex<VecDeque<Alert>>,
}

impl MetricsCollector {
    /// Collector with the given thresholds
    pub fn new(config: MetricsConfig) -> Self {
        let ring = config.ring_capacity;
        Self {
            config: RwLock::new(config),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            avg_bits: AtomicU64::new(0.0_f64.to_bits()),
            latency: Histogram::latency_default(),
            recent: Mutex::new(VecDeque::with_capacity(ring.min(4096))),
            engines: DashMap::new(),
            bottlenecks: BottleneckTracker::new(),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Current thresholds
    #[must_use]
    pub fn config(&self) -> MetricsConfig {
        self.config.read().clone()
    }

    /// Replace all thresholds
    pub fn set_config(&self, config: MetricsConfig) {
        *self.config.write() = config;
    }

    /// Change the target every threshold is relative to
    pub fn set_target(&self, target: Duration) {
        self.config.write().target = target;
    }

    /// Target in milliseconds
    #[must_use]
    pub fn target_ms(&self) -> u64 {
        self.config.read().target_ms()
    }

    /// Mark a request as started
    pub fn record_start(&self, operation: impl Into<String>) -> RequestToken {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        RequestToken {
            operation: operation.into(),
            started: Instant::now(),
        }
    }

    /// Record a finished request, measuring latency from the token
    pub fn record_end(
        &self,
        token: RequestToken,
        success: bool,
        engine: &str,
        cache_hit: Option<CacheTier>,
    ) -> PerformanceMetric {
        let elapsed = u64::try_from(token.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.record_end_with_latency(token, success, engine, cache_hit, elapsed)
    }

    /// Record a finished request with an externally measured latency
    pub fn record_end_with_latency(
        &self,
        token: RequestToken,
        success: bool,
        engine: &str,
        cache_hit: Option<CacheTier>,
        latency_ms: u64,
    ) -> PerformanceMetric {
        let (target_ms, sample_rate, ring_capacity) = {
            let config = self.config.read();
            (config.target_ms(), config.sample_rate, config.ring_capacity)
        };

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        let n = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if cache_hit.is_some() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.update_mean(latency_ms, n);
        self.latency.record(latency_ms);

        {
            let mut stats = self.engines.entry(engine.to_string()).or_default();
            stats.requests += 1;
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            #[allow(clippy::cast_precision_loss)]
            let count = stats.requests as f64;
            #[allow(clippy::cast_precision_loss)]
            let sample = latency_ms as f64;
            stats.avg_latency_ms += (sample - stats.avg_latency_ms) / count;
        }

        self.bottlenecks
            .observe(engine, &token.operation, latency_ms, target_ms);

        let metric = PerformanceMetric {
            engine: engine.to_string(),
            operation: token.operation,
            response_time_ms: latency_ms,
            cache_hit,
            success,
            timestamp: Utc::now(),
        };

        if sample_rate >= 1.0 || rand::random::<f64>() < sample_rate {
            let mut recent = self.recent.lock();
            recent.push_back(metric.clone());
            while recent.len() > ring_capacity {
                recent.pop_front();
            }
        }

        metric
    }

    fn update_mean(&self, sample_ms: u64, n: u64) {
        #[allow(clippy::cast_precision_loss)]
        let (sample, count) = (sample_ms as f64, n as f64);
        let mut current = self.avg_bits.load(Ordering::Relaxed);
        loop {
            let mean = f64::from_bits(current);
            let next = mean + (sample - mean) / count;
            match self.avg_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Derived values
    // ------------------------------------------------------------------------

    /// Current counters
    #[must_use]
    pub fn rolling(&self) -> RollingMetrics {
        let total = self.total.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        RollingMetrics {
            total_requests: total,
            successes: self.successes.load(Ordering::Relaxed),
            failures,
            cache_hits,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            avg_response_time_ms: f64::from_bits(self.avg_bits.load(Ordering::Relaxed)),
            hit_rate: ratio(cache_hits, total),
            error_rate: ratio(failures, total),
        }
    }

    /// Recorded requests
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Mean latency of every recorded request
    #[must_use]
    pub fn avg_response_time_ms(&self) -> f64 {
        f64::from_bits(self.avg_bits.load(Ordering::Relaxed))
    }

    /// Cache hits over total requests
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        ratio(
            self.cache_hits.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Failures over total requests
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        ratio(
            self.failures.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Latency histogram snapshot
    #[must_use]
    pub fn latency(&self) -> HistogramSnapshot {
        self.latency.snapshot()
    }

    /// Per-engine stats sorted by engine id
    #[must_use]
    pub fn engine_stats(&self) -> Vec<(String, EngineStats)> {
        let mut stats: Vec<_> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Up to `limit` most recent sampled metrics, oldest first
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<PerformanceMetric> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Share of the last 50 sampled requests that met the target
    #[must_use]
    pub fn target_achievement_rate(&self) -> f64 {
        let target = self.target_ms();
        let window = self.recent(ACHIEVEMENT_WINDOW);
        let met = window
            .iter()
            .filter(|m| m.response_time_ms <= target)
            .count();
        ratio(met as u64, window.len() as u64)
    }

    /// Summary of the last 100 sampled requests with suggestions
    #[must_use]
    pub fn performance_summary(&self) -> PerformanceSummary {
        PerformanceSummary::from_window(&self.recent(SUMMARY_WINDOW), self.target_ms())
    }

    /// Reported bottlenecks, most severe first
    #[must_use]
    pub fn bottlenecks(&self, limit: usize) -> Vec<Bottleneck> {
        let config = self.config.read();
        let mut report = self.bottlenecks.report(
            config.target_ms(),
            self.total_requests(),
            config.min_bottleneck_frequency,
        );
        report.truncate(limit);
        report
    }

    /// Drop rarely seen slow pairs
    pub fn prune_bottlenecks(&self) -> usize {
        let min = self.config.read().min_bottleneck_frequency;
        self.bottlenecks.prune(min)
    }

    // ------------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------------

    /// Compare current values with thresholds and store any alerts raised
    pub fn check_alerts(&self) -> Vec<Alert> {
        let config = self.config();
        let rolling = self.rolling();
        #[allow(clippy::cast_precision_loss)]
        let target = config.target_ms() as f64;
        let mut raised = Vec::new();

        if rolling.total_requests > 0 && rolling.avg_response_time_ms > target {
            raised.push(Alert {
                level: AlertLevel::Warning,
                message: format!(
                    "Average response time {:.1} ms exceeds target {target} ms",
                    rolling.avg_response_time_ms
                ),
                at: Utc::now(),
            });
        }
        if rolling.total_requests >= config.hit_rate_min_requests
            && rolling.hit_rate < config.hit_rate_floor
        {
            raised.push(Alert {
                level: AlertLevel::Warning,
                message: format!(
                    "Cache hit rate {:.1}% below {:.1}%",
                    rolling.hit_rate * 100.0,
                    config.hit_rate_floor * 100.0
                ),
                at: Utc::now(),
            });
        }
        if rolling.total_requests > 0 && rolling.error_rate > config.error_rate_ceiling {
            raised.push(Alert {
                level: AlertLevel::Critical,
                message: format!(
                    "Error rate {:.1}% above {:.1}%",
                    rolling.error_rate * 100.0,
                    config.error_rate_ceiling * 100.0
                ),
                at: Utc::now(),
            });
        }

        if !raised.is_empty() {
            let mut alerts = self.alerts.lock();
            for alert in &raised {
                tracing::warn!(level = ?alert.level, "{}", alert.message);
                alerts.push_back(alert.clone());
            }
            while alerts.len() > config.alert_limit {
                alerts.pop_front();
            }
        }
        raised
    }

    /// Retained alerts, oldest first
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Reset every counter and buffer
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.avg_bits.store(0.0_f64.to_bits(), Ordering::Relaxed);
        self.latency.reset();
        self.recent.lock().clear();
        self.engines.clear();
        self.bottlenecks.clear();
        self.alerts.lock().clear();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("rolling", &self.rolling())
            .field("engines", &self.engines.len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counts_and_rates() {
        let collector = MetricsCollector::default();
        for i in 0..10 {
            let token = collector.record_start("route");
            let hit = (i < 4).then_some(CacheTier::Exact);
            collector.record_end_with_latency(token, i != 9, "local-fast", hit, 10);
        }
        let r = collector.rolling();
        assert_eq!(r.total_requests, 10);
        assert_eq!(r.successes, 9);
        assert_eq!(r.failures, 1);
        assert_eq!(r.in_flight, 0);
        assert!((r.hit_rate - 0.4).abs() < 1e-9);
        assert!((r.error_rate - 0.1).abs() < 1e-9);
        assert!((r.avg_response_time_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_incremental_mean() {
        let collector = MetricsCollector::default();
        for latency in [10, 20, 30, 40] {
            let token = collector.record_start("route");
            collector.record_end_with_latency(token, true, "remote", None, latency);
        }
        assert!((collector.avg_response_time_ms() - 25.0).abs() < 1e-9);
        let stats = collector.engine_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].1.requests, 4);
        assert!((stats[0].1.avg_latency_ms - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_bottlenecks_use_relabeled_operation() {
        let collector = MetricsCollector::new(MetricsConfig {
            min_bottleneck_frequency: 0,
            ..Default::default()
        });
        for _ in 0..3 {
            let mut token = collector.record_start("route");
            token.set_operation("fallback_loop");
            collector.record_end_with_latency(token, true, "remote", None, 1_000);
        }

        let report = collector.bottlenecks(5);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].engine, "remote");
        assert_eq!(report[0].operation, "fallback_loop");
        assert_eq!(collector.recent(1)[0].operation, "fallback_loop");
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let collector = MetricsCollector::new(MetricsConfig {
            ring_capacity: 5,
            ..Default::default()
        });
        for latency in 0..8 {
            let token = collector.record_start("route");
            collector.record_end_with_latency(token, true, "e", None, latency);
        }
        let recent = collector.recent(100);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].response_time_ms, 3);
        assert_eq!(collector.total_requests(), 8);
    }

    #[test]
    fn test_sampling_only_affects_ring() {
        let collector = MetricsCollector::new(MetricsConfig {
            sample_rate: 0.000_001,
            ..Default::default()
        });
        for _ in 0..50 {
            let token = collector.record_start("route");
            collector.record_end_with_latency(token, true, "e", None, 1);
        }
        let r = collector.rolling();
        assert_eq!(r.total_requests, 50);
        assert_eq!(r.successes + r.failures, 50);
        assert!(collector.recent(100).len() < 50);
    }

    #[test]
    fn test_target_achievement() {
        let collector = MetricsCollector::new(MetricsConfig {
            target: Duration::from_millis(100),
            ..Default::default()
        });
        for latency in [50, 80, 150, 90] {
            let token = collector.record_start("route");
            collector.record_end_with_latency(token, true, "e", None, latency);
        }
        assert!((collector.target_achievement_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_alerts_bounded() {
        let collector = MetricsCollector::new(MetricsConfig {
            target: Duration::from_millis(10),
            alert_limit: 3,
            ..Default::default()
        });
        let token = collector.record_start("route");
        collector.record_end_with_latency(token, false, "remote", None, 500);
        for _ in 0..5 {
            assert!(!collector.check_alerts().is_empty());
        }
        assert_eq!(collector.alerts().len(), 3);
    }

    #[test]
    fn test_no_alerts_when_healthy() {
        let collector = MetricsCollector::default();
        let token = collector.record_start("route");
        collector.record_end_with_latency(token, true, "local-fast", Some(CacheTier::Exact), 1);
        assert!(collector.check_alerts().is_empty());
    }

    #[test]
    fn test_parallel_accounting() {
        let collector = Arc::new(MetricsCollector::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let token = c.record_start("route");
                        c.record_end_with_latency(token, (i + t) % 3 != 0, "e", None, 5);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let r = collector.rolling();
        assert_eq!(r.total_requests, 800);
        assert_eq!(r.successes + r.failures, 800);
        assert!((r.avg_response_time_ms - 5.0).abs() < 1e-9);
    }
}
