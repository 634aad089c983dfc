//! Performance Metrics and Auto-Optimization
//!
//! Observability for the router:
//! - Request counters, hit rate and error rate
//! - Rolling mean and latency percentiles
//! - Per-engine breakdown
//! - Bottleneck detection with severity and suggestions
//! - Threshold-triggered corrective actions with a cooldown
//!
//! ```text
//! route() --record_start--> RequestToken --record_end--> PerformanceMetric
//!                                                            |
//!           counters / histogram / ring buffer / engine stats / bottlenecks
//!                                                            |
//!                       scheduler tick --> alerts + AutoOptimizer::evaluate
//! ```

pub mod bottleneck;
pub mod collector;
pub mod dashboard;
pub mod histogram;
pub mod optimizer;

use std::time::Duration;

pub use bottleneck::{Bottleneck, BottleneckTracker, Severity};
pub use collector::{
    Alert, AlertLevel, EngineStats, MetricsCollector, PerformanceMetric, RequestToken,
    RollingMetrics,
};
pub use dashboard::{DashboardSnapshot, Percentiles, PerformanceSummary};
pub use histogram::{Counter, Histogram, HistogramSnapshot};
pub use optimizer::{AutoOptimizer, OptimizationOutcome, OptimizationTarget, TriggerReason};

/// Metrics and optimizer thresholds
#[derive(Clone, Debug, PartialEq)]
pub struct MetricsConfig {
    /// Target response time every threshold is relative to
    pub target: Duration,
    /// Capacity of the recent-metric ring buffer
    pub ring_capacity: usize,
    /// Share of requests appended to the ring buffer, in (0, 1]
    pub sample_rate: f64,
    /// Hit rate below which optimization triggers
    pub hit_rate_floor: f64,
    /// Requests needed before the hit rate is considered
    pub hit_rate_min_requests: u64,
    /// Error rate above which optimization triggers
    pub error_rate_ceiling: f64,
    /// Minimum time between optimization runs
    pub optimize_cooldown: Duration,
    /// Occurrences a slow pair needs before it is reported
    pub min_bottleneck_frequency: u64,
    /// Maximum retained alerts
    pub alert_limit: usize,
    /// Maximum retained optimization outcomes
    pub outcome_limit: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            target: Duration::from_millis(152),
            ring_capacity: 1000,
            sample_rate: 1.0,
            hit_rate_floor: 0.7,
            hit_rate_min_requests: 20,
            error_rate_ceiling: 0.05,
            optimize_cooldown: Duration::from_secs(300),
            min_bottleneck_frequency: 3,
            alert_limit: 50,
            outcome_limit: 20,
        }
    }
}

impl MetricsConfig {
    /// Target in whole milliseconds
    #[must_use]
    pub fn target_ms(&self) -> u64 {
        u64::try_from(self.target.as_millis()).unwrap_or(u64::MAX)
    }
}
