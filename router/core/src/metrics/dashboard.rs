//! Read-only observability snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::bottleneck::Bottleneck;
use super::collector::{ratio, Alert, EngineStats, PerformanceMetric, RollingMetrics};
use super::histogram::HistogramSnapshot;
use super::optimizer::OptimizationOutcome;
use crate::breaker::BreakerStatus;
use crate::cache::TierStats;

/// Latency percentiles in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    /// Median
    pub p50: u64,
    /// 90th percentile
    pub p90: u64,
    /// 99th percentile
    pub p99: u64,
}

impl From<&HistogramSnapshot> for Percentiles {
    fn from(snapshot: &HistogramSnapshot) -> Self {
        Self {
            p50: snapshot.p50(),
            p90: snapshot.p90(),
            p99: snapshot.p99(),
        }
    }
}

/// Summary of a window of recent requests
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    /// Requests in the window
    pub requests: usize,
    /// Mean latency
    pub avg_response_time_ms: f64,
    /// Slowest request
    pub max_response_time_ms: u64,
    /// Share of requests within the target
    pub target_met_rate: f64,
    /// Share served from cache
    pub cache_hit_rate: f64,
    /// Share answered
    pub success_rate: f64,
    /// Engine with the highest mean latency in the window
    pub slowest_engine: Option<String>,
    /// Operator hints derived from the window
    pub suggestions: Vec<String>,
}

impl PerformanceSummary {
    /// Summarize `window` against `target_ms`
    #[must_use]
    pub fn from_window(window: &[PerformanceMetric], target_ms: u64) -> Self {
        if window.is_empty() {
            return Self::default();
        }
        let count = window.len() as u64;
        let total_ms: u64 = window.iter().map(|m| m.response_time_ms).sum();
        let met = window.iter().filter(|m| m.response_time_ms <= target_ms).count() as u64;
        let hits = window.iter().filter(|m| m.cache_hit.is_some()).count() as u64;
        let ok = window.iter().filter(|m| m.success).count() as u64;

        let mut per_engine: std::collections::BTreeMap<&str, (u64, u64)> = Default::default();
        for m in window {
            let slot = per_engine.entry(m.engine.as_str()).or_default();
            slot.0 += m.response_time_ms;
            slot.1 += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        let slowest_engine = per_engine
            .iter()
            .map(|(engine, (sum, n))| (*engine, *sum as f64 / *n as f64))
            .fold(None, |best: Option<(&str, f64)>, (engine, mean)| match best {
                Some((_, m)) if m >= mean => best,
                _ => Some((engine, mean)),
            })
            .map(|(engine, _)| engine.to_string());

        let mut summary = Self {
            requests: window.len(),
            avg_response_time_ms: ratio(total_ms, count),
            max_response_time_ms: window.iter().map(|m| m.response_time_ms).max().unwrap_or(0),
            target_met_rate: ratio(met, count),
            cache_hit_rate: ratio(hits, count),
            success_rate: ratio(ok, count),
            slowest_engine,
            suggestions: Vec::new(),
        };
        summary.suggestions = summary.suggest(target_ms);
        summary
    }

    fn suggest(&self, target_ms: u64) -> Vec<String> {
        let mut out = Vec::new();
        if self.target_met_rate < 0.9 {
            out.push(format!(
                "Only {:.0}% of requests met the {target_ms} ms target; prefer local engines for simple queries",
                self.target_met_rate * 100.0
            ));
        }
        if self.cache_hit_rate < 0.7 {
            out.push("Cache hit rate is low; warm the predictive tier with frequent patterns".to_string());
        }
        if self.success_rate < 0.95 {
            out.push("Failure rate is elevated; check breaker status and engine health".to_string());
        }
        if let Some(engine) = &self.slowest_engine {
            if self.max_response_time_ms > target_ms.saturating_mul(2) {
                out.push(format!("Engine {engine} is the slowest; consider racing it against a local engine"));
            }
        }
        out
    }
}

/// Everything an operator needs in one serializable value
#[derive(Clone, Debug, Serialize)]
pub struct DashboardSnapshot {
    /// When the snapshot was taken
    pub generated_at: DateTime<Utc>,
    /// Target the snapshot is measured against
    pub target_ms: u64,
    /// Counters since start
    pub rolling: RollingMetrics,
    /// Latency percentiles
    pub percentiles: Percentiles,
    /// Per-engine stats sorted by id
    pub engines: Vec<(String, EngineStats)>,
    /// Worst bottlenecks first
    pub bottlenecks: Vec<Bottleneck>,
    /// Retained alerts, oldest first
    pub alerts: Vec<Alert>,
    /// Per-tier cache stats
    pub cache: Vec<TierStats>,
    /// Breaker states and recent events
    pub breakers: BreakerStatus,
    /// Share of the last 50 requests within the target
    pub target_achievement_rate: f64,
    /// Summary of the recent window
    pub summary: PerformanceSummary,
    /// Recent optimizer runs
    pub optimizations: Vec<OptimizationOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheTier;

    fn metric(engine: &str, ms: u64, hit: bool, success: bool) -> PerformanceMetric {
        PerformanceMetric {
            engine: engine.to_string(),
            operation: "route".to_string(),
            response_time_ms: ms,
            cache_hit: hit.then_some(CacheTier::Exact),
            success,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_window() {
        let summary = PerformanceSummary::from_window(&[], 100);
        assert_eq!(summary.requests, 0);
        assert!(summary.suggestions.is_empty());
    }

    #[test]
    fn test_healthy_window_has_no_suggestions() {
        let window: Vec<_> = (0..10).map(|_| metric("local-fast", 5, true, true)).collect();
        let summary = PerformanceSummary::from_window(&window, 100);
        assert!((summary.target_met_rate - 1.0).abs() < 1e-9);
        assert!(summary.suggestions.is_empty(), "{:?}", summary.suggestions);
    }

    #[test]
    fn test_slow_window_suggests() {
        let window = vec![
            metric("local-fast", 10, false, true),
            metric("remote", 900, false, true),
            metric("remote", 700, false, false),
        ];
        let summary = PerformanceSummary::from_window(&window, 100);
        assert_eq!(summary.slowest_engine.as_deref(), Some("remote"));
        assert_eq!(summary.max_response_time_ms, 900);
        assert!(summary.suggestions.len() >= 3);
    }
}
