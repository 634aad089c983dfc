//! Threshold-triggered self-tuning
//!
//! The optimizer only decides *when* to act. The actions go through
//! [`OptimizationTarget`], which the router implements:
//!
//! 1. grow cache capacity
//! 2. warm the predictive tier with frequent patterns
//! 3. report bottlenecks

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::bottleneck::Bottleneck;
use super::collector::MetricsCollector;

/// Average latency above `target * SLOW_TRIGGER` triggers optimization
pub const SLOW_TRIGGER: f64 = 1.3;

/// Capacity growth factor applied per run
pub const GROWTH_FACTOR: f64 = 1.5;

/// Patterns re-warmed per run
pub const WARM_PATTERN_LIMIT: usize = 10;

/// Why an optimization run started
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerReason {
    /// Mean latency above the target
    SlowResponses {
        /// Mean latency in milliseconds
        avg_ms: f64,
        /// Target in milliseconds
        target_ms: u64,
    },
    /// Cache hit rate below the floor
    LowHitRate {
        /// Observed hit rate
        hit_rate: f64,
        /// Configured floor
        floor: f64,
    },
    /// Error rate above the ceiling
    HighErrorRate {
        /// Observed error rate
        error_rate: f64,
        /// Configured ceiling
        ceiling: f64,
    },
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlowResponses { avg_ms, target_ms } => {
                write!(f, "average {avg_ms:.1} ms over target {target_ms} ms")
            }
            Self::LowHitRate { hit_rate, floor } => {
                write!(f, "hit rate {hit_rate:.2} below {floor:.2}")
            }
            Self::HighErrorRate { error_rate, ceiling } => {
                write!(f, "error rate {error_rate:.3} above {ceiling:.3}")
            }
        }
    }
}

/// Result of one optimization run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationOutcome {
    /// When the run started
    pub triggered_at: DateTime<Utc>,
    /// Thresholds that were violated
    pub reasons: Vec<TriggerReason>,
    /// Total cache capacity after growth
    pub adjusted_capacity: usize,
    /// Patterns re-run through the engines
    pub warmed_patterns: usize,
    /// Bottlenecks logged for operators
    pub bottlenecks_reported: usize,
}

/// Component the optimizer adjusts
#[async_trait]
pub trait OptimizationTarget: Send + Sync {
    /// Grow cache tiers by `factor`, returning the new total capacity
    fn grow_cache(&self, factor: f64) -> usize;

    /// Re-run up to `limit` frequent patterns through the engines
    async fn warm_patterns(&self, limit: usize) -> usize;

    /// Current bottlenecks, most severe first
    fn bottleneck_report(&self) -> Vec<Bottleneck>;
}

/// Decides when to run corrective actions and keeps their history
#[derive(Debug, Default)]
pub struct AutoOptimizer {
    last_run: Mutex<Option<Instant>>,
    outcomes: Mutex<VecDeque<OptimizationOutcome>>,
}

impl AutoOptimizer {
    /// Optimizer that has never run
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Thresholds currently violated
    #[must_use]
    pub fn triggers(collector: &MetricsCollector) -> Vec<TriggerReason> {
        let config = collector.config();
        let rolling = collector.rolling();
        let target_ms = config.target_ms();
        let mut reasons = Vec::new();

        if rolling.total_requests == 0 {
            return reasons;
        }

        #[allow(clippy::cast_precision_loss)]
        let slow_threshold = SLOW_TRIGGER * target_ms as f64;
        if rolling.avg_response_time_ms > slow_threshold {
            reasons.push(TriggerReason::SlowResponses {
                avg_ms: rolling.avg_response_time_ms,
                target_ms,
            });
        }
        if rolling.total_requests >= config.hit_rate_min_requests
            && rolling.hit_rate < config.hit_rate_floor
        {
            reasons.push(TriggerReason::LowHitRate {
                hit_rate: rolling.hit_rate,
                floor: config.hit_rate_floor,
            });
        }
        if rolling.error_rate > config.error_rate_ceiling {
            reasons.push(TriggerReason::HighErrorRate {
                error_rate: rolling.error_rate,
                ceiling: config.error_rate_ceiling,
            });
        }
        reasons
    }

    /// Run corrective actions if a threshold is violated and the cooldown has passed
    pub async fn evaluate(
        &self,
        collector: &MetricsCollector,
        target: &dyn OptimizationTarget,
    ) -> Option<OptimizationOutcome> {
        let reasons = Self::triggers(collector);
        if reasons.is_empty() {
            return None;
        }

        let config = collector.config();
        {
            let mut last = self.last_run.lock();
            if let Some(at) = *last {
                if at.elapsed() < config.optimize_cooldown {
                    tracing::debug!("Optimization skipped: cooldown active");
                    return None;
                }
            }
            *last = Some(Instant::now());
        }

        let summary: Vec<String> = reasons.iter().map(ToString::to_string).collect();
        tracing::warn!(reasons = ?summary, "Auto-optimization triggered");

        let adjusted_capacity = target.grow_cache(GROWTH_FACTOR);
        let warmed_patterns = target.warm_patterns(WARM_PATTERN_LIMIT).await;
        let bottlenecks = target.bottleneck_report();
        for b in &bottlenecks {
            tracing::warn!(
                engine = %b.engine,
                operation = %b.operation,
                severity = ?b.severity,
                avg_delay_ms = b.avg_delay_ms,
                frequency = b.frequency,
                "Bottleneck"
            );
        }

        let outcome = OptimizationOutcome {
            triggered_at: Utc::now(),
            reasons,
            adjusted_capacity,
            warmed_patterns,
            bottlenecks_reported: bottlenecks.len(),
        };
        tracing::info!(
            adjusted_capacity,
            warmed_patterns,
            bottlenecks = outcome.bottlenecks_reported,
            "Optimization complete"
        );

        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(outcome.clone());
        while outcomes.len() > config.outcome_limit {
            outcomes.pop_front();
        }
        Some(outcome)
    }

    /// Retained outcomes, oldest first
    #[must_use]
    pub fn outcomes(&self) -> Vec<OptimizationOutcome> {
        self.outcomes.lock().iter().cloned().collect()
    }

    /// Forget the cooldown so the next evaluation may run immediately
    pub fn clear_cooldown(&self) {
        *self.last_run.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        grown: AtomicUsize,
        warmed: AtomicUsize,
    }

    #[async_trait]
    impl OptimizationTarget for Probe {
        fn grow_cache(&self, _factor: f64) -> usize {
            self.grown.fetch_add(1, Ordering::SeqCst);
            1500
        }

        async fn warm_patterns(&self, _limit: usize) -> usize {
            self.warmed.fetch_add(1, Ordering::SeqCst);
            4
        }

        fn bottleneck_report(&self) -> Vec<Bottleneck> {
            Vec::new()
        }
    }

    fn collector_with(latency_ms: u64, success: bool, count: usize) -> MetricsCollector {
        let collector = MetricsCollector::new(MetricsConfig {
            target: Duration::from_millis(100),
            ..Default::default()
        });
        for _ in 0..count {
            let token = collector.record_start("route");
            collector.record_end_with_latency(token, success, "remote", None, latency_ms);
        }
        collector
    }

    #[test]
    fn test_triggers() {
        let slow = collector_with(200, true, 5);
        assert!(matches!(
            AutoOptimizer::triggers(&slow).as_slice(),
            [TriggerReason::SlowResponses { .. }]
        ));

        // 20 misses breach the hit-rate floor; errors are zero
        let cold = collector_with(10, true, 20);
        assert!(matches!(
            AutoOptimizer::triggers(&cold).as_slice(),
            [TriggerReason::LowHitRate { .. }]
        ));

        let failing = collector_with(10, false, 3);
        assert!(matches!(
            AutoOptimizer::triggers(&failing).as_slice(),
            [TriggerReason::HighErrorRate { .. }]
        ));

        assert!(AutoOptimizer::triggers(&MetricsCollector::default()).is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_limits_runs() {
        let collector = collector_with(200, true, 5);
        let optimizer = AutoOptimizer::new();
        let probe = Probe::default();

        let outcome = optimizer.evaluate(&collector, &probe).await.unwrap();
        assert_eq!(outcome.adjusted_capacity, 1500);
        assert_eq!(outcome.warmed_patterns, 4);
        assert!(optimizer.evaluate(&collector, &probe).await.is_none());
        assert_eq!(probe.grown.load(Ordering::SeqCst), 1);

        optimizer.clear_cooldown();
        assert!(optimizer.evaluate(&collector, &probe).await.is_some());
        assert_eq!(optimizer.outcomes().len(), 2);
    }

    #[tokio::test]
    async fn test_no_run_when_healthy() {
        let collector = collector_with(10, true, 5);
        let optimizer = AutoOptimizer::new();
        let probe = Probe::default();
        assert!(optimizer.evaluate(&collector, &probe).await.is_none());
        assert_eq!(probe.warmed.load(Ordering::SeqCst), 0);
    }
}
