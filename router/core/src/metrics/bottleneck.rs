//! Slow (engine, operation) pairs

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// How much a bottleneck hurts overall latency
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Score up to 1.0
    Low,
    /// Score above 1.0
    Medium,
    /// Score above 2.0
    High,
    /// Score above 3.0
    Critical,
}

impl Severity {
    /// Map a weighted delay score to a level
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score > 3.0 {
            Self::Critical
        } else if score > 2.0 {
            Self::High
        } else if score > 1.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A reported bottleneck
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bottleneck {
    /// Slow engine
    pub engine: String,
    /// Operation label of the slow requests
    pub operation: String,
    /// Slow occurrences seen
    pub frequency: u64,
    /// Mean latency of the slow occurrences
    pub avg_delay_ms: f64,
    /// Severity band of the score
    pub severity: Severity,
    /// `(avg_delay / target) * (frequency / total_requests)`
    pub score: f64,
    /// Last slow occurrence
    pub last_seen: DateTime<Utc>,
    /// Remediation hints for operators
    pub suggestions: Vec<String>,
}

#[derive(Clone, Debug)]
struct SlowPair {
    engine: String,
    operation: String,
    frequency: u64,
    avg_delay_ms: f64,
    last_seen: DateTime<Utc>,
}

/// Records requests slower than `1.5 x target` per (engine, operation)
#[derive(Debug, Default)]
pub struct BottleneckTracker {
    pairs: DashMap<(String, String), SlowPair>,
}

/// Slowness factor relative to the target that marks a request as slow
pub const SLOW_FACTOR: f64 = 1.5;

impl BottleneckTracker {
    /// Empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request; fast requests are ignored
    pub fn observe(&self, engine: &str, operation: &str, latency_ms: u64, target_ms: u64) {
        #[allow(clippy::cast_precision_loss)]
        let (latency, target) = (latency_ms as f64, target_ms as f64);
        if latency <= SLOW_FACTOR * target {
            return;
        }

        let mut pair = self
            .pairs
            .entry((engine.to_string(), operation.to_string()))
            .or_insert_with(|| SlowPair {
                engine: engine.to_string(),
                operation: operation.to_string(),
                frequency: 0,
                avg_delay_ms: 0.0,
                last_seen: Utc::now(),
            });
        pair.frequency += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = pair.frequency as f64;
        pair.avg_delay_ms += (latency - pair.avg_delay_ms) / n;
        pair.last_seen = Utc::now();
    }

    /// Pairs seen more than `min_frequency` times, most severe first
    #[must_use]
    pub fn report(&self, target_ms: u64, total_requests: u64, min_frequency: u64) -> Vec<Bottleneck> {
        #[allow(clippy::cast_precision_loss)]
        let (target, total) = (target_ms.max(1) as f64, total_requests.max(1) as f64);

        let mut found: Vec<Bottleneck> = self
            .pairs
            .iter()
            .filter(|p| p.frequency > min_frequency)
            .map(|p| {
                #[allow(clippy::cast_precision_loss)]
                let score = (p.avg_delay_ms / target) * (p.frequency as f64 / total);
                Bottleneck {
                    engine: p.engine.clone(),
                    operation: p.operation.clone(),
                    frequency: p.frequency,
                    avg_delay_ms: p.avg_delay_ms,
                    severity: Severity::from_score(score),
                    score,
                    last_seen: p.last_seen,
                    suggestions: suggestions_for(&p.engine, p.avg_delay_ms / target),
                }
            })
            .collect();

        found.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.engine.cmp(&b.engine))
        });
        found
    }

    /// Drop pairs seen fewer than `min_frequency` times
    pub fn prune(&self, min_frequency: u64) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|_, p| p.frequency >= min_frequency);
        before - self.pairs.len()
    }

    /// Number of tracked slow pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no slow pair is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Forget all slow pairs
    pub fn clear(&self) {
        self.pairs.clear();
    }
}

fn suggestions_for(engine: &str, slowdown: f64) -> Vec<String> {
    let mut out = Vec::new();
    match engine {
        "remote" => {
            out.push("Route simple queries to local engines".to_string());
            out.push("Use raced execution so a local engine can answer first".to_string());
        }
        "fallback" => {
            out.push("Engines miss the deadline; check breaker status and engine health".to_string());
        }
        _ => {
            out.push(format!("Review response time of engine {engine}"));
        }
    }
    out.push("Pre-warm the predictive cache with frequent patterns".to_string());
    if slowdown > 3.0 {
        out.push("Lower this engine's timeout so fallbacks start sooner".to_string());
    }
    out
}
