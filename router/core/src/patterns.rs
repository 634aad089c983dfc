//! Query Pattern Learning
//!
//! Tracks how often each normalized pattern is seen and how long it takes to
//! answer. Feeds warm-up of the predictive tier and related-query
//! suggestions.
//!
//! The tracker holds at most a fixed number of patterns. Recording a new
//! pattern into a full tracker first drops the least used tenth, rarest and
//! stalest first.

use std::cmp::Reverse;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::normalizer::NormalizedQuery;

/// Maximum number of related queries returned by [`PatternTracker::predict_related`]
pub const MAX_RELATED: usize = 3;

/// Default cap on tracked patterns
pub const DEFAULT_MAX_PATTERNS: usize = 10_000;

/// Usage statistics for one normalized pattern
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryPattern {
    /// Stable hash of the template
    pub id: String,
    /// Generalized template
    pub template: String,
    /// Times this pattern was processed
    pub frequency: u64,
    /// Incremental mean of response times
    pub avg_response_time_ms: f64,
    /// Last time this pattern was processed
    pub last_used: DateTime<Utc>,
    /// Most recent normalized query text with this pattern
    pub sample_query: String,
}

impl QueryPattern {
    fn new(normalized: &NormalizedQuery) -> Self {
        Self {
            id: normalized.id.clone(),
            template: normalized.template.clone(),
            frequency: 0,
            avg_response_time_ms: 0.0,
            last_used: Utc::now(),
            sample_query: normalized.text.clone(),
        }
    }

    fn observe(&mut self, sample: &str, response_time_ms: u64) {
        self.frequency += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.frequency as f64;
        #[allow(clippy::cast_precision_loss)]
        let sample_ms = response_time_ms as f64;
        self.avg_response_time_ms += (sample_ms - self.avg_response_time_ms) / n;
        self.last_used = Utc::now();
        sample.clone_into(&mut self.sample_query);
    }
}

/// Concurrent map of pattern id to usage statistics
#[derive(Debug)]
pub struct PatternTracker {
    patterns: DashMap<String, QueryPattern>,
    max_patterns: usize,
}

impl Default for PatternTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_PATTERNS)
    }
}

impl PatternTracker {
    /// Tracker holding up to [`DEFAULT_MAX_PATTERNS`] patterns
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker holding up to `max_patterns` patterns (at least one)
    #[must_use]
    pub fn with_capacity(max_patterns: usize) -> Self {
        Self {
            patterns: DashMap::new(),
            max_patterns: max_patterns.max(1),
        }
    }

    /// Record one processed request. The reserved empty pattern is ignored.
    pub fn record(&self, normalized: &NormalizedQuery, response_time_ms: u64) {
        if normalized.is_empty() {
            return;
        }
        if !self.patterns.contains_key(&normalized.id) && self.patterns.len() >= self.max_patterns {
            self.evict_least_used();
        }
        self.patterns
            .entry(normalized.id.clone())
            .or_insert_with(|| QueryPattern::new(normalized))
            .observe(&normalized.text, response_time_ms);
    }

    /// Stats for one pattern
    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueryPattern> {
        self.patterns.get(id).map(|p| p.value().clone())
    }

    /// Number of known patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Most frequent patterns first
    #[must_use]
    pub fn top_patterns(&self, n: usize) -> Vec<QueryPattern> {
        let mut all: Vec<QueryPattern> = self.patterns.iter().map(|p| p.value().clone()).collect();
        all.sort_by_key(|p| (Reverse(p.frequency), p.template.clone()));
        all.truncate(n);
        all
    }

    /// Sample queries of other patterns sharing a word with `query`
    ///
    /// Ranked by frequency, at most [`MAX_RELATED`].
    #[must_use]
    pub fn predict_related(&self, query: &NormalizedQuery) -> Vec<String> {
        let words: HashSet<&str> = query.words();
        if words.is_empty() {
            return Vec::new();
        }

        let mut related: Vec<(u64, String)> = self
            .patterns
            .iter()
            .filter(|p| p.id != query.id)
            .filter(|p| p.sample_query.split(' ').any(|w| words.contains(w)))
            .map(|p| (p.frequency, p.sample_query.clone()))
            .collect();
        related.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        related
            .into_iter()
            .map(|(_, sample)| sample)
            .take(MAX_RELATED)
            .collect()
    }

    /// Forget all patterns
    pub fn clear(&self) {
        self.patterns.clear();
    }

    /// Drop the rarest, stalest tenth of the tracked patterns
    fn evict_least_used(&self) {
        let mut ranked: Vec<(u64, DateTime<Utc>, String)> = self
            .patterns
            .iter()
            .map(|p| (p.frequency, p.last_used, p.id.clone()))
            .collect();
        ranked.sort();
        let excess = (self.max_patterns / 10).max(1);
        for (_, _, id) in ranked.into_iter().take(excess) {
            self.patterns.remove(&id);
        }
        tracing::debug!(evicted = excess, "Pattern tracker full, dropped least used patterns");
    }
}
