//! Fallback chain and per-request attempt tracking
//!
//! ```text
//! preferred engine (from the analyzer or mode)
//!         |
//!         v
//! chain: [local-fast, local-semantic, remote]
//!         |
//!         v
//! candidates = preferred + chain, deduplicated
//! ```

use crate::breaker::category::ErrorCategory;

/// Ordered list of engine ids tried after the preferred engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackChain {
    engines: Vec<String>,
}

impl FallbackChain {
    /// Build a chain; duplicate ids keep their first position
    pub fn new<I, S>(engines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut chain = Self {
            engines: Vec::new(),
        };
        for engine in engines {
            let engine = engine.into();
            if !chain.contains(&engine) {
                chain.engines.push(engine);
            }
        }
        chain
    }

    /// Chain entries in order
    #[must_use]
    pub fn engines(&self) -> &[String] {
        &self.engines
    }

    /// Whether `engine` is in the chain
    #[must_use]
    pub fn contains(&self, engine: &str) -> bool {
        self.engines.iter().any(|e| e == engine)
    }

    /// Whether the chain has no engines
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Candidate order for a request: `preferred` first, then the chain
    #[must_use]
    pub fn candidates(&self, preferred: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = preferred.map(str::to_string).into_iter().collect();
        for engine in &self.engines {
            if !out.contains(engine) {
                out.push(engine.clone());
            }
        }
        out
    }

    /// Engine following `current` in the chain
    #[must_use]
    pub fn next_after(&self, current: &str) -> Option<&str> {
        match self.engines.iter().position(|e| e == current) {
            Some(pos) => self.engines.get(pos + 1).map(String::as_str),
            None => self.engines.first().map(String::as_str),
        }
    }
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::new(["local-fast", "local-semantic", "remote"])
    }
}

/// A failed attempt within one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedAttempt {
    /// Engine id
    pub engine: String,
    /// Category label, including `circuit_open` for skipped engines
    pub category: String,
}

/// Tracks which engines a request has tried
#[derive(Clone, Debug, Default)]
pub struct FallbackContext {
    failed: Vec<FailedAttempt>,
    attempted: Vec<String>,
    /// Set when a non-retryable failure ends the loop early
    pub terminal: Option<ErrorCategory>,
}

impl FallbackContext {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `engine` was tried; repeats are ignored
    pub fn attempt(&mut self, engine: &str) {
        if !self.has_tried(engine) {
            self.attempted.push(engine.to_string());
        }
    }

    /// Whether `engine` was already attempted
    #[must_use]
    pub fn has_tried(&self, engine: &str) -> bool {
        self.attempted.iter().any(|e| e == engine)
    }

    /// Record a failed or skipped engine
    ///
    /// Failures are kept in attempt order, not completion order, so a
    /// raced engine that fails quickly does not jump ahead of one launched
    /// before it.
    pub fn fail(&mut self, engine: &str, category: impl Into<String>) {
        self.attempt(engine);
        if self.failed.iter().any(|f| f.engine == engine) {
            return;
        }
        let rank = self.rank(engine);
        let pos = self
            .failed
            .iter()
            .position(|f| self.rank(&f.engine) > rank)
            .unwrap_or(self.failed.len());
        self.failed.insert(
            pos,
            FailedAttempt {
                engine: engine.to_string(),
                category: category.into(),
            },
        );
    }

    fn rank(&self, engine: &str) -> usize {
        self.attempted
            .iter()
            .position(|e| e == engine)
            .unwrap_or(usize::MAX)
    }

    /// Failed engine ids in attempt order
    #[must_use]
    pub fn failed_engines(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.engine.clone()).collect()
    }

    /// Failed attempts with their categories
    #[must_use]
    pub fn failures(&self) -> &[FailedAttempt] {
        &self.failed
    }

    /// Category of the failure latest in attempt order
    #[must_use]
    pub fn last_category(&self) -> Option<&str> {
        self.failed.last().map(|f| f.category.as_str())
    }

    /// Number of engines tried after the first
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.attempted.len().saturating_sub(1)
    }

    /// Next candidate not yet tried
    #[must_use]
    pub fn next_untried<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates
            .iter()
            .find(|c| !self.has_tried(c))
            .map(String::as_str)
    }
}
