//! Request and response types
//!
//! A [`QueryRequest`] is built once by the caller and never mutated while it
//! moves through the router. A [`QueryResponse`] is produced once per request;
//! cached copies only differ in their cache annotations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::complexity::Complexity;

// ============================================================================
// Query Mode
// ============================================================================

/// Caller preference for which engine family handles a query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Let the complexity analyzer decide
    #[default]
    Auto,
    /// Only local engines
    Local,
    /// Prefer the remote engine
    Remote,
}

impl QueryMode {
    /// Stable string form used in cache keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::str::FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown query mode: {other}")),
        }
    }
}

// ============================================================================
// Query Request
// ============================================================================

/// Per-request options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Deadline override in milliseconds (defaults to the router target)
    pub timeout_ms: Option<u64>,
    /// Whether cache tiers may serve or store this request
    pub cache_enabled: bool,
    /// Whether the context digest participates in the exact cache key
    pub include_context: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            cache_enabled: true,
            include_context: true,
        }
    }
}

/// An inbound query
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Unique request identifier
    pub request_id: String,
    /// Raw query text
    pub text: String,
    /// Engine family preference
    pub mode: QueryMode,
    /// Opaque context handed to engines untouched
    pub context: serde_json::Value,
    /// Request options
    pub options: QueryOptions,
}

impl QueryRequest {
    /// Create a request with default mode and options
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            mode: QueryMode::Auto,
            context: serde_json::Value::Null,
            options: QueryOptions::default(),
        }
    }

    /// Set the mode
    #[must_use]
    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Attach engine context
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Override the deadline
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    /// Enable or disable caching for this request
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.options.cache_enabled = enabled;
        self
    }

    /// Whether the text is blank
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Digest of the context value, empty when context is excluded or null
    #[must_use]
    pub fn context_digest(&self) -> String {
        if !self.options.include_context || self.context.is_null() {
            return String::new();
        }
        // serde_json keeps map keys sorted, so this is stable
        self.context.to_string()
    }
}

// ============================================================================
// Thinking Steps
// ============================================================================

/// Status of a single processing step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not started
    Pending,
    /// In progress
    Running,
    /// Finished
    Done,
    /// Ended in failure
    Failed,
}

/// One entry in the ordered processing trace of a response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingStep {
    /// Stage label
    pub name: String,
    /// Outcome of the step
    pub status: StepStatus,
    /// Wall time spent in the step
    pub duration_ms: u64,
}

impl ThinkingStep {
    /// Completed step
    pub fn done(name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Done,
            duration_ms,
        }
    }

    /// Failed step
    pub fn failed(name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Failed,
            duration_ms,
        }
    }
}

// ============================================================================
// Cache Tier
// ============================================================================

/// Cache tiers, in lookup order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Same query, context and mode
    Exact,
    /// Preloaded answers by pattern and mode
    Predictive,
    /// Any query with the same template, adapted to its values
    Pattern,
    /// Close word overlap
    Similarity,
}

impl CacheTier {
    /// All tiers in lookup order
    pub const ALL: [CacheTier; 4] = [
        CacheTier::Exact,
        CacheTier::Predictive,
        CacheTier::Pattern,
        CacheTier::Similarity,
    ];

    /// Lower-case label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Predictive => "predictive",
            Self::Pattern => "pattern",
            Self::Similarity => "similarity",
        }
    }
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Query Response
// ============================================================================

/// Routing annotations attached to every response
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Tier that served the response, if any
    pub cache_tier: Option<CacheTier>,
    /// Whether the response came from a cache tier
    pub cached: bool,
    /// Whether an engine other than the first candidate answered
    pub fallback_used: bool,
    /// Engines attempted without success, in attempt order
    pub failed_engines: Vec<String>,
    /// Failure category for unsuccessful responses
    pub error_category: Option<String>,
    /// Per-stage wall time
    pub stage_timings_ms: BTreeMap<String, u64>,
    /// Complexity level assigned by the analyzer
    pub complexity: Option<Complexity>,
    /// Pattern id of the normalized query
    pub pattern_id: Option<String>,
}

/// The answer returned to the caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Whether an engine or cache tier answered
    pub success: bool,
    /// Answer, or a failure description
    pub text: String,
    /// Confidence in 0.0..=1.0
    pub confidence: f64,
    /// Engine that produced the answer
    pub engine_used: String,
    /// Ordered processing trace
    pub thinking_steps: Vec<ThinkingStep>,
    /// Routing annotations
    pub metadata: ResponseMetadata,
    /// Wall time from receipt to response
    pub processing_time_ms: u64,
}

impl QueryResponse {
    /// A successful response. Blank text is downgraded to a failure.
    pub fn success(engine: impl Into<String>, text: impl Into<String>, confidence: f64) -> Self {
        let text = text.into();
        let engine = engine.into();
        if text.trim().is_empty() {
            return Self::failure(engine, "engine returned an empty answer", "unknown");
        }
        Self {
            success: true,
            text,
            confidence: confidence.clamp(0.0, 1.0),
            engine_used: engine,
            thinking_steps: Vec::new(),
            metadata: ResponseMetadata::default(),
            processing_time_ms: 0,
        }
    }

    /// A failed response with a category label
    pub fn failure(
        engine: impl Into<String>,
        text: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            text: text.into(),
            confidence: 0.0,
            engine_used: engine.into(),
            thinking_steps: Vec::new(),
            metadata: ResponseMetadata {
                error_category: Some(category.into()),
                ..Default::default()
            },
            processing_time_ms: 0,
        }
    }

    /// Copy of this response annotated as served from `tier`
    #[must_use]
    pub fn as_cached(&self, tier: CacheTier) -> Self {
        let mut copy = self.clone();
        copy.metadata.cached = true;
        copy.metadata.cache_tier = Some(tier);
        copy
    }

    /// Whether this response may be written to a cache tier
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.success && !self.text.trim().is_empty()
    }
}
