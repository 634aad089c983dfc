//! Query Complexity Analysis
//!
//! Decides which engine family should answer a query before any engine runs.
//!
//! ```text
//! query
//!   |
//!   +--> quick routes (anchored regexes)     -> family + fixed confidence
//!   |
//!   +--> additive score (length, code, reasoning, factual, design)
//!   |        score <= 2  Simple   -> local-fast
//!   |        score <= 5  Medium   -> local-semantic
//!   |        otherwise   Complex  -> remote
//!   |
//!   +--> keyword tables (local vs remote weights)
//!            winner > margin * loser overrides the locality of the choice
//! ```

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// Levels and Families
// ============================================================================

/// Complexity level of a query
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Keyword lookups and short status questions
    Simple,
    /// Needs some reasoning over known data
    Medium,
    /// Open-ended analysis
    Complex,
}

impl Complexity {
    /// Level for an additive score
    #[must_use]
    pub fn from_score(score: i32) -> Self {
        if score <= 2 {
            Self::Simple
        } else if score <= 5 {
            Self::Medium
        } else {
            Self::Complex
        }
    }

    /// Engine family implied by the level alone
    #[must_use]
    pub fn implied_family(&self) -> EngineFamily {
        match self {
            Self::Simple => EngineFamily::LocalFast,
            Self::Medium => EngineFamily::LocalSemantic,
            Self::Complex => EngineFamily::Remote,
        }
    }
}

/// Kind of engine, independent of any concrete adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineFamily {
    /// Template and rule based, near-instant
    LocalFast,
    /// Keyword retrieval over local knowledge
    LocalSemantic,
    /// Hosted model behind HTTP
    Remote,
}

impl EngineFamily {
    /// Kebab-case id, also the default engine id
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFast => "local-fast",
            Self::LocalSemantic => "local-semantic",
            Self::Remote => "remote",
        }
    }

    /// Whether the family runs in-process
    #[must_use]
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Remote)
    }
}

impl std::fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Analysis Result
// ============================================================================

/// Expected latency per family, in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EstimatedTimes {
    /// Local engine estimate
    pub local_ms: u64,
    /// Remote engine estimate
    pub remote_ms: u64,
}

impl EstimatedTimes {
    fn for_score(score: i32) -> Self {
        let score = u64::try_from(score.max(0)).unwrap_or(0);
        Self {
            local_ms: 50 + 20 * score,
            remote_ms: 180 + 40 * score,
        }
    }
}

/// Outcome of analyzing one query
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComplexityAnalysis {
    /// Level derived from the score
    pub complexity: Complexity,
    /// Additive complexity score
    pub score: i32,
    /// Family the query should go to
    pub recommended_engine: EngineFamily,
    /// 0.5..=0.95
    pub confidence: f64,
    /// Expected latency per family
    pub estimated_times: EstimatedTimes,
    /// Human-readable notes on what contributed to the decision
    pub reasoning: Vec<String>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Keyword weight tables and override margin
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Keyword weights pulling towards local engines
    pub local_keywords: BTreeMap<String, f64>,
    /// Keyword weights pulling towards the remote engine
    pub remote_keywords: BTreeMap<String, f64>,
    /// Factor by which one keyword score must beat the other to override
    pub keyword_margin: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let local = [
            ("cpu", 1.0),
            ("memory", 1.0),
            ("disk", 1.0),
            ("network", 0.8),
            ("status", 1.0),
            ("usage", 1.0),
            ("server", 0.8),
            ("process", 0.8),
            ("logs", 0.8),
            ("uptime", 1.0),
            ("health", 0.8),
        ];
        let remote = [
            ("explain", 1.0),
            ("why", 1.5),
            ("analyze", 1.5),
            ("compare", 1.5),
            ("design", 2.0),
            ("optimize", 1.5),
            ("strategy", 2.0),
            ("recommend", 1.0),
            ("architecture", 2.0),
            ("summarize", 1.0),
        ];
        Self {
            local_keywords: local.iter().map(|(k, w)| ((*k).to_string(), *w)).collect(),
            remote_keywords: remote.iter().map(|(k, w)| ((*k).to_string(), *w)).collect(),
            keyword_margin: 1.5,
        }
    }
}

// ============================================================================
// Pattern Tables
// ============================================================================

struct QuickRoute {
    pattern: Regex,
    family: EngineFamily,
    confidence: f64,
    estimate_ms: u64,
}

static QUICK_ROUTES: Lazy<Vec<QuickRoute>> = Lazy::new(|| {
    [
        (r"^(server|system) (status|state)", EngineFamily::LocalSemantic, 0.9, 60),
        (r"^(cpu|memory|disk) (usage|status|check)", EngineFamily::LocalFast, 0.95, 50),
        (r"^(analyze|analyse|optimize) ", EngineFamily::Remote, 0.85, 180),
    ]
    .into_iter()
    .map(|(pattern, family, confidence, estimate_ms)| QuickRoute {
        pattern: Regex::new(pattern).expect("quick route pattern is valid"),
        family,
        confidence,
        estimate_ms,
    })
    .collect()
});

static CODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"`|\bfn |\bfunction\b|=>|\{|\};|\bselect |\bimport ")
        .expect("code pattern is valid")
});

static REASONING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(why|compare|analy[sz]e)\b").expect("reasoning pattern is valid")
});

static FACTUAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(what is|show|status|usage|list|how many|current)\b")
        .expect("factual pattern is valid")
});

static DESIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(design|optimi[sz]e|strategize|strategy|architecture)\b")
        .expect("design pattern is valid")
});

// ============================================================================
// Analyzer
// ============================================================================

/// Stateless scorer with hot-swappable keyword tables
#[derive(Debug, Default)]
pub struct ComplexityAnalyzer {
    config: RwLock<AnalyzerConfig>,
}

impl ComplexityAnalyzer {
    /// Analyzer with the given keyword tables
    #[must_use]
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace keyword tables at runtime
    pub fn set_config(&self, config: AnalyzerConfig) {
        *self.config.write() = config;
    }

    /// Current keyword tables
    #[must_use]
    pub fn config(&self) -> AnalyzerConfig {
        self.config.read().clone()
    }

    /// Analyze a query
    #[must_use]
    pub fn analyze(&self, query: &str) -> ComplexityAnalysis {
        let lower = query.trim().to_lowercase();
        let mut reasoning = Vec::new();
        let score = Self::score(query, &lower, &mut reasoning);
        let complexity = Complexity::from_score(score);
        let mut estimated_times = EstimatedTimes::for_score(score);

        if let Some(route) = QUICK_ROUTES.iter().find(|r| r.pattern.is_match(&lower)) {
            reasoning.push(format!("quick route: {}", route.family));
            if route.family.is_local() {
                estimated_times.local_ms = route.estimate_ms;
            } else {
                estimated_times.remote_ms = route.estimate_ms;
            }
            return ComplexityAnalysis {
                complexity,
                score,
                recommended_engine: route.family,
                confidence: route.confidence,
                estimated_times,
                reasoning,
            };
        }

        let config = self.config.read();
        let local_score = keyword_score(&lower, &config.local_keywords);
        let remote_score = keyword_score(&lower, &config.remote_keywords);
        let keyword_family = if remote_score > local_score {
            EngineFamily::Remote
        } else {
            EngineFamily::LocalSemantic
        };
        let (winner, loser) = if remote_score > local_score {
            (remote_score, local_score)
        } else {
            (local_score, remote_score)
        };
        let decisive = winner > 0.0 && winner > config.keyword_margin * loser;

        let mut recommended = complexity.implied_family();
        let mut confidence: f64 = 0.5;

        if winner > 0.0 && keyword_family.is_local() == recommended.is_local() {
            confidence += 0.3;
            reasoning.push("complexity agrees with keywords".to_string());
        }
        if decisive {
            confidence += 0.2;
            if keyword_family.is_local() != recommended.is_local() {
                reasoning.push(format!(
                    "keywords override {} with {} ({winner:.1} vs {loser:.1})",
                    recommended, keyword_family
                ));
                recommended = keyword_family;
            }
        }

        ComplexityAnalysis {
            complexity,
            score,
            recommended_engine: recommended,
            confidence: confidence.min(0.95),
            estimated_times,
            reasoning,
        }
    }

    fn score(raw: &str, lower: &str, reasoning: &mut Vec<String>) -> i32 {
        let mut score = 0;
        let length = raw.trim().chars().count();

        if length > 200 {
            score += 2;
            reasoning.push("long query".to_string());
        } else if length > 100 {
            score += 1;
            reasoning.push("medium-length query".to_string());
        }
        if CODE_RE.is_match(lower) {
            score += 2;
            reasoning.push("contains code".to_string());
        }
        if lower.matches('?').count() > 1 {
            score += 2;
            reasoning.push("multiple questions".to_string());
        }
        if REASONING_RE.is_match(lower) {
            score += 3;
            reasoning.push("asks for reasoning".to_string());
        }
        if FACTUAL_RE.is_match(lower) {
            score -= 2;
            reasoning.push("simple factual request".to_string());
        }
        if DESIGN_RE.is_match(lower) {
            score += 3;
            reasoning.push("design or optimization request".to_string());
        }
        score
    }
}

fn keyword_score(text: &str, table: &BTreeMap<String, f64>) -> f64 {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .filter_map(|w| table.get(w))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(query: &str) -> ComplexityAnalysis {
        ComplexityAnalyzer::default().analyze(query)
    }

    #[test]
    fn test_cpu_usage_is_simple_and_local() {
        let a = analyze("CPU usage");
        assert_eq!(a.complexity, Complexity::Simple);
        assert_eq!(a.recommended_engine, EngineFamily::LocalFast);
        assert!((a.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(a.estimated_times.local_ms, 50);
    }

    #[test]
    fn test_server_status_quick_route() {
        let a = analyze("server status for web-01");
        assert_eq!(a.recommended_engine, EngineFamily::LocalSemantic);
        assert!((a.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_analyze_prefix_goes_remote() {
        let a = analyze("analyze the last week of error logs");
        assert_eq!(a.recommended_engine, EngineFamily::Remote);
        assert_eq!(a.estimated_times.remote_ms, 180);
    }

    #[test]
    fn test_design_question_is_complex() {
        let a = analyze("Why should we design the cache architecture this way? And why not shard?");
        // reasoning +3, design +3, two questions +2
        assert_eq!(a.score, 8);
        assert_eq!(a.complexity, Complexity::Complex);
        assert_eq!(a.recommended_engine, EngineFamily::Remote);
        assert_eq!(a.estimated_times.local_ms, 50 + 20 * 8);
    }

    #[test]
    fn test_code_scores() {
        let a = analyze("what does `select * from hosts` return");
        assert_eq!(a.score, 2);
        assert_eq!(a.complexity, Complexity::Simple);
    }

    #[test]
    fn test_keywords_override_locality() {
        // Medium by score, but remote keywords dominate
        let a = analyze("explain and summarize, then recommend a strategy?");
        assert_eq!(a.recommended_engine, EngineFamily::Remote);
        assert!(a.confidence <= 0.95);
    }

    #[test]
    fn test_confidence_bounds() {
        for q in ["hello", "list processes", "compare cpu and memory usage"] {
            let a = analyze(q);
            assert!((0.5..=0.95).contains(&a.confidence), "{q}: {}", a.confidence);
        }
    }

    #[test]
    fn test_tables_can_be_replaced() {
        let analyzer = ComplexityAnalyzer::default();
        let mut config = AnalyzerConfig::default();
        config.remote_keywords.insert("forecast".to_string(), 5.0);
        analyzer.set_config(config);
        let a = analyzer.analyze("forecast tomorrow");
        assert_eq!(a.recommended_engine, EngineFamily::Remote);
    }
}
