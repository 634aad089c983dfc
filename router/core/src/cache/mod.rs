//! Multi-Tier Response Cache
//!
//! Four tiers with different key derivations, checked fastest and most
//! specific first:
//!
//! ```text
//! lookup(query)
//!    |
//!    +--> Exact       hash(normalized text + mode + context digest)
//!    +--> Predictive  hash(mode + normalized text), pre-warmed
//!    +--> Pattern     hash(mode + template id), answer adapted to the query
//!    +--> Similarity  Jaccard scan over the most recent entries
//! ```
//!
//! Each tier has its own capacity and TTL and evicts by a frequency-weighted
//! LRU score (`created_at + hit_count * bonus_window`). Writes are
//! best-effort: a write that cannot take the tier lock within the write
//! budget is dropped.

pub mod entry;
pub mod similarity;
pub mod store;
pub mod tier;

use std::time::Duration;

use serde::Serialize;

use crate::normalizer::{stable_hash, NormalizedQuery};
use crate::types::{CacheTier, QueryRequest, QueryResponse};

pub use entry::CacheEntry;
pub use store::TierStore;
pub use tier::TierCache;

// ============================================================================
// Configuration
// ============================================================================

/// Capacity and lifetime of one tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierSettings {
    /// Maximum number of entries
    pub capacity: usize,
    /// Base time-to-live of new entries
    pub ttl: Duration,
    /// Minimum number of entries removed once the tier overflows
    pub trim_batch: usize,
}

impl TierSettings {
    /// Settings with single-entry eviction
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            trim_batch: 1,
        }
    }
}

/// Cache configuration for all tiers
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Exact-match tier
    pub exact: TierSettings,
    /// Pre-warmed normalized-text tier
    pub predictive: TierSettings,
    /// Generalized template tier
    pub pattern: TierSettings,
    /// Token-overlap tier
    pub similarity: TierSettings,
    /// Score bonus each hit adds to an entry's eviction score
    pub bonus_window: Duration,
    /// Longest a write may wait for a tier lock
    pub write_budget: Duration,
    /// Longest a read may wait for a tier lock
    pub read_budget: Duration,
    /// Minimum Jaccard similarity for a similarity hit
    pub similarity_threshold: f64,
    /// Number of recent entries scanned by the similarity tier
    pub similarity_scan_limit: usize,
    /// Upper bound for capacity growth
    pub max_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            exact: TierSettings::new(1000, Duration::from_secs(300)),
            predictive: TierSettings {
                capacity: 100,
                ttl: Duration::from_secs(1800),
                trim_batch: 50,
            },
            pattern: TierSettings::new(500, Duration::from_secs(900)),
            similarity: TierSettings::new(200, Duration::from_secs(600)),
            bonus_window: Duration::from_secs(60),
            write_budget: Duration::from_millis(2),
            read_budget: Duration::from_millis(2),
            similarity_threshold: 0.8,
            similarity_scan_limit: 100,
            max_capacity: 10_000,
        }
    }
}

impl CacheConfig {
    /// Settings for one tier
    #[must_use]
    pub fn tier(&self, tier: CacheTier) -> &TierSettings {
        match tier {
            CacheTier::Exact => &self.exact,
            CacheTier::Predictive => &self.predictive,
            CacheTier::Pattern => &self.pattern,
            CacheTier::Similarity => &self.similarity,
        }
    }
}

// ============================================================================
// Keys and Hits
// ============================================================================

/// Per-tier keys derived from one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKeys {
    /// Exact tier key
    pub exact: String,
    /// Predictive tier key
    pub predictive: String,
    /// Pattern tier key
    pub pattern: String,
    /// Similarity tier key
    pub similarity: String,
    /// Scope entries must match (the query mode)
    pub scope: String,
}

impl CacheKeys {
    /// Derive all tier keys for a request
    #[must_use]
    pub fn derive(request: &QueryRequest, normalized: &NormalizedQuery) -> Self {
        let mode = request.mode.as_str();
        let digest = request.context_digest();
        Self {
            exact: stable_hash(&["exact", normalized.text.as_str(), mode, digest.as_str()]),
            predictive: stable_hash(&["predictive", mode, normalized.text.as_str()]),
            pattern: stable_hash(&["pattern", mode, normalized.id.as_str()]),
            similarity: stable_hash(&["similarity", mode, normalized.text.as_str()]),
            scope: mode.to_string(),
        }
    }

    /// Key for one tier
    #[must_use]
    pub fn for_tier(&self, tier: CacheTier) -> &str {
        match tier {
            CacheTier::Exact => &self.exact,
            CacheTier::Predictive => &self.predictive,
            CacheTier::Pattern => &self.pattern,
            CacheTier::Similarity => &self.similarity,
        }
    }
}

/// A response served from a tier
#[derive(Clone, Debug)]
pub struct CacheHit {
    /// Tier that served the response
    pub tier: CacheTier,
    /// Response annotated as cached
    pub response: QueryResponse,
}

/// Point-in-time counters of one tier
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Tier name
    pub tier: String,
    /// Live entries
    pub entries: usize,
    /// Current capacity
    pub capacity: usize,
    /// Served lookups
    pub hits: u64,
    /// Unserved lookups
    pub misses: u64,
    /// Entries removed for capacity
    pub evictions: u64,
    /// Writes dropped on lock contention
    pub dropped_writes: u64,
}
