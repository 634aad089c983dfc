//! Cache entries with hit-count aware expiry

use std::time::{Duration, Instant};

use crate::types::QueryResponse;

/// Entries hit more than this many times live at least [`HOT_TTL`]
pub const HOT_HIT_COUNT: u32 = 10;
/// Entries hit more than this many times live at least [`WARM_TTL`]
pub const WARM_HIT_COUNT: u32 = 5;
/// Minimum lifetime of a hot entry
pub const HOT_TTL: Duration = Duration::from_secs(3600);
/// Minimum lifetime of a warm entry
pub const WARM_TTL: Duration = Duration::from_secs(1800);

/// A cached response snapshot
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// Tier-specific key
    pub key: String,
    /// Snapshot of the successful response
    pub value: QueryResponse,
    /// Query text the value was produced for
    pub source_query: String,
    /// Scope the entry may be served in (the query mode)
    pub scope: String,
    /// When this entry was written
    pub created_at: Instant,
    /// When this entry was last served
    pub last_accessed: Instant,
    /// Base time-to-live
    pub ttl: Duration,
    /// Number of times this entry was served
    pub hit_count: u32,
}

impl CacheEntry {
    /// Create a fresh entry
    pub fn new(
        key: impl Into<String>,
        value: QueryResponse,
        source_query: impl Into<String>,
        scope: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            value,
            source_query: source_query.into(),
            scope: scope.into(),
            created_at: now,
            last_accessed: now,
            ttl,
            hit_count: 0,
        }
    }

    /// Record a hit
    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.hit_count = self.hit_count.saturating_add(1);
    }

    /// Lifetime after adjusting for popularity
    #[must_use]
    pub fn effective_ttl(&self) -> Duration {
        if self.hit_count > HOT_HIT_COUNT {
            self.ttl.max(HOT_TTL)
        } else if self.hit_count > WARM_HIT_COUNT {
            self.ttl.max(WARM_TTL)
        } else {
            self.ttl
        }
    }

    /// Whether the entry has outlived its effective TTL at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.effective_ttl()
    }

    /// Frequency-weighted LRU score; the smallest score is evicted first
    #[must_use]
    pub fn eviction_score(&self, bonus_window: Duration) -> Instant {
        self.created_at + bonus_window.saturating_mul(self.hit_count)
    }
}
