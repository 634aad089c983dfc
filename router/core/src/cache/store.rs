//! Thread-safe store over all cache tiers

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::entry::CacheEntry;
use super::similarity::best_match;
use super::tier::TierCache;
use super::{CacheConfig, CacheHit, CacheKeys, TierStats};
use crate::normalizer::{normalize, NormalizedQuery};
use crate::types::{CacheTier, QueryResponse};

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    dropped_writes: AtomicU64,
}

fn index(tier: CacheTier) -> usize {
    match tier {
        CacheTier::Exact => 0,
        CacheTier::Predictive => 1,
        CacheTier::Pattern => 2,
        CacheTier::Similarity => 3,
    }
}

/// All four tiers behind per-tier mutexes
///
/// Every operation on the request path takes a tier lock with a bounded
/// wait. A contended read is a miss and a contended write is dropped.
#[derive(Debug)]
pub struct TierStore {
    tiers: [Mutex<TierCache>; 4],
    counters: [TierCounters; 4],
    config: RwLock<CacheConfig>,
}

impl TierStore {
    /// Create a store with the given configuration
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let tiers = CacheTier::ALL.map(|t| Mutex::new(TierCache::new(config.tier(t).clone())));
        Self {
            tiers,
            counters: Default::default(),
            config: RwLock::new(config),
        }
    }

    fn read_lock(&self, tier: CacheTier) -> Option<MutexGuard<'_, TierCache>> {
        let budget = self.config.read().read_budget;
        self.tiers[index(tier)].try_lock_for(budget)
    }

    fn write_lock(&self, tier: CacheTier) -> Option<MutexGuard<'_, TierCache>> {
        let budget = self.config.read().write_budget;
        let guard = self.tiers[index(tier)].try_lock_for(budget);
        if guard.is_none() {
            self.counters[index(tier)]
                .dropped_writes
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(tier = %tier, "Cache write dropped under contention");
        }
        guard
    }

    fn count(&self, tier: CacheTier, hit: bool) {
        let counters = &self.counters[index(tier)];
        if hit {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Single-tier operations
    // ========================================================================

    /// Read a value from one tier by key
    #[must_use]
    pub fn get(&self, tier: CacheTier, key: &str) -> Option<QueryResponse> {
        let value = self
            .read_lock(tier)
            .and_then(|mut guard| guard.get(key, Instant::now()).map(|e| e.value.clone()));
        self.count(tier, value.is_some());
        value
    }

    /// Write a value to one tier using the tier's default TTL
    ///
    /// Returns `false` when the value is not cacheable or the write was
    /// dropped.
    pub fn set(
        &self,
        tier: CacheTier,
        key: &str,
        value: &QueryResponse,
        source_query: &str,
        scope: &str,
    ) -> bool {
        self.write(tier, key, value, source_query, scope, None, None)
    }

    /// Write a value to one tier with an explicit TTL
    pub fn set_with_ttl(
        &self,
        tier: CacheTier,
        key: &str,
        value: &QueryResponse,
        source_query: &str,
        scope: &str,
        ttl: Duration,
    ) -> bool {
        self.write(tier, key, value, source_query, scope, Some(ttl), None)
    }

    /// Write only if no entry newer than `started_at` exists for the key
    pub fn insert_if_absent_or_older(
        &self,
        tier: CacheTier,
        key: &str,
        value: &QueryResponse,
        source_query: &str,
        scope: &str,
        started_at: Instant,
    ) -> bool {
        self.write(tier, key, value, source_query, scope, None, Some(started_at))
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        tier: CacheTier,
        key: &str,
        value: &QueryResponse,
        source_query: &str,
        scope: &str,
        ttl: Option<Duration>,
        not_before: Option<Instant>,
    ) -> bool {
        if !value.is_cacheable() {
            return false;
        }
        let bonus_window = self.config.read().bonus_window;
        let Some(mut guard) = self.write_lock(tier) else {
            return false;
        };

        if let (Some(started_at), Some(existing)) = (not_before, guard.peek(key)) {
            if existing.created_at > started_at {
                return false;
            }
        }

        let ttl = ttl.unwrap_or(guard.settings().ttl);
        let mut snapshot = value.clone();
        snapshot.metadata.cached = false;
        snapshot.metadata.cache_tier = None;
        guard.insert(CacheEntry::new(key, snapshot, source_query, scope, ttl));

        let evicted = guard.evict_if_over_capacity(bonus_window);
        if evicted > 0 {
            self.counters[index(tier)]
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        true
    }

    /// Evict one tier down to its capacity
    pub fn evict_if_over_capacity(&self, tier: CacheTier) -> usize {
        let bonus_window = self.config.read().bonus_window;
        let evicted = self.tiers[index(tier)]
            .lock()
            .evict_if_over_capacity(bonus_window);
        self.counters[index(tier)]
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    // ========================================================================
    // Multi-tier operations
    // ========================================================================

    /// Check every tier in order and return the first usable hit
    #[must_use]
    pub fn lookup(&self, keys: &CacheKeys, normalized: &NormalizedQuery) -> Option<CacheHit> {
        if normalized.is_empty() {
            return None;
        }

        for tier in [CacheTier::Exact, CacheTier::Predictive] {
            if let Some(value) = self.get(tier, keys.for_tier(tier)) {
                tracing::debug!(tier = %tier, "Cache hit");
                return Some(CacheHit {
                    tier,
                    response: value.as_cached(tier),
                });
            }
        }

        if let Some(hit) = self.lookup_pattern(keys, normalized) {
            return Some(hit);
        }
        self.lookup_similar(keys, normalized)
    }

    fn lookup_pattern(&self, keys: &CacheKeys, normalized: &NormalizedQuery) -> Option<CacheHit> {
        let tier = CacheTier::Pattern;
        let adapted = self.read_lock(tier).and_then(|mut guard| {
            let now = Instant::now();
            let entry = guard.peek(&keys.pattern)?;
            if entry.is_expired(now) {
                return None;
            }
            let cached_query = normalize(&entry.source_query);
            let text = normalized.adapt_answer(&cached_query, &entry.value.text)?;
            let mut response = entry.value.clone();
            response.text = text;
            guard.get(&keys.pattern, now);
            Some(response)
        });

        self.count(tier, adapted.is_some());
        adapted.map(|response| {
            tracing::debug!(tier = %tier, "Cache hit (adapted)");
            CacheHit {
                tier,
                response: response.as_cached(tier),
            }
        })
    }

    fn lookup_similar(&self, keys: &CacheKeys, normalized: &NormalizedQuery) -> Option<CacheHit> {
        let tier = CacheTier::Similarity;
        let (threshold, limit) = {
            let config = self.config.read();
            (config.similarity_threshold, config.similarity_scan_limit)
        };

        let found = self.read_lock(tier).and_then(|mut guard| {
            let now = Instant::now();
            let key = {
                let candidates = guard
                    .recent(limit, now)
                    .filter(|e| e.scope == keys.scope)
                    .map(|e| (e.key.as_str(), e.source_query.as_str()));
                best_match(&normalized.text, candidates, threshold).map(|(k, _)| k.to_string())
            }?;
            guard.get(&key, now).map(|e| e.value.clone())
        });

        self.count(tier, found.is_some());
        found.map(|value| CacheHit {
            tier,
            response: value.as_cached(tier),
        })
    }

    /// Write a successful response to the requested tiers
    ///
    /// Returns the tiers that accepted the write.
    pub fn write_back(
        &self,
        keys: &CacheKeys,
        normalized: &NormalizedQuery,
        response: &QueryResponse,
        tiers: &[CacheTier],
    ) -> Vec<CacheTier> {
        if normalized.is_empty() || !response.is_cacheable() {
            return Vec::new();
        }
        tiers
            .iter()
            .copied()
            .filter(|tier| {
                self.set(
                    *tier,
                    keys.for_tier(*tier),
                    response,
                    &normalized.text,
                    &keys.scope,
                )
            })
            .collect()
    }

    /// Like [`Self::write_back`], skipping keys written after `started_at`
    pub fn write_back_if_fresher(
        &self,
        keys: &CacheKeys,
        normalized: &NormalizedQuery,
        response: &QueryResponse,
        tiers: &[CacheTier],
        started_at: Instant,
    ) -> Vec<CacheTier> {
        if normalized.is_empty() || !response.is_cacheable() {
            return Vec::new();
        }
        tiers
            .iter()
            .copied()
            .filter(|tier| {
                self.insert_if_absent_or_older(
                    *tier,
                    keys.for_tier(*tier),
                    response,
                    &normalized.text,
                    &keys.scope,
                    started_at,
                )
            })
            .collect()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove expired entries from every tier
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .tiers
            .iter()
            .map(|tier| tier.lock().remove_expired(now))
            .sum();
        if removed > 0 {
            tracing::debug!(removed, "Expired cache entries removed");
        }
        removed
    }

    /// Multiply every tier's capacity, bounded by the configured maximum
    ///
    /// Returns the new total capacity.
    pub fn grow_capacity(&self, factor: f64) -> usize {
        let max = self.config.read().max_capacity;
        self.tiers
            .iter()
            .map(|tier| {
                let mut guard = tier.lock();
                let current = guard.settings().capacity;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let grown = ((current as f64) * factor).ceil() as usize;
                let capacity = grown.clamp(current.min(max), max);
                guard.set_capacity(capacity);
                capacity
            })
            .sum()
    }

    /// Update similarity tuning at runtime
    pub fn set_similarity(&self, threshold: f64, scan_limit: usize) {
        let mut config = self.config.write();
        config.similarity_threshold = threshold;
        config.similarity_scan_limit = scan_limit;
    }

    /// Capacity of one tier
    #[must_use]
    pub fn capacity(&self, tier: CacheTier) -> usize {
        self.tiers[index(tier)].lock().settings().capacity
    }

    /// Number of entries in one tier
    #[must_use]
    pub fn len(&self, tier: CacheTier) -> usize {
        self.tiers[index(tier)].lock().len()
    }

    /// Drop all entries from every tier
    pub fn clear(&self) {
        for tier in &self.tiers {
            tier.lock().clear();
        }
    }

    /// Counters for every tier, in lookup order
    #[must_use]
    pub fn stats(&self) -> Vec<TierStats> {
        CacheTier::ALL
            .iter()
            .map(|tier| {
                let (entries, capacity) = {
                    let guard = self.tiers[index(*tier)].lock();
                    (guard.len(), guard.settings().capacity)
                };
                let counters = &self.counters[index(*tier)];
                TierStats {
                    tier: tier.to_string(),
                    entries,
                    capacity,
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    evictions: counters.evictions.load(Ordering::Relaxed),
                    dropped_writes: counters.dropped_writes.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

impl Default for TierStore {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryRequest;
    use std::sync::Arc;

    fn keys_for(text: &str) -> (CacheKeys, NormalizedQuery) {
        let request = QueryRequest::new(text);
        let normalized = normalize(text);
        (CacheKeys::derive(&request, &normalized), normalized)
    }

    fn answer(text: &str) -> QueryResponse {
        QueryResponse::success("local-fast", text, 0.8)
    }

    #[test]
    fn test_exact_round_trip() {
        let store = TierStore::default();
        let (keys, n) = keys_for("CPU usage");
        let written = store.write_back(&keys, &n, &answer("CPU usage: 45%"), &[CacheTier::Exact]);
        assert_eq!(written, vec![CacheTier::Exact]);

        let hit = store.lookup(&keys, &n).unwrap();
        assert_eq!(hit.tier, CacheTier::Exact);
        assert!(hit.response.metadata.cached);
        assert_eq!(hit.response.text, "CPU usage: 45%");
    }

    #[test]
    fn test_failed_response_is_never_stored() {
        let store = TierStore::default();
        let (keys, n) = keys_for("cpu usage");
        let failure = QueryResponse::failure("remote", "boom", "server");
        assert!(store.write_back(&keys, &n, &failure, &CacheTier::ALL).is_empty());
        assert!(!store.set(CacheTier::Exact, "k", &failure, "q", "auto"));
        assert_eq!(store.len(CacheTier::Exact), 0);
    }

    #[test]
    fn test_empty_pattern_is_never_cached() {
        let store = TierStore::default();
        let (keys, n) = keys_for("   ");
        assert!(store
            .write_back(&keys, &n, &answer("x"), &CacheTier::ALL)
            .is_empty());
        assert!(store.lookup(&keys, &n).is_none());
    }

    #[test]
    fn test_pattern_hit_is_adapted() {
        let store = TierStore::default();
        let (keys3, n3) = keys_for("disk usage on server 3");
        store.write_back(
            &keys3,
            &n3,
            &answer("Server 3 disk usage: 71%"),
            &[CacheTier::Pattern],
        );

        let (keys7, n7) = keys_for("disk usage on server 7");
        let hit = store.lookup(&keys7, &n7).unwrap();
        assert_eq!(hit.tier, CacheTier::Pattern);
        assert_eq!(hit.response.text, "Server 7 disk usage: 71%");
    }

    #[test]
    fn test_pattern_hit_without_adaptable_value_misses() {
        let store = TierStore::default();
        let (keys3, n3) = keys_for("disk usage on server 3");
        store.write_back(&keys3, &n3, &answer("Disk usage: 71%"), &[CacheTier::Pattern]);

        let (keys7, n7) = keys_for("disk usage on server 7");
        assert!(store.lookup(&keys7, &n7).is_none());
    }

    #[test]
    fn test_similarity_hit() {
        let store = TierStore::default();
        let (keys, n) = keys_for("show current cpu usage");
        store.write_back(&keys, &n, &answer("CPU at 40%"), &[CacheTier::Similarity]);

        let (near_keys, near) = keys_for("show the current cpu usage");
        let hit = store.lookup(&near_keys, &near).unwrap();
        assert_eq!(hit.tier, CacheTier::Similarity);

        let (far_keys, far) = keys_for("list open network ports");
        assert!(store.lookup(&far_keys, &far).is_none());
    }

    #[test]
    fn test_tier_order_prefers_exact() {
        let store = TierStore::default();
        let (keys, n) = keys_for("memory status");
        store.write_back(&keys, &n, &answer("exact"), &[CacheTier::Exact]);
        store.write_back(&keys, &n, &answer("predictive"), &[CacheTier::Predictive]);
        assert_eq!(store.lookup(&keys, &n).unwrap().tier, CacheTier::Exact);
    }

    #[test]
    fn test_insert_if_absent_or_older_keeps_newer_entry() {
        let store = TierStore::default();
        let started = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.set(CacheTier::Exact, "k", &answer("fresh"), "q", "auto"));

        assert!(!store.insert_if_absent_or_older(CacheTier::Exact, "k", &answer("stale"), "q", "auto", started));
        assert_eq!(store.get(CacheTier::Exact, "k").unwrap().text, "fresh");

        let later = Instant::now();
        assert!(store.insert_if_absent_or_older(CacheTier::Exact, "k", &answer("newer"), "q", "auto", later));
    }

    #[test]
    fn test_contended_write_is_dropped() {
        let store = Arc::new(TierStore::default());
        let guard = store.tiers[index(CacheTier::Exact)].lock();
        assert!(!store.set(CacheTier::Exact, "k", &answer("x"), "q", "auto"));
        drop(guard);

        let stats = store.stats();
        assert_eq!(stats[0].dropped_writes, 1);
        assert!(store.set(CacheTier::Exact, "k", &answer("x"), "q", "auto"));
    }

    #[test]
    fn test_predictive_trim_batch() {
        let store = TierStore::default();
        for i in 0..101 {
            store.set(
                CacheTier::Predictive,
                &format!("k{i}"),
                &answer("x"),
                "q",
                "auto",
            );
        }
        assert_eq!(store.len(CacheTier::Predictive), 51);
        assert_eq!(store.stats()[1].evictions, 50);
    }

    #[test]
    fn test_grow_capacity_is_bounded() {
        let mut config = CacheConfig::default();
        config.max_capacity = 1200;
        let store = TierStore::new(config);
        store.grow_capacity(1.5);
        assert_eq!(store.capacity(CacheTier::Exact), 1200);
        assert_eq!(store.capacity(CacheTier::Predictive), 150);
    }

    #[test]
    fn test_cleanup_expired() {
        let store = TierStore::default();
        store.set_with_ttl(
            CacheTier::Exact,
            "short",
            &answer("x"),
            "q",
            "auto",
            Duration::from_millis(1),
        );
        store.set(CacheTier::Exact, "long", &answer("y"), "q", "auto");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.cleanup_expired(), 1);
        assert_eq!(store.len(CacheTier::Exact), 1);
    }
}
