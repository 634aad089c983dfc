//! A single fixed-capacity cache tier
//!
//! Not synchronized; [`super::store::TierStore`] wraps each tier in a mutex.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::entry::CacheEntry;
use super::TierSettings;

/// One tier's entries plus its recency order
#[derive(Debug)]
pub struct TierCache {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order, newest at the back
    recency: VecDeque<String>,
    settings: TierSettings,
}

impl TierCache {
    /// Create an empty tier
    #[must_use]
    pub fn new(settings: TierSettings) -> Self {
        Self {
            entries: HashMap::with_capacity(settings.capacity.min(1024)),
            recency: VecDeque::new(),
            settings,
        }
    }

    /// Tier settings
    #[must_use]
    pub fn settings(&self) -> &TierSettings {
        &self.settings
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve an entry, counting the hit. Expired entries are dropped.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<&CacheEntry> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.touch();
        Some(entry)
    }

    /// Look at an entry without counting a hit
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, entry: CacheEntry) {
        let key = entry.key.clone();
        if self.entries.insert(key.clone(), entry).is_some() {
            self.recency.retain(|k| k != &key);
        }
        self.recency.push_back(key);
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.recency.retain(|k| k != key);
        }
        removed
    }

    /// Evict entries until the tier fits its capacity
    ///
    /// At least `trim_batch` entries go once the tier overflows. Victims are
    /// chosen by the smallest frequency-weighted score. Returns the number
    /// of evicted entries.
    pub fn evict_if_over_capacity(&mut self, bonus_window: Duration) -> usize {
        let len = self.entries.len();
        if len <= self.settings.capacity {
            return 0;
        }
        let excess = len - self.settings.capacity;
        let count = excess.max(self.settings.trim_batch).min(len);

        // Oldest insertions first so equal scores evict the older entry
        let mut scored: Vec<(Instant, String)> = self
            .recency
            .iter()
            .filter_map(|k| self.entries.get(k))
            .map(|e| (e.eviction_score(bonus_window), e.key.clone()))
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in scored.into_iter().take(count) {
            self.remove(&key);
        }
        count
    }

    /// Drop every expired entry
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Most recent live entries first, at most `limit` of them
    pub fn recent(&self, limit: usize, now: Instant) -> impl Iterator<Item = &CacheEntry> + '_ {
        self.recency
            .iter()
            .rev()
            .filter_map(move |k| self.entries.get(k))
            .filter(move |e| !e.is_expired(now))
            .take(limit)
    }

    /// Change capacity; shrinking takes effect at the next eviction pass
    pub fn set_capacity(&mut self, capacity: usize) {
        self.settings.capacity = capacity;
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
