//! # Viewport Cache
//!
//! Least Recently Used cache of viewport responses keyed by the full query string.
//! Entries also expire after a fixed age so a long-lived page eventually sees
//! fresh listings for a viewport it keeps returning to.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::Location;

#[derive(Debug)]
struct CachedViewport {
    locations: Vec<Location>,
    stored_at: Instant,
}

/// LRU cache of viewport responses with time-based expiry.
///
/// A capacity of zero disables caching entirely.
#[derive(Debug)]
pub struct ViewportCache {
    entries: Option<LruCache<String, CachedViewport>>,
    ttl: Duration,
}

impl ViewportCache {
    /// Create a cache holding at most `capacity` viewports for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Get a cloned response, refreshing its recency. Expired entries are dropped.
    pub fn get(&mut self, query: &str, now: Instant) -> Option<Vec<Location>> {
        let entries = self.entries.as_mut()?;
        let expired = match entries.get(query) {
            Some(entry) => now.saturating_duration_since(entry.stored_at) >= self.ttl,
            None => return None,
        };
        if expired {
            entries.pop(query);
            return None;
        }
        entries.get(query).map(|entry| entry.locations.clone())
    }

    /// Store a response, evicting the least recently used one if at capacity.
    pub fn insert(&mut self, query: String, locations: Vec<Location>, now: Instant) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(
                query,
                CachedViewport {
                    locations,
                    stored_at: now,
                },
            );
        }
    }

    /// Remove a specific query from the cache.
    pub fn invalidate(&mut self, query: &str) {
        if let Some(entries) = self.entries.as_mut() {
            entries.pop(query);
        }
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, query: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.contains(query))
    }
}
