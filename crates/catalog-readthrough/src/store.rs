//! In-memory cache of shaped listings, keyed by query shape.

use crate::query::QueryShape;
use crate::shaper::NormalizedRecord;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Staleness tier of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    /// Served without contacting the upstream.
    Fresh,
    /// Served immediately while a background refresh runs.
    StaleButServeable,
    /// Too old to serve first; a synchronous fetch is required.
    Expired,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::StaleButServeable => "stale",
            Freshness::Expired => "expired",
        }
    }
}

/// Age thresholds for [`Freshness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Entries younger than this are [`Freshness::Fresh`].
    pub fresh_window: Duration,
    /// Entries younger than this (and at least `fresh_window` old) are
    /// [`Freshness::StaleButServeable`]; anything older is expired.
    pub max_serve_window: Duration,
}

impl FreshnessPolicy {
    pub fn new(fresh_window: Duration, max_serve_window: Duration) -> Self {
        Self {
            fresh_window,
            max_serve_window: max_serve_window.max(fresh_window),
        }
    }

    pub fn classify(&self, age: Duration) -> Freshness {
        if age < self.fresh_window {
            Freshness::Fresh
        } else if age < self.max_serve_window {
            Freshness::StaleButServeable
        } else {
            Freshness::Expired
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }
}

/// An immutable snapshot of one successful fetch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Arc<[NormalizedRecord]>,
    stored_at: Instant,
    source: String,
}

impl CacheEntry {
    pub fn new(payload: Arc<[NormalizedRecord]>, source: impl Into<String>, stored_at: Instant) -> Self {
        Self {
            payload,
            stored_at,
            source: source.into(),
        }
    }

    pub fn payload(&self) -> &[NormalizedRecord] {
        &self.payload
    }

    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    /// Label of the endpoint candidate that produced the payload.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Map from [`QueryShape`] to the latest [`CacheEntry`].
///
/// Entries are replaced wholesale behind an `Arc`, so a reader holding an
/// entry keeps a consistent snapshot while a writer swaps in the next one.
/// Writes never move `stored_at` backwards.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<QueryShape, Arc<CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &QueryShape) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Replaces the entry for `key`, stamping it with `now`.
    ///
    /// If the current entry is newer than `now` it is kept and returned
    /// instead.
    pub fn put(
        &self,
        key: QueryShape,
        payload: Vec<NormalizedRecord>,
        source: impl Into<String>,
        now: Instant,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(payload.into(), source, now));
        self.commit(key, entry)
    }

    /// Re-stamps the existing entry for `key` with `now`, keeping its payload.
    pub fn touch(&self, key: &QueryShape, now: Instant) -> Option<Arc<CacheEntry>> {
        let current = self.get(key)?;
        let entry = Arc::new(CacheEntry::new(
            Arc::clone(&current.payload),
            current.source.clone(),
            now,
        ));
        Some(self.commit(key.clone(), entry))
    }

    fn commit(&self, key: QueryShape, entry: Arc<CacheEntry>) -> Arc<CacheEntry> {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(current) if current.stored_at > entry.stored_at => Arc::clone(current),
            _ => {
                entries.insert(key, Arc::clone(&entry));
                entry
            }
        }
    }

    /// Age of the entry for `key`, if there is one.
    pub fn age_of(&self, key: &QueryShape, now: Instant) -> Option<Duration> {
        self.get(key).map(|entry| entry.age(now))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
