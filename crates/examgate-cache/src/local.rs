//! Tier 1: the in-process, bounded-lifetime map.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::store::GlobPattern;
use crate::ttl::deadline;

/// A tier-1 entry.
///
/// The data is wrapped in `Arc` so hits hand out a cheap clone.
#[derive(Clone, Debug)]
pub struct LocalEntry {
    pub data: Arc<Vec<u8>>,
    pub stored_at: Instant,
    pub expires_at: Option<Instant>,
}

impl LocalEntry {
    pub fn new(data: Arc<Vec<u8>>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            data,
            stored_at: now,
            expires_at: deadline(now, ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Concurrent map with per-entry expiry and a hard entry cap.
///
/// At capacity, expired entries are swept first; if the map is still full the
/// insert is skipped rather than evicting live entries.
pub struct LocalTier {
    entries: DashMap<String, LocalEntry>,
    max_entries: usize,
}

impl LocalTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
            return None;
        }
        Some(Arc::clone(&entry.data))
    }

    /// Store an entry. Returns `false` when the tier is full of live entries.
    pub fn insert(&self, key: &str, data: Arc<Vec<u8>>, ttl: Duration) -> bool {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.cleanup_expired();
            if self.entries.len() >= self.max_entries {
                tracing::warn!(
                    max_entries = self.max_entries,
                    "local cache at capacity, skipping insertion"
                );
                return false;
            }
        }
        self.entries
            .insert(key.to_string(), LocalEntry::new(data, ttl));
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching the pattern and return the removed keys.
    pub fn remove_matching(&self, pattern: &GlobPattern) -> Vec<String> {
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|e| pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        matched
            .into_iter()
            .filter(|key| self.entries.remove(key).is_some())
            .collect()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Sum of key and value sizes held in the map.
    pub fn approx_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.key().len() + e.data.len()) as u64)
            .sum()
    }
}
