//! In-process [`RemoteStore`] used for single-instance deployments and tests.
//!
//! Several caches or limiters holding the same `Arc<MemoryStore>` behave like
//! separate processes sharing one Redis. The availability switch simulates an
//! outage of the shared store.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::pattern::GlobPattern;
use super::{RemoteStore, StoredValue};
use crate::error::{StoreError, StoreResult};
use crate::ttl::deadline;

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    available: AtomicBool,
    published: broadcast::Sender<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (published, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            published,
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Receive every `(channel, message)` published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.published.subscribe()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("memory store offline"))
        }
    }

    fn live(&self, key: &str) -> Option<MemoryEntry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.value().clone())
    }
}

fn parse_counter(data: &[u8]) -> StoreResult<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Command("value is not an integer".into()))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<StoredValue>> {
        self.check()?;
        let now = Instant::now();
        Ok(self.live(key).map(|entry| StoredValue {
            ttl: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            data: entry.data,
        }))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                data: value.to_vec(),
                expires_at: deadline(Instant::now(), ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now)))
    }

    async fn del_pattern(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        let glob = GlobPattern::new(pattern)
            .map_err(|e| StoreError::Command(format!("invalid pattern: {e}")))?;
        let now = Instant::now();

        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|e| glob.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();

        Ok(matched
            .into_iter()
            .filter(|key| {
                self.entries
                    .remove(key)
                    .is_some_and(|(_, e)| !e.is_expired(now))
            })
            .collect())
    }

    async fn incr_window(&self, key: &str, delta: i64, window: Duration) -> StoreResult<i64> {
        self.check()?;
        let now = Instant::now();
        // The entry guard holds the shard lock for the whole read-modify-write
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let count = parse_counter(&entry.data)? + delta;
                entry.data = count.to_string().into_bytes();
                if entry.expires_at.is_none() {
                    entry.expires_at = deadline(now, window);
                }
                Ok(count)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(MemoryEntry {
                    data: delta.to_string().into_bytes(),
                    expires_at: deadline(now, window),
                });
                Ok(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    data: delta.to_string().into_bytes(),
                    expires_at: deadline(now, window),
                });
                Ok(delta)
            }
        }
    }

    async fn decr_existing(&self, key: &str) -> StoreResult<Option<i64>> {
        self.check()?;
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                let current = parse_counter(&entry.data)?;
                if current <= 0 {
                    return Ok(None);
                }
                entry.data = (current - 1).to_string().into_bytes();
                Ok(Some(current - 1))
            }
            _ => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.check()?;
        // No subscribers is not an error for Pub/Sub
        let _ = self
            .published
            .send((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }
}
