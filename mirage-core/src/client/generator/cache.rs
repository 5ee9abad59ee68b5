//! Per-torrent identifier cache with idle eviction

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::torrent::InfoHash;

/// Entries not read for this long may be evicted.
pub const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(120 * 60);

/// Cached value with the time of its last read.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    value: T,
    last_access: Instant,
}

impl<T: Clone> CacheEntry<T> {
    pub fn new(value: T, now: Instant) -> Self {
        Self {
            value,
            last_access: now,
        }
    }

    /// Returns the value and marks the entry as used.
    pub fn read(&mut self, now: Instant) -> T {
        self.last_access = now;
        self.value.clone()
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) >= IDLE_EVICTION_THRESHOLD
    }
}

/// Read-mostly map of per-torrent entries.
///
/// The outer lock is only taken for writing on insert and eviction, so
/// lookups for different torrents never wait on each other's entry lock.
#[derive(Debug)]
pub struct IdentifierCache<T> {
    entries: RwLock<HashMap<InfoHash, Arc<Mutex<CacheEntry<T>>>>>,
}

impl<T: Clone> Default for IdentifierCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> IdentifierCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value, generating it on first use.
    pub fn get_or_insert_with(
        &self,
        info_hash: InfoHash,
        now: Instant,
        generate: impl FnOnce() -> T,
    ) -> T {
        let existing = self.entries.read().get(&info_hash).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => self
                .entries
                .write()
                .entry(info_hash)
                .or_insert_with(|| Arc::new(Mutex::new(CacheEntry::new(generate(), now))))
                .clone(),
        };
        let value = entry.lock().read(now);
        value
    }

    /// Stores a new value, replacing any previous one.
    pub fn replace(&self, info_hash: InfoHash, value: T, now: Instant) -> T {
        let entry = Arc::new(Mutex::new(CacheEntry::new(value.clone(), now)));
        self.entries.write().insert(info_hash, entry);
        value
    }

    pub fn remove(&self, info_hash: &InfoHash) -> bool {
        self.entries.write().remove(info_hash).is_some()
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.entries.read().contains_key(info_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes entries idle for at least [`IDLE_EVICTION_THRESHOLD`].
    ///
    /// Candidates are collected under the read lock, then each one is
    /// re-checked under the write lock before removal since it may have
    /// been read in between.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let candidates: Vec<InfoHash> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.lock().is_idle(now))
            .map(|(info_hash, _)| *info_hash)
            .collect();

        if candidates.is_empty() {
            return 0;
        }

        let mut entries = self.entries.write();
        let mut evicted = 0;
        for info_hash in candidates {
            let still_idle = entries
                .get(&info_hash)
                .is_some_and(|entry| entry.lock().is_idle(now));
            if still_idle {
                entries.remove(&info_hash);
                evicted += 1;
            }
        }
        evicted
    }
}
