//! In-memory storage backend
//!
//! Default storage implementation using a mutex-guarded hashmap.
//! Suitable for development, tests and single-instance deployments.
//! Expiry is measured on the tokio clock, so paused-time tests can
//! advance past a TTL deterministically.
//!
//! Expired entries are ignored on read and swept from the map every
//! `sweep_interval` writes, so unique keys such as nonces do not accumulate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{check_ttl, CoordinationStore, StorageError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Writes between sweeps of expired entries
pub const DEFAULT_SWEEP_INTERVAL: usize = 1024;

/// In-memory coordination store implementation
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicUsize,
    sweep_interval: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired entries every `writes` writes instead of the default
    pub fn with_sweep_interval(mut self, writes: usize) -> Self {
        self.sweep_interval = writes.max(1);
        self
    }

    /// Unconditionally write a value, replacing any existing entry
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let now = Instant::now();
        let entry = Entry {
            value: value.into(),
            expires_at: now + ttl,
        };
        let mut entries = self.entries.lock();
        entries.insert(key.into(), entry);
        self.after_write(&mut entries, now);
    }

    /// Count a write and sweep once the interval is reached
    fn after_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes >= self.sweep_interval {
            self.writes.store(0, Ordering::Relaxed);
            sweep(entries, now);
        }
    }

    /// Remove a key regardless of its value
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remaining lifetime of a live key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at - now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Whether no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries held, including expired ones not yet swept
    pub fn retained(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop expired entries now
    pub fn purge_expired(&self) -> usize {
        sweep(&mut self.entries.lock(), Instant::now())
    }
}

fn sweep(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.is_live(now));
    let purged = before - entries.len();
    if purged > 0 {
        debug!(purged, "Purged expired coordination keys");
    }
    purged
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        self.after_write(&mut entries, now);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}
