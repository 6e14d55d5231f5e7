//! # chartmatch caching infrastructure
//!
//! Both halves of the engine lean on the same persistent cache primitive: the proxy pool
//! remembers known-good egress addresses, and the resolver remembers search outcomes so
//! repeat runs within the TTL window issue no network calls at all.
//!
//! A [`FileCache`] is an in-memory index of `{value, stored_at, ttl}` rows backed by a
//! single JSON document on disk. Reads never touch the disk after the initial load.
//! Writes are buffered and flushed once a configurable number of them has accumulated,
//! or on an explicit [`FileCache::flush`], trading write amplification for throughput.
//!
//! Cache content is never authoritative: a missing or corrupt file on load simply means
//! an empty cache and some extra network calls, never a failure. Expired rows are
//! ignored lazily on read and only dropped from storage when a flush compacts the store.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

/// Errors that can happen while writing a cache back to durable storage.
///
/// Load-time problems intentionally have no representation here: a cache that cannot be
/// read is treated as empty.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Writing the cache file failed.
    #[error("failed to write cache file: {0}")]
    Io(#[from] std::io::Error),
    /// The in-memory index could not be serialized.
    #[error("failed to serialize cache contents: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Counts of rows in a cache, split by validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// All rows currently held in the index, including expired ones.
    pub total: usize,
    /// Rows that are still within their TTL.
    pub valid: usize,
    /// Rows past their TTL that will be dropped on the next flush.
    pub expired: usize,
}

/// One persisted cache row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct CacheRow<V> {
    value: V,
    /// Seconds since the Unix epoch at which the value was stored.
    stored_at: u64,
    /// Time-to-live in seconds; the row is valid while `now < stored_at + ttl`.
    ttl_secs: u64,
}

impl<V> CacheRow<V> {
    fn is_valid(&self, now: u64) -> bool {
        now < self.stored_at.saturating_add(self.ttl_secs)
    }
}

#[derive(Debug)]
struct Index<V> {
    rows: HashMap<String, CacheRow<V>>,
    /// Number of mutations since the last durable write.
    pending_writes: usize,
}

/// A persistent key→value store with per-row expiry and batched durability.
///
/// Safe for concurrent use: the in-memory index is guarded by a single mutex which is
/// released before any durable I/O, and flushes are serialized among themselves so the
/// file on disk is only ever written by one flush at a time.
#[derive(Debug)]
pub struct FileCache<V> {
    /// Path of the durable JSON document. `None` disables persistence entirely.
    path: Option<PathBuf>,
    batch_size: usize,
    index: Mutex<Index<V>>,
    flush_guard: Mutex<()>,
}

impl<V> FileCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Opens a cache, loading any previously persisted rows.
    ///
    /// A missing or malformed file yields an empty cache. Rows that expired since they
    /// were written are kept in the index (they are cheap) and skipped on read; the next
    /// flush drops them from storage.
    pub fn open(path: Option<PathBuf>, batch_size: usize) -> Self {
        let rows = path.as_deref().map(load_rows).unwrap_or_default();

        Self {
            path,
            batch_size: batch_size.max(1),
            index: Mutex::new(Index {
                rows,
                pending_writes: 0,
            }),
            flush_guard: Mutex::new(()),
        }
    }

    /// Returns the value stored under `key` iff an unexpired row exists.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = unix_now();
        let mut index = self.index.lock();
        match index.rows.get(key) {
            Some(row) if row.is_valid(now) => Some(row.value.clone()),
            Some(_) => {
                // Lazy expiry: drop the stale row from the index, the durable copy
                // lives on until the next flush compacts the store.
                index.rows.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts or overwrites the row under `key`. Last write wins.
    ///
    /// Writeback happens once `batch_size` mutations have accumulated. A failing
    /// writeback is logged and otherwise ignored; the row stays in the index and the
    /// next flush retries.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let row = CacheRow {
            value,
            stored_at: unix_now(),
            ttl_secs: ttl.as_secs(),
        };

        let needs_flush = {
            let mut index = self.index.lock();
            index.rows.insert(key.into(), row);
            index.pending_writes += 1;
            index.pending_writes >= self.batch_size
        };

        if needs_flush {
            if let Err(error) = self.flush() {
                tracing::warn!(%error, "batched cache writeback failed");
            }
        }
    }

    /// Removes the row under `key`, if any.
    pub fn delete(&self, key: &str) {
        let mut index = self.index.lock();
        if index.rows.remove(key).is_some() {
            index.pending_writes += 1;
        }
    }

    /// Forces a durable write of the current index.
    ///
    /// Expired rows are compacted away in the same pass. Concurrent flushes are
    /// serialized; reads and writes of the index proceed while the file is written.
    pub fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = self.path.as_deref() else {
            self.index.lock().pending_writes = 0;
            return Ok(());
        };

        let _flushing = self.flush_guard.lock();

        let snapshot = {
            let now = unix_now();
            let mut index = self.index.lock();
            index.rows.retain(|_, row| row.is_valid(now));
            index.pending_writes = 0;
            index.rows.clone()
        };

        // Serialize and write outside the index lock so unrelated workers are not
        // stalled on writeback.
        let body = serde_json::to_vec_pretty(&snapshot)?;
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp_file = match parent {
            Some(parent) => NamedTempFile::new_in(parent)?,
            None => NamedTempFile::new()?,
        };
        temp_file.write_all(&body)?;
        temp_file.persist(path).map_err(|e| e.error)?;

        Ok(())
    }

    /// Number of valid (non-expired) rows.
    pub fn len(&self) -> usize {
        let now = unix_now();
        let index = self.index.lock();
        index.rows.values().filter(|row| row.is_valid(now)).count()
    }

    /// Whether the cache holds no valid rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row counts split by validity, for logging.
    pub fn stats(&self) -> CacheStats {
        let now = unix_now();
        let index = self.index.lock();
        let total = index.rows.len();
        let valid = index.rows.values().filter(|row| row.is_valid(now)).count();
        CacheStats {
            total,
            valid,
            expired: total - valid,
        }
    }

    /// Snapshot of all valid rows, keyed by cache key.
    pub fn valid_rows(&self) -> Vec<(String, V)> {
        let now = unix_now();
        let index = self.index.lock();
        index
            .rows
            .iter()
            .filter(|(_, row)| row.is_valid(now))
            .map(|(key, row)| (key.clone(), row.value.clone()))
            .collect()
    }
}

fn load_rows<V: DeserializeOwned>(path: &std::path::Path) -> HashMap<String, CacheRow<V>> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "failed to read cache file, starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice(&body) {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "malformed cache file, starting empty");
            HashMap::new()
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
