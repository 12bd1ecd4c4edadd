//! Turbo Statistics
//!
//! Counters reported by the memory store, the provider chain and the
//! prefetch worker. The sink never calls back into the cache.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Statistics sink.
///
/// Every method defaults to a no-op so implementors only override what
/// they care about.
pub trait TurboStatistics: Send + Sync {
    /// A read or prepare asked for an attribute
    fn attribute_request(&self) {}

    /// The request was answered from memory
    fn memory_hit(&self) {}

    /// The request was answered by a provider
    fn provider_hit(&self) {}

    /// A prefetch worker thread was started
    fn background_thread_started(&self) {}

    /// A background request was already pending
    fn duplicate_request(&self) {}

    /// The worker found the value already cached by another path
    fn background_hit_elsewhere(&self) {}

    /// Pending queue length seen when a request was added
    fn queue_size_observed(&self, _size: usize) {}

    /// Whether `key_added`/`key_removed` want to see keys. The memory
    /// store skips formatting keys when this is false.
    fn tracks_keys(&self) -> bool {
        false
    }

    /// A new key entered the memory store
    fn key_added(&self, _key: &str) {}

    /// A key left the memory store
    fn key_removed(&self, _key: &str) {}

    /// The cache is shutting down
    fn shutdown(&self) {}
}

/// Default sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStatistics;

impl TurboStatistics for NoStatistics {}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub attribute_requests: u64,
    pub memory_hits: u64,
    pub provider_hits: u64,
    pub background_threads: u64,
    pub duplicate_requests: u64,
    pub background_hits_elsewhere: u64,
    pub max_queue_size: usize,
    pub keys_added: u64,
    pub keys_removed: u64,
}

impl StatisticsSnapshot {
    /// Fraction of requests answered from memory
    pub fn hit_ratio(&self) -> f64 {
        let total = self.memory_hits + self.provider_hits;
        if total == 0 {
            0.0
        } else {
            self.memory_hits as f64 / total as f64
        }
    }

    /// Keys currently accounted as cached
    pub fn live_keys(&self) -> u64 {
        self.keys_added.saturating_sub(self.keys_removed)
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} memory_hits={} provider_hits={} hit_ratio={:.2} \
             threads={} duplicates={} max_queue={} keys={} (+{} -{})",
            self.attribute_requests,
            self.memory_hits,
            self.provider_hits,
            self.hit_ratio(),
            self.background_threads,
            self.duplicate_requests,
            self.max_queue_size,
            self.live_keys(),
            self.keys_added,
            self.keys_removed,
        )
    }
}

struct KeyLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

/// Counting sink with an optional append-only key log.
///
/// The log gets one `+ <key>` line per added key and one `- <key>` line
/// per removed key; keys that have a `+` but never a `-` after a long run
/// are leak candidates.
#[derive(Default)]
pub struct CountingStatistics {
    attribute_requests: AtomicU64,
    memory_hits: AtomicU64,
    provider_hits: AtomicU64,
    background_threads: AtomicU64,
    duplicate_requests: AtomicU64,
    background_hits_elsewhere: AtomicU64,
    max_queue_size: AtomicUsize,
    keys_added: AtomicU64,
    keys_removed: AtomicU64,
    log: Mutex<Option<KeyLog>>,
    shut_down: AtomicBool,
}

impl CountingStatistics {
    /// Create a counting sink without a log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a counting sink appending to the log file at `path`
    pub fn with_log(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::StatisticsLog {
                path: path.display().to_string(),
                source,
            })?;
        let stats = Self::new();
        *stats.log.lock() = Some(KeyLog {
            path,
            writer: BufWriter::new(file),
        });
        Ok(stats)
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            attribute_requests: self.attribute_requests.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            provider_hits: self.provider_hits.load(Ordering::Relaxed),
            background_threads: self.background_threads.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            background_hits_elsewhere: self.background_hits_elsewhere.load(Ordering::Relaxed),
            max_queue_size: self.max_queue_size.load(Ordering::Relaxed),
            keys_added: self.keys_added.load(Ordering::Relaxed),
            keys_removed: self.keys_removed.load(Ordering::Relaxed),
        }
    }

    fn append(&self, line: fmt::Arguments<'_>) {
        let mut guard = self.log.lock();
        let Some(log) = guard.as_mut() else {
            return;
        };
        if let Err(e) = log.writer.write_fmt(line).and_then(|_| log.writer.write_all(b"\n")) {
            warn!(path = %log.path.display(), "Statistics log write failed, disabling: {}", e);
            *guard = None;
        }
    }
}

impl TurboStatistics for CountingStatistics {
    fn attribute_request(&self) {
        self.attribute_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn provider_hit(&self) {
        self.provider_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn background_thread_started(&self) {
        self.background_threads.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_request(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn background_hit_elsewhere(&self) {
        self.background_hits_elsewhere.fetch_add(1, Ordering::Relaxed);
    }

    fn queue_size_observed(&self, size: usize) {
        self.max_queue_size.fetch_max(size, Ordering::Relaxed);
    }

    fn tracks_keys(&self) -> bool {
        true
    }

    fn key_added(&self, key: &str) {
        self.keys_added.fetch_add(1, Ordering::Relaxed);
        self.append(format_args!("+ {}", key));
    }

    fn key_removed(&self, key: &str) {
        self.keys_removed.fetch_add(1, Ordering::Relaxed);
        self.append(format_args!("- {}", key));
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let summary = self.snapshot();
        self.append(format_args!("# {}", summary));
        if let Some(log) = self.log.lock().as_mut() {
            if let Err(e) = log.writer.flush() {
                warn!(path = %log.path.display(), "Statistics log flush failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for CountingStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingStatistics")
            .field("snapshot", &self.snapshot())
            .field("logging", &self.log.lock().is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
