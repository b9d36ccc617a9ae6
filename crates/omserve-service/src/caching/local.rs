use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::config::LocalCacheConfig;
use crate::files::{FileIdentity, FileKey, LocalFile};

use super::{CacheError, Sweep, SweepStats};

#[derive(Debug)]
struct LocalEntry {
    file: Option<Arc<LocalFile>>,
    /// The invalid file at the path when `file` is `None`.
    rejected: Option<FileIdentity>,
    last_accessed: Instant,
}

/// Caches opened local files, for deployments without a remote origin.
///
/// Opening a local file is cheap and never blocks on the network, so concurrent lookups are
/// not coalesced. A file that is opened twice concurrently is only cached once.
#[derive(Debug)]
pub struct LocalFileCache<K: FileKey> {
    entries: Arc<Mutex<HashMap<K, LocalEntry>>>,
    config: LocalCacheConfig,
}

impl<K: FileKey> Clone for LocalFileCache<K> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            config: self.config,
        }
    }
}

impl<K: FileKey> LocalFileCache<K> {
    pub fn new(config: LocalCacheConfig) -> Self {
        Self {
            entries: Arc::default(),
            config,
        }
    }

    /// Returns the opened file of `key`, or `None` if there is no valid file.
    pub fn get(&self, key: &K) -> Option<Arc<LocalFile>> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get_mut(key) {
                metric!(counter("caches.local.hit") += 1);
                entry.last_accessed = Instant::now();
                return entry.file.clone();
            }
        }
        metric!(counter("caches.local.miss") += 1);

        let path = key.local_path();
        let identity = FileIdentity::of(&path);
        let (file, rejected) = match LocalFile::open(&path, |header| key.check_header(header)) {
            Ok(file) => (Some(Arc::new(file)), None),
            Err(CacheError::NotFound) => (None, None),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to open local file {}",
                    path.display()
                );
                (None, identity)
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_insert(LocalEntry {
            file,
            rejected,
            last_accessed: Instant::now(),
        });
        entry.file.clone()
    }

    /// Evicts entries that are unused, or no longer match what is on local storage.
    pub fn revalidate(&self) -> SweepStats {
        let mut stats = SweepStats {
            ticks: 1,
            ..Default::default()
        };

        let snapshot: Vec<_> = {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .map(|(key, entry)| {
                    (
                        key.clone(),
                        entry.file.clone(),
                        entry.rejected.clone(),
                        entry.last_accessed,
                    )
                })
                .collect()
        };

        let mut evict = Vec::new();
        for (key, file, rejected, last_accessed) in snapshot {
            if last_accessed.elapsed() >= self.config.max_unused_for {
                stats.evicted_inactive += 1;
                evict.push((key, file));
                continue;
            }
            let modified = match &file {
                Some(file) => file.was_modified(),
                None => FileIdentity::of(&key.local_path()) != rejected,
            };
            if modified {
                tracing::debug!("Local file of {:?} changed", key);
                stats.local_modified += 1;
                evict.push((key, file));
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, file) in evict {
            // entries that were replaced since the snapshot are kept
            let unchanged = entries.get(&key).is_some_and(|entry| {
                match (&entry.file, &file) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                }
            });
            if unchanged {
                entries.remove(&key);
            }
        }
        stats.entries = entries.len() as u64;

        stats
    }
}

impl<K: FileKey> Sweep for LocalFileCache<K> {
    const NAME: &'static str = "local";

    fn sweep(&self) -> impl Future<Output = SweepStats> + Send {
        std::future::ready(self.revalidate())
    }
}
