//! The in-memory block cache backing remote files.
//!
//! Remote files are read in fixed-size blocks. Every block is keyed by the identity of the
//! remote file version it was read from, so blocks of a replaced file can never be served
//! for its successor.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};

use bytes::Bytes;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use url::Url;

use crate::caching::RemoteVersion;
use crate::config::BlockCacheConfig;

/// Identifies one version of a remote file.
///
/// Derived from the URL and everything the origin told us about the version, so a replaced
/// file gets a different id even if it has the same URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    pub fn new(url: &Url, version: &RemoteVersion) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(version.size.to_le_bytes());
        if let Some(modified) = version.last_modified {
            let nanos = modified
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos());
            hasher.update(nanos.to_le_bytes());
        }
        hasher.update([0]);
        if let Some(etag) = &version.etag {
            hasher.update(etag.as_bytes());
        }

        let digest = hasher.finalize();
        let mut id = [0; 8];
        id.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(id))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A block of a specific remote file version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub file: FileId,
    pub index: u64,
}

impl BlockId {
    pub fn new(file: FileId, index: u64) -> Self {
        Self { file, index }
    }
}

/// Storage for blocks of remote files.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Returns the block if it is cached, and marks it as accessed.
    fn get(&self, id: &BlockId) -> Option<Bytes>;

    fn insert(&self, id: BlockId, data: Bytes);

    /// Removes all blocks of `file` that were not accessed within `older_than`.
    ///
    /// Returns the number of removed blocks.
    fn delete_blocks(&self, file: FileId, older_than: Duration) -> usize;

    /// Lists the blocks of `file` that were accessed within `max_age`.
    fn active_blocks(&self, file: FileId, max_age: Duration) -> Vec<BlockId>;
}

struct CachedBlock {
    data: Bytes,
    /// Milliseconds since the store's epoch.
    accessed: AtomicU64,
}

/// A [`BlockStore`] holding blocks in memory, bounded by their total size.
pub struct MemoryBlockStore {
    cache: Cache<BlockId, Arc<CachedBlock>>,
    epoch: Instant,
}

impl fmt::Debug for MemoryBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlockStore")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryBlockStore {
    pub fn new(config: &BlockCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .weigher(|_id: &BlockId, block: &Arc<CachedBlock>| {
                block.data.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self {
            cache,
            epoch: Instant::now(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Iterates the blocks of `file`, along with how long ago they were accessed.
    fn blocks_of(&self, file: FileId) -> impl Iterator<Item = (BlockId, Duration)> + '_ {
        let now = self.now();
        self.cache
            .iter()
            .filter(move |(id, _)| id.file == file)
            .map(move |(id, block)| {
                let accessed = block.accessed.load(Ordering::Relaxed);
                (*id, Duration::from_millis(now.saturating_sub(accessed)))
            })
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, id: &BlockId) -> Option<Bytes> {
        let block = self.cache.get(id)?;
        block.accessed.store(self.now(), Ordering::Relaxed);
        Some(block.data.clone())
    }

    fn insert(&self, id: BlockId, data: Bytes) {
        metric!(counter("blocks.inserted") += 1);
        let block = CachedBlock {
            data,
            accessed: AtomicU64::new(self.now()),
        };
        self.cache.insert(id, Arc::new(block));
    }

    fn delete_blocks(&self, file: FileId, older_than: Duration) -> usize {
        let stale: Vec<_> = self
            .blocks_of(file)
            .filter(|(_, age)| *age >= older_than)
            .map(|(id, _)| id)
            .collect();
        for id in &stale {
            self.cache.invalidate(id);
        }
        metric!(counter("blocks.deleted") += stale.len() as i64);
        stale.len()
    }

    fn active_blocks(&self, file: FileId, max_age: Duration) -> Vec<BlockId> {
        let mut active: Vec<_> = self
            .blocks_of(file)
            .filter(|(_, age)| *age < max_age)
            .map(|(id, _)| id)
            .collect();
        active.sort_unstable();
        active
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn file_id(etag: &str) -> FileId {
        let url = Url::parse("https://example.com/a.om").unwrap();
        let version = RemoteVersion {
            size: 100,
            last_modified: None,
            etag: Some(etag.into()),
        };
        FileId::new(&url, &version)
    }

    #[test]
    fn test_file_ids() {
        let url = Url::parse("https://example.com/a.om").unwrap();
        let version = RemoteVersion {
            size: 100,
            last_modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            etag: None,
        };
        assert_eq!(FileId::new(&url, &version), FileId::new(&url, &version));

        let resized = RemoteVersion {
            size: 101,
            ..version.clone()
        };
        assert_ne!(FileId::new(&url, &version), FileId::new(&url, &resized));

        let other = Url::parse("https://example.com/b.om").unwrap();
        assert_ne!(FileId::new(&url, &version), FileId::new(&other, &version));

        assert_ne!(file_id("\"v1\""), file_id("\"v2\""));
    }

    #[test]
    fn test_get_insert() {
        let store = MemoryBlockStore::new(&BlockCacheConfig::default());
        let file = file_id("\"v1\"");

        assert_eq!(store.get(&BlockId::new(file, 0)), None);
        store.insert(BlockId::new(file, 0), Bytes::from_static(b"block zero"));
        assert_eq!(
            store.get(&BlockId::new(file, 0)),
            Some(Bytes::from_static(b"block zero"))
        );
        assert_eq!(store.get(&BlockId::new(file_id("\"v2\""), 0)), None);
    }

    #[test]
    fn test_delete_and_active_blocks() {
        let store = MemoryBlockStore::new(&BlockCacheConfig::default());
        let old = file_id("\"v1\"");
        let new = file_id("\"v2\"");

        for index in 0..3 {
            store.insert(BlockId::new(old, index), Bytes::from_static(b"old"));
        }
        store.insert(BlockId::new(new, 0), Bytes::from_static(b"new"));

        assert_eq!(
            store.active_blocks(old, Duration::from_secs(60)),
            vec![
                BlockId::new(old, 0),
                BlockId::new(old, 1),
                BlockId::new(old, 2)
            ]
        );
        assert!(store.active_blocks(old, Duration::ZERO).is_empty());

        // everything was accessed just now, nothing is older than a minute
        assert_eq!(store.delete_blocks(old, Duration::from_secs(60)), 0);
        assert_eq!(store.delete_blocks(old, Duration::ZERO), 3);
        assert_eq!(store.get(&BlockId::new(old, 1)), None);
        assert_eq!(
            store.get(&BlockId::new(new, 0)),
            Some(Bytes::from_static(b"new"))
        );
    }
}
