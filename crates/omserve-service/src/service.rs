//! Serving byte ranges of array files.
//!
//! The [`FileService`] is the entry point used by the web server. It owns the resolution cache,
//! and the background sweeper that keeps it current.

use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use thiserror::Error;

use crate::blocks::MemoryBlockStore;
use crate::caching::{
    BackendResolver, BackgroundSweeper, CacheContents, LocalFileCache, ResolutionCache,
    VersionStore,
};
use crate::config::Config;
use crate::files::{Backend, DataFileKey, FileLayout};
use crate::http::HttpOrigin;

/// A requested range of bytes, as given in a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// The entire file.
    Full,
    /// Everything from the given offset.
    From(u64),
    /// The given offsets, both inclusive.
    Bounded(u64, u64),
    /// The given number of bytes at the end of the file.
    Suffix(u64),
}

impl ByteRange {
    /// Resolves the range against a file of `len` bytes.
    ///
    /// Returns `None` if the range is not satisfiable. Ranges reaching past the end of the file
    /// are truncated.
    pub fn resolve(self, len: u64) -> Option<Range<u64>> {
        match self {
            Self::Full => Some(0..len),
            Self::From(start) => (start < len).then_some(start..len),
            Self::Bounded(start, end) => {
                (start < len && start <= end).then(|| start..end.saturating_add(1).min(len))
            }
            Self::Suffix(count) => (count > 0 && len > 0).then(|| len.saturating_sub(count)..len),
        }
    }
}

/// An error parsing a [`ByteRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidRange {
    #[error("range unit is not bytes")]
    NotBytes,
    #[error("multiple ranges are not supported")]
    Multiple,
    #[error("range is malformed")]
    Malformed,
}

impl FromStr for ByteRange {
    type Err = InvalidRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ranges = s
            .trim()
            .strip_prefix("bytes=")
            .ok_or(InvalidRange::NotBytes)?;
        if ranges.contains(',') {
            return Err(InvalidRange::Multiple);
        }

        let (start, end) = ranges.split_once('-').ok_or(InvalidRange::Malformed)?;
        let parse = |value: &str| value.trim().parse::<u64>().map_err(|_| InvalidRange::Malformed);
        match (start.trim(), end.trim()) {
            ("", "") => Err(InvalidRange::Malformed),
            ("", count) => Ok(Self::Suffix(parse(count)?)),
            (start, "") => Ok(Self::From(parse(start)?)),
            (start, end) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(InvalidRange::Malformed);
                }
                Ok(Self::Bounded(start, end))
            }
        }
    }
}

/// Bytes read from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// The size of the entire file.
    pub total: u64,
    /// The range of the file contained in `data`.
    pub range: Range<u64>,
    pub data: Bytes,
    /// Whether a range was requested, as opposed to the entire file.
    pub partial: bool,
}

/// The result of [`FileService::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The file does not exist.
    Missing,
    /// The requested range lies outside of the file.
    Unsatisfiable { total: u64 },
    Slice(FileSlice),
}

async fn read_backend(backend: Backend, range: ByteRange) -> CacheContents<ReadOutcome> {
    let total = backend.len();
    let Some(resolved) = range.resolve(total) else {
        return Ok(ReadOutcome::Unsatisfiable { total });
    };

    let data = backend
        .read(resolved.start, resolved.end - resolved.start)
        .await?;
    Ok(ReadOutcome::Slice(FileSlice {
        total,
        range: resolved,
        data,
        partial: range != ByteRange::Full,
    }))
}

/// The cache used by a [`FileService`], depending on whether a remote origin is configured.
#[derive(Debug, Clone)]
pub enum FileCache {
    Local(LocalFileCache<DataFileKey>),
    Hybrid(ResolutionCache<DataFileKey>),
}

/// Serves array files from local storage, and the remote origin if one is configured.
#[derive(Debug)]
pub struct FileService {
    layout: Arc<FileLayout>,
    cache: FileCache,
    _sweeper: BackgroundSweeper,
}

impl FileService {
    /// Creates the service and starts sweeping its cache.
    ///
    /// This must be called from within a `tokio` runtime.
    pub fn create(config: &Config) -> anyhow::Result<Self> {
        let layout = Arc::new(FileLayout::from_config(config));
        let caches = &config.caches;

        let (cache, sweeper) = if layout.has_remote() {
            let origin =
                HttpOrigin::new(config.timeouts()).context("failed to create HTTP client")?;
            let versions = match &caches.versions_file {
                Some(path) => VersionStore::load(path),
                None => VersionStore::in_memory(),
            };
            let resolver = BackendResolver::new(
                origin,
                Arc::new(MemoryBlockStore::new(&caches.blocks)),
                Arc::new(versions),
                caches.blocks.block_size,
            );
            let cache = ResolutionCache::new(resolver, caches.hybrid);
            let sweeper = BackgroundSweeper::spawn(
                cache.clone(),
                caches.hybrid.sweep_interval,
                caches.hybrid.log_stats_every,
            );
            (FileCache::Hybrid(cache), sweeper)
        } else {
            let cache = LocalFileCache::new(caches.local);
            let sweeper = BackgroundSweeper::spawn(
                cache.clone(),
                caches.local.sweep_interval,
                caches.local.log_stats_every,
            );
            (FileCache::Local(cache), sweeper)
        };

        tracing::info!(
            data_dir = %layout.data_dir().display(),
            remote = layout.has_remote(),
            "Serving array files"
        );

        Ok(Self {
            layout,
            cache,
            _sweeper: sweeper,
        })
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Creates the key for a request path, or `None` if the path is not acceptable.
    pub fn key(&self, path: &str) -> Option<DataFileKey> {
        DataFileKey::new(&self.layout, path)
    }

    /// Returns the size of the file, or `None` if it does not exist.
    pub async fn stat(&self, key: &DataFileKey) -> CacheContents<Option<u64>> {
        match &self.cache {
            FileCache::Local(cache) => Ok(cache.get(key).map(|file| file.len())),
            FileCache::Hybrid(cache) => Ok(cache.get(key, false).await?.map(|b| b.len())),
        }
    }

    /// Reads `range` of the file.
    pub async fn read(&self, key: &DataFileKey, range: ByteRange) -> CacheContents<ReadOutcome> {
        let outcome = match &self.cache {
            FileCache::Local(cache) => match cache.get(key) {
                Some(file) => Some(read_backend(Backend::Local(file), range).await?),
                None => None,
            },
            FileCache::Hybrid(cache) => {
                cache
                    .with(key, move |backend| read_backend(backend, range))
                    .await?
            }
        };

        Ok(outcome.unwrap_or(ReadOutcome::Missing))
    }
}
