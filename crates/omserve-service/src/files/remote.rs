use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use url::Url;

use crate::blocks::{BlockId, BlockStore, FileId};
use crate::caching::{CacheContents, RemoteVersion};
use crate::http::HttpOrigin;

use super::clamp_range;

/// One version of a file on the remote origin.
///
/// Contents are fetched block by block and kept in the shared [`BlockStore`]. All requests are
/// conditional on the version, so a `RemoteFile` never returns data of a different version.
pub struct RemoteFile {
    url: Url,
    version: RemoteVersion,
    file_id: FileId,
    last_validated: SystemTime,
    origin: HttpOrigin,
    blocks: Arc<dyn BlockStore>,
    block_size: u64,
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("url", &self.url.as_str())
            .field("version", &self.version)
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl RemoteFile {
    pub fn new(
        url: Url,
        version: RemoteVersion,
        last_validated: SystemTime,
        origin: HttpOrigin,
        blocks: Arc<dyn BlockStore>,
        block_size: u64,
    ) -> Self {
        let file_id = FileId::new(&url, &version);
        Self {
            url,
            version,
            file_id,
            last_validated,
            origin,
            blocks,
            block_size: block_size.max(1),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn version(&self) -> &RemoteVersion {
        &self.version
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// When the origin last confirmed this version.
    pub fn last_validated(&self) -> SystemTime {
        self.last_validated
    }

    pub fn len(&self) -> u64 {
        self.version.size
    }

    pub fn is_empty(&self) -> bool {
        self.version.size == 0
    }

    /// Reads up to `count` bytes starting at `offset`, truncated at the end of the file.
    pub async fn read(&self, offset: u64, count: u64) -> CacheContents<Bytes> {
        let range = clamp_range(offset, count, self.len());
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let first = range.start / self.block_size;
        let last = (range.end - 1) / self.block_size;
        let blocks = try_join_all((first..=last).map(|index| self.block(index))).await?;

        let start = (range.start - first * self.block_size) as usize;
        let len = (range.end - range.start) as usize;
        if let [block] = blocks.as_slice() {
            return Ok(block.slice(start..start + len));
        }

        let mut joined = BytesMut::with_capacity(blocks.iter().map(Bytes::len).sum());
        for block in &blocks {
            joined.extend_from_slice(block);
        }
        Ok(joined.freeze().slice(start..start + len))
    }

    fn block_range(&self, index: u64) -> Range<u64> {
        let start = index * self.block_size;
        start..(start + self.block_size).min(self.len())
    }

    async fn block(&self, index: u64) -> CacheContents<Bytes> {
        let id = BlockId::new(self.file_id, index);
        if let Some(data) = self.blocks.get(&id) {
            metric!(counter("blocks.hit") += 1);
            return Ok(data);
        }
        metric!(counter("blocks.miss") += 1);

        let data = self
            .origin
            .get_range(&self.url, &self.version, self.block_range(index))
            .await?;
        self.blocks.insert(id, data.clone());
        Ok(data)
    }

    /// Removes the cached blocks of this file that were not accessed within `older_than`.
    pub fn delete_cached_blocks(&self, older_than: Duration) -> usize {
        self.blocks.delete_blocks(self.file_id, older_than)
    }

    /// Lists the cached blocks of this file that were accessed within `max_age`.
    pub fn active_blocks(&self, max_age: Duration) -> Vec<BlockId> {
        self.blocks.active_blocks(self.file_id, max_age)
    }

    /// Fetches the blocks at the same positions as `blocks` into the cache.
    ///
    /// `blocks` typically come from a previous version of this file. Blocks that are already
    /// cached, or lie beyond the end of this file, are skipped. Returns the number of blocks
    /// that were fetched.
    pub async fn preload(&self, blocks: &[BlockId]) -> CacheContents<usize> {
        let block_count = self.len().div_ceil(self.block_size);
        let missing: Vec<_> = blocks
            .iter()
            .map(|block| block.index)
            .filter(|&index| index < block_count)
            .filter(|&index| self.blocks.get(&BlockId::new(self.file_id, index)).is_none())
            .collect();

        try_join_all(missing.iter().map(|&index| self.block(index))).await?;
        Ok(missing.len())
    }
}
