//! Array files and the keys that name them.
//!
//! A [`FileKey`] names a logical file, which may exist on local storage, on a remote origin, or
//! nowhere at all. Resolving a key yields a [`Backend`], the uniform reader over either location.

use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use url::Url;

use crate::caching::{CacheContents, CacheError};

mod key;
mod local;
mod remote;

pub use key::{DataFileKey, FileLayout};
pub use local::{FileIdentity, LocalFile};
pub use remote::RemoteFile;

/// Number of leading bytes handed to [`FileKey::check_header`].
pub const HEADER_LEN: u64 = 64;

/// Identifies a logical file.
///
/// Implementations decide where the file lives locally, where it can be fetched from, and how
/// long a remote verdict about it may be trusted.
pub trait FileKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Where the file is expected on local storage.
    fn local_path(&self) -> PathBuf;

    /// Where the file can be fetched from, if anywhere.
    fn remote_url(&self) -> Option<Url>;

    /// How long a remote verdict about this file stays valid.
    ///
    /// `last_modified` is `None` when the file is missing, or when the origin does not report a
    /// modification time.
    fn revalidate_every(&self, last_modified: Option<SystemTime>, now: SystemTime) -> Duration;

    /// Validates the first [`HEADER_LEN`] bytes (or fewer, for short files) of the file.
    fn check_header(&self, header: &[u8]) -> CacheContents {
        check_array_header(header)
    }
}

/// Checks for the `OM` magic followed by a supported format version.
pub fn check_array_header(header: &[u8]) -> CacheContents {
    match header {
        [b'O', b'M', 1..=3, ..] => Ok(()),
        [b'O', b'M', version, ..] => Err(CacheError::NotAValidFile(format!(
            "unsupported format version {version}"
        ))),
        _ if header.len() < 3 => Err(CacheError::NotAValidFile("file too short".into())),
        _ => Err(CacheError::NotAValidFile("missing header magic".into())),
    }
}

/// The reader a key resolved to.
#[derive(Clone, Debug)]
pub enum Backend {
    /// A memory-mapped file on local storage.
    Local(Arc<LocalFile>),
    /// A file on the remote origin, read through the block cache.
    Remote(Arc<RemoteFile>),
}

impl Backend {
    /// The size of the file in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Local(file) => file.len(),
            Self::Remote(file) => file.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `count` bytes starting at `offset`.
    ///
    /// The result is truncated at the end of the file. Remote reads fail with
    /// [`CacheError::ModifiedDuringRead`] if the remote file was replaced.
    pub async fn read(&self, offset: u64, count: u64) -> CacheContents<Bytes> {
        match self {
            Self::Local(file) => Ok(file.read(offset, count)),
            Self::Remote(file) => file.read(offset, count).await,
        }
    }

    /// Whether both values refer to the very same opened file.
    pub fn same_as(&self, other: &Backend) -> bool {
        match (self, other) {
            (Self::Local(a), Self::Local(b)) => Arc::ptr_eq(a, b),
            (Self::Remote(a), Self::Remote(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Clamps `offset..offset + count` to a file of `len` bytes.
pub(crate) fn clamp_range(offset: u64, count: u64, len: u64) -> std::ops::Range<u64> {
    let start = offset.min(len);
    let end = offset.saturating_add(count).min(len);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_header() {
        assert_eq!(check_array_header(b"OM\x03\x00\x00"), Ok(()));
        assert_eq!(check_array_header(b"OM\x01"), Ok(()));
        assert!(matches!(
            check_array_header(b"OM\x07"),
            Err(CacheError::NotAValidFile(_))
        ));
        assert!(matches!(
            check_array_header(b"OM"),
            Err(CacheError::NotAValidFile(_))
        ));
        assert!(matches!(
            check_array_header(b"<html>not found</html>"),
            Err(CacheError::NotAValidFile(_))
        ));
    }

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(0, 10, 100), 0..10);
        assert_eq!(clamp_range(95, 10, 100), 95..100);
        assert_eq!(clamp_range(150, 10, 100), 100..100);
        assert_eq!(clamp_range(10, u64::MAX, 100), 10..100);
    }
}
