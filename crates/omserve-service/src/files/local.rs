use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use symbolic_common::ByteView;

use crate::caching::{CacheContents, CacheError};

use super::{HEADER_LEN, clamp_range};

/// What identifies the file that was opened, as opposed to whatever is at the path now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileIdentity {
    len: u64,
    modified: Option<SystemTime>,
    #[cfg(unix)]
    inode: u64,
}

impl FileIdentity {
    fn from_metadata(metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            #[cfg(unix)]
            inode: metadata.ino(),
        }
    }

    /// The identity of whatever is at `path` now, or `None` if there is nothing.
    pub fn of(path: &Path) -> Option<Self> {
        fs::metadata(path)
            .ok()
            .map(|metadata| Self::from_metadata(&metadata))
    }
}

/// A memory-mapped array file on local storage.
pub struct LocalFile {
    path: PathBuf,
    data: ByteView<'static>,
    identity: FileIdentity,
}

impl fmt::Debug for LocalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFile")
            .field("path", &self.path)
            .field("len", &self.data.len())
            .finish()
    }
}

impl LocalFile {
    /// Maps the file at `path` and validates its header with `check_header`.
    ///
    /// Returns [`CacheError::NotFound`] if there is no file at `path`.
    pub fn open<F>(path: &Path, check_header: F) -> CacheContents<Self>
    where
        F: FnOnce(&[u8]) -> CacheContents,
    {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(CacheError::NotAValidFile("not a regular file".into()));
        }

        let data = match ByteView::open(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(e.into()),
        };

        let header_len = data.len().min(HEADER_LEN as usize);
        check_header(&data[..header_len])?;

        tracing::trace!("Opened local file {}", path.display());

        Ok(Self {
            path: path.to_owned(),
            data,
            identity: FileIdentity::from_metadata(&metadata),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads up to `count` bytes starting at `offset`, truncated at the end of the file.
    pub fn read(&self, offset: u64, count: u64) -> Bytes {
        let range = clamp_range(offset, count, self.len());
        Bytes::copy_from_slice(&self.data[range.start as usize..range.end as usize])
    }

    /// Whether the file was deleted, or replaced by a different file, since it was opened.
    pub fn was_modified(&self) -> bool {
        FileIdentity::of(&self.path).as_ref() != Some(&self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::files::check_array_header;

    #[test]
    fn test_open_and_read() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("a.om");
        fs::write(&path, b"OM\x03hello world").unwrap();

        let file = LocalFile::open(&path, check_array_header).unwrap();
        assert_eq!(file.len(), 14);
        assert_eq!(&file.read(3, 5)[..], b"hello");
        assert_eq!(&file.read(9, 100)[..], b"world");
        assert!(file.read(100, 5).is_empty());
        assert!(!file.was_modified());
    }

    #[test]
    fn test_open_missing() {
        let dir = omserve_test::tempdir();
        let result = LocalFile::open(&dir.path().join("nope.om"), check_array_header);
        assert_eq!(result.unwrap_err(), CacheError::NotFound);
    }

    #[test]
    fn test_open_invalid() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("broken.om");
        fs::write(&path, b"garbage").unwrap();

        let result = LocalFile::open(&path, check_array_header);
        assert!(matches!(result, Err(CacheError::NotAValidFile(_))));

        let result = LocalFile::open(dir.path(), check_array_header);
        assert!(matches!(result, Err(CacheError::NotAValidFile(_))));
    }

    #[test]
    fn test_detects_deletion_and_replacement() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("a.om");
        fs::write(&path, b"OM\x03first").unwrap();

        let file = LocalFile::open(&path, check_array_header).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(file.was_modified());

        // replaced atomically, the way downloaders swap in new files
        let tmp = dir.path().join("a.om~");
        fs::write(&tmp, b"OM\x03second version").unwrap();
        fs::rename(&tmp, &path).unwrap();
        assert!(file.was_modified());
        // the open mapping still serves the old contents
        assert_eq!(&file.read(3, 5)[..], b"first");
    }
}
