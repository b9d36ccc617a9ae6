use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::{Config, RevalidationConfig};

use super::{FileKey, check_array_header};

/// Where data files live, and how fresh remote verdicts about them need to be.
#[derive(Debug)]
pub struct FileLayout {
    data_dir: PathBuf,
    remote_url: Option<Url>,
    revalidation: RevalidationConfig,
}

impl FileLayout {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        remote_url: Option<Url>,
        revalidation: RevalidationConfig,
    ) -> Self {
        // keys are appended below the base path
        let remote_url = remote_url.map(|mut url| {
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            url
        });
        Self {
            data_dir: data_dir.into(),
            remote_url,
            revalidation,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.remote_url.clone(),
            config.revalidation,
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn has_remote(&self) -> bool {
        self.remote_url.is_some()
    }
}

/// A file below the data directory, addressed by its relative path.
///
/// Two keys are equal if their paths are equal, the layout is not compared.
#[derive(Clone, Debug)]
pub struct DataFileKey {
    layout: Arc<FileLayout>,
    path: Arc<str>,
}

impl DataFileKey {
    /// Creates a key for `path`, relative to the layout's data directory.
    ///
    /// Returns `None` for empty paths, absolute paths, and paths that contain `.` or `..`
    /// components. Segments must not contain characters that carry meaning in URLs, such as
    /// schemes, queries, fragments and percent escapes.
    pub fn new(layout: &Arc<FileLayout>, path: &str) -> Option<Self> {
        let valid = !path.is_empty()
            && path.split('/').all(|segment| {
                !matches!(segment, "" | "." | "..")
                    && !segment.contains(['\\', ':', '?', '#', '%'])
            });
        valid.then(|| Self {
            layout: Arc::clone(layout),
            path: path.into(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Metadata files are small JSON documents that are rewritten with every model run.
    pub fn is_metadata(&self) -> bool {
        self.path.ends_with(".json")
    }
}

impl PartialEq for DataFileKey {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for DataFileKey {}

impl Hash for DataFileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl FileKey for DataFileKey {
    fn local_path(&self) -> PathBuf {
        self.layout.data_dir.join(&*self.path)
    }

    fn remote_url(&self) -> Option<Url> {
        let base = self.layout.remote_url.as_ref()?;
        let mut url = base.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(self.path.split('/'));
        let below_base = url.origin() == base.origin() && url.path().starts_with(base.path());
        below_base.then_some(url)
    }

    fn revalidate_every(&self, last_modified: Option<SystemTime>, now: SystemTime) -> Duration {
        let policy = &self.layout.revalidation;
        if self.is_metadata() {
            return policy.metadata;
        }
        match last_modified {
            Some(modified) => match now.duration_since(modified) {
                Ok(age) if age >= policy.archive_after => policy.archive,
                _ => policy.recent,
            },
            None => policy.recent,
        }
    }

    fn check_header(&self, header: &[u8]) -> CacheContents {
        if !self.is_metadata() {
            return check_array_header(header);
        }
        match header.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{' | b'[') => Ok(()),
            _ => Err(CacheError::NotAValidFile("not a JSON document".into())),
        }
    }
}
