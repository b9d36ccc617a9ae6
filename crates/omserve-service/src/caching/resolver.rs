use std::sync::Arc;
use std::time::{Duration, SystemTime};

use url::Url;

use crate::blocks::BlockStore;
use crate::files::{Backend, FileIdentity, FileKey, HEADER_LEN, LocalFile, RemoteFile};
use crate::http::HttpOrigin;

use super::{CacheContents, CacheError, RemoteVersion, VersionState, VersionStore};

/// The outcome of revalidating a remote file with the origin.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// The origin still has the same version.
    Unchanged,
    /// The origin has a different version of the file.
    Replaced(Arc<RemoteFile>),
    /// The file was deleted, or is no longer a valid file.
    Deleted,
}

/// What a key resolved to.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub backend: Option<Backend>,
    /// The local file that exists at the key's path, but is not a valid file.
    ///
    /// Captured before the file was opened, so it never matches a later replacement.
    pub rejected: Option<FileIdentity>,
}

impl Resolved {
    pub(super) fn backend(backend: Option<Backend>) -> Self {
        Self {
            backend,
            rejected: None,
        }
    }
}

/// Whether a verdict from `last_validated` can still be trusted at `now`.
///
/// Timestamps in the future count as fresh.
pub(crate) fn is_fresh(last_validated: SystemTime, budget: Duration, now: SystemTime) -> bool {
    now.duration_since(last_validated)
        .map_or(true, |age| age < budget)
}

/// Turns keys into [`Backend`]s.
///
/// Local files always take precedence. Remote files are looked up at the origin, unless the
/// [`VersionStore`] has a recent enough verdict about them.
#[derive(Debug, Clone)]
pub struct BackendResolver {
    origin: HttpOrigin,
    blocks: Arc<dyn BlockStore>,
    versions: Arc<VersionStore>,
    block_size: u64,
}

impl BackendResolver {
    pub fn new(
        origin: HttpOrigin,
        blocks: Arc<dyn BlockStore>,
        versions: Arc<VersionStore>,
        block_size: u64,
    ) -> Self {
        Self {
            origin,
            blocks,
            versions,
            block_size,
        }
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    /// Resolves `key` to a backend, or `None` if the file exists nowhere.
    ///
    /// With `force_new`, remote verdicts from the version store are ignored and the origin is
    /// always asked. Only transport failures are errors, invalid files resolve to `None`.
    pub async fn resolve<K: FileKey>(&self, key: &K, force_new: bool) -> CacheContents<Resolved> {
        let path = key.local_path();
        let identity = FileIdentity::of(&path);
        match LocalFile::open(&path, |header| key.check_header(header)) {
            Ok(file) => {
                tracing::debug!("Resolved {:?} to local file", key);
                return Ok(Resolved::backend(Some(Backend::Local(Arc::new(file)))));
            }
            Err(CacheError::NotFound) => {}
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to open local file {}",
                    path.display()
                );
                return Ok(Resolved {
                    backend: None,
                    rejected: identity,
                });
            }
        }

        let Some(url) = key.remote_url() else {
            return Ok(Resolved::backend(None));
        };

        let now = SystemTime::now();
        if !force_new {
            match self.versions.get(&url) {
                Some(VersionState::Missing { last_validated })
                    if is_fresh(last_validated, key.revalidate_every(None, now), now) =>
                {
                    metric!(counter("resolver.versions.hit") += 1, "state" => "missing");
                    return Ok(Resolved::backend(None));
                }
                Some(VersionState::Available {
                    last_validated,
                    version,
                }) if is_fresh(
                    last_validated,
                    key.revalidate_every(version.last_modified, now),
                    now,
                ) =>
                {
                    metric!(counter("resolver.versions.hit") += 1, "state" => "available");
                    let file = self.remote_file(url, version, last_validated);
                    return Ok(Resolved::backend(Some(Backend::Remote(file))));
                }
                _ => {}
            }
        }

        let file = self.check_exists(key, &url).await?;
        tracing::debug!("Resolved {:?} to remote file: {}", key, file.is_some());
        Ok(Resolved::backend(file.map(Backend::Remote)))
    }

    /// Asks the origin whether it has a valid file at `url`, and records the answer.
    pub async fn check_exists<K: FileKey>(
        &self,
        key: &K,
        url: &Url,
    ) -> CacheContents<Option<Arc<RemoteFile>>> {
        let now = SystemTime::now();
        match self.origin.head(url).await? {
            Some(version) => self.open_remote(key, url, version, now).await,
            None => {
                self.versions.update(
                    url,
                    VersionState::Missing {
                        last_validated: now,
                    },
                );
                Ok(None)
            }
        }
    }

    /// Checks whether the origin still has the version of `current`.
    pub async fn revalidate<K: FileKey>(
        &self,
        key: &K,
        url: &Url,
        current: &RemoteFile,
    ) -> CacheContents<Revalidation> {
        let now = SystemTime::now();
        let Some(version) = self.origin.head(url).await? else {
            self.versions.update(
                url,
                VersionState::Missing {
                    last_validated: now,
                },
            );
            return Ok(Revalidation::Deleted);
        };

        if &version == current.version() {
            self.versions.update(
                url,
                VersionState::Available {
                    last_validated: now,
                    version,
                },
            );
            return Ok(Revalidation::Unchanged);
        }

        tracing::debug!(
            "Remote file {:?} changed from {:?} to {:?}",
            key,
            current.version(),
            version
        );
        match self.open_remote(key, url, version, now).await? {
            Some(file) => Ok(Revalidation::Replaced(file)),
            None => Ok(Revalidation::Deleted),
        }
    }

    /// Validates the header of a remote file with a known version.
    async fn open_remote<K: FileKey>(
        &self,
        key: &K,
        url: &Url,
        version: RemoteVersion,
        now: SystemTime,
    ) -> CacheContents<Option<Arc<RemoteFile>>> {
        let file = self.remote_file(url.clone(), version.clone(), now);
        let header = file.read(0, HEADER_LEN).await?;

        match key.check_header(&header) {
            Ok(()) => {
                self.versions.update(
                    url,
                    VersionState::Available {
                        last_validated: now,
                        version,
                    },
                );
                Ok(Some(file))
            }
            Err(err) if err.is_absence() => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Invalid remote file `{}`",
                    url
                );
                self.versions.update(
                    url,
                    VersionState::Missing {
                        last_validated: now,
                    },
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn remote_file(
        &self,
        url: Url,
        version: RemoteVersion,
        last_validated: SystemTime,
    ) -> Arc<RemoteFile> {
        Arc::new(RemoteFile::new(
            url,
            version,
            last_validated,
            self.origin.clone(),
            Arc::clone(&self.blocks),
            self.block_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fresh() {
        let now = SystemTime::now();
        let budget = Duration::from_secs(10);
        assert!(is_fresh(now - Duration::from_secs(5), budget, now));
        assert!(!is_fresh(now - Duration::from_secs(10), budget, now));
        assert!(!is_fresh(now - Duration::from_secs(60), budget, now));
        assert!(is_fresh(now + Duration::from_secs(60), budget, now));
    }
}
