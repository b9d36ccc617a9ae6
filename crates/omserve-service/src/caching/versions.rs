use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use url::Url;

use super::CacheContents;

/// A version of a remote file, as reported by the origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVersion {
    /// The size of the file in bytes.
    pub size: u64,
    #[serde(default, with = "humantime_serde")]
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}

/// The last known state of a remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum VersionState {
    /// The origin reported the file as missing, or it was not a valid file.
    Missing {
        #[serde(with = "humantime_serde")]
        last_validated: SystemTime,
    },
    /// The origin has the file at `version`.
    Available {
        #[serde(with = "humantime_serde")]
        last_validated: SystemTime,
        version: RemoteVersion,
    },
}

impl VersionState {
    /// When the origin was last asked about the file.
    pub fn last_validated(&self) -> SystemTime {
        match self {
            Self::Missing { last_validated } | Self::Available { last_validated, .. } => {
                *last_validated
            }
        }
    }
}

/// The versions of remote files that were validated recently.
///
/// This allows resolving remote files without asking the origin again, as long as the
/// verdict is recent enough. The store can optionally be persisted to survive restarts.
#[derive(Debug)]
pub struct VersionStore {
    path: Option<PathBuf>,
    states: Mutex<HashMap<String, VersionState>>,
    dirty: AtomicBool,
}

impl VersionStore {
    /// Creates a store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            states: Mutex::default(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Loads the store persisted at `path`, which it will also be persisted to.
    ///
    /// A missing or unreadable file results in an empty store.
    pub fn load(path: &Path) -> Self {
        let states = match fs::read(path) {
            Ok(contents) => match serde_json::from_slice::<HashMap<String, VersionState>>(&contents)
            {
                Ok(states) => {
                    tracing::info!(
                        "Loaded {} remote file versions from {}",
                        states.len(),
                        path.display()
                    );
                    states
                }
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Discarding corrupt version file {}",
                        path.display()
                    );
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to read version file {}",
                    path.display()
                );
                HashMap::new()
            }
        };

        Self {
            path: Some(path.to_owned()),
            states: Mutex::new(states),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn get(&self, url: &Url) -> Option<VersionState> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(url.as_str()).cloned()
    }

    /// Records `state` for `url`, unless a more recent verdict is already known.
    pub fn update(&self, url: &Url, state: VersionState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = states.get(url.as_str()) {
            if existing.last_validated() > state.last_validated() {
                return;
            }
        }
        states.insert(url.as_str().to_owned(), state);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Forgets all verdicts that were last validated more than `older_than` ago.
    ///
    /// Returns the number of forgotten verdicts.
    pub fn prune(&self, older_than: Duration) -> usize {
        let now = SystemTime::now();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let before = states.len();
        states.retain(|_, state| {
            now.duration_since(state.last_validated())
                .map_or(true, |age| age < older_than)
        });
        let pruned = before - states.len();
        if pruned > 0 {
            self.dirty.store(true, Ordering::Relaxed);
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the store to its file, if it has one and anything changed.
    ///
    /// The file is replaced atomically, so readers never observe a partial write.
    pub fn persist(&self) -> CacheContents {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let serialized = {
            let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let sorted: BTreeMap<_, _> = states.iter().collect();
            serde_json::to_vec(&sorted)
        };
        let result: CacheContents = serialized.map_err(Into::into).and_then(|contents| {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let mut file = NamedTempFile::new_in(dir)?;
            file.write_all(&contents)?;
            file.persist(path).map_err(|e| e.error)?;
            Ok(())
        });

        if result.is_err() {
            // try again with the next sweep
            self.dirty.store(true, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://example.com/a.om").unwrap()
    }

    fn available(last_validated: SystemTime, size: u64) -> VersionState {
        VersionState::Available {
            last_validated,
            version: RemoteVersion {
                size,
                last_modified: None,
                etag: Some("\"v1\"".into()),
            },
        }
    }

    #[test]
    fn test_update_is_monotonic() {
        let store = VersionStore::in_memory();
        let now = SystemTime::now();

        store.update(&url(), available(now, 10));
        store.update(
            &url(),
            VersionState::Missing {
                last_validated: now - Duration::from_secs(10),
            },
        );
        assert_eq!(store.get(&url()), Some(available(now, 10)));

        let later = now + Duration::from_secs(1);
        store.update(&url(), VersionState::Missing { last_validated: later });
        assert_eq!(
            store.get(&url()),
            Some(VersionState::Missing { last_validated: later })
        );
    }

    #[test]
    fn test_persist_and_load() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("versions.json");
        let validated = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let store = VersionStore::load(&path);
        assert!(store.is_empty());
        store.update(&url(), available(validated, 42));
        store.update(
            &Url::parse("https://example.com/b.om").unwrap(),
            VersionState::Missing {
                last_validated: validated,
            },
        );
        store.persist().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(contents, @r#"{"https://example.com/a.om":{"state":"available","last_validated":"2023-11-14T22:13:20Z","version":{"size":42,"last_modified":null,"etag":"\"v1\""}},"https://example.com/b.om":{"state":"missing","last_validated":"2023-11-14T22:13:20Z"}}"#);

        let loaded = VersionStore::load(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&url()), Some(available(validated, 42)));
    }

    #[test]
    fn test_persist_only_when_dirty() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("versions.json");

        let store = VersionStore::load(&path);
        store.persist().unwrap();
        assert!(!path.exists());

        store.update(&url(), available(SystemTime::now(), 1));
        store.persist().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_corrupt() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("versions.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = VersionStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_prune() {
        let dir = omserve_test::tempdir();
        let path = dir.path().join("versions.json");
        let now = SystemTime::now();
        let old = Url::parse("https://example.com/old.om").unwrap();

        let store = VersionStore::load(&path);
        store.update(&url(), available(now, 1));
        store.update(
            &old,
            VersionState::Missing {
                last_validated: now - Duration::from_secs(7200),
            },
        );
        store.persist().unwrap();

        assert_eq!(store.prune(Duration::from_secs(3600)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&old), None);
        assert_eq!(store.prune(Duration::from_secs(3600)), 0);

        // the pruned store is written out again
        store.persist().unwrap();
        assert_eq!(VersionStore::load(&path).len(), 1);
    }

    #[test]
    fn test_in_memory_never_persists() {
        let store = VersionStore::in_memory();
        store.update(&url(), available(SystemTime::now(), 1));
        assert_eq!(store.persist(), Ok(()));
    }
}
