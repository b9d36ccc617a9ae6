use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

use sentry::{Hub, SentryFutureExt};
use tokio::sync::oneshot;

use crate::config::HybridCacheConfig;
use crate::files::{Backend, FileIdentity, FileKey, RemoteFile};

use super::resolver::{BackendResolver, Resolved, Revalidation, is_fresh};
use super::{CacheContents, CacheError, Sweep, SweepStats};

type ResolutionResult = CacheContents<Option<Backend>>;

#[derive(Debug)]
struct Entry {
    value: Option<Backend>,
    /// The invalid local file that made this entry resolve to `None`.
    rejected: Option<FileIdentity>,
    /// When the value was last confirmed, locally or remotely.
    last_validated: SystemTime,
    last_accessed: Instant,
    /// Distinguishes this entry from a later one for the same key.
    generation: u64,
}

#[derive(Debug)]
enum CacheState {
    Cached(Entry),
    Resolving(Vec<oneshot::Sender<ResolutionResult>>),
}

#[derive(Debug)]
struct Inner<K> {
    states: Mutex<HashMap<K, CacheState>>,
    resolver: BackendResolver,
    config: HybridCacheConfig,
    generations: AtomicU64,
}

impl<K: FileKey> Inner<K> {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs the result of a resolution and hands it to every waiter.
    fn complete(&self, key: &K, resolved: CacheContents<Resolved>) {
        let waiters = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = match &resolved {
                Ok(resolved) => {
                    let entry = Entry {
                        last_validated: validated_at(resolved.backend.as_ref()),
                        value: resolved.backend.clone(),
                        rejected: resolved.rejected.clone(),
                        last_accessed: Instant::now(),
                        generation: self.next_generation(),
                    };
                    states.insert(key.clone(), CacheState::Cached(entry))
                }
                Err(_) => states.remove(key),
            };
            match previous {
                Some(CacheState::Resolving(waiters)) => waiters,
                _ => Vec::new(),
            }
        };

        let result: ResolutionResult = resolved.map(|resolved| resolved.backend);

        if let Err(err) = &result {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                "Failed to resolve {:?}",
                key
            );
        }
        for waiter in waiters {
            waiter.send(result.clone()).ok();
        }
    }
}

fn validated_at(value: Option<&Backend>) -> SystemTime {
    match value {
        Some(Backend::Remote(file)) => file.last_validated(),
        _ => SystemTime::now(),
    }
}

/// Clears the `Resolving` state of a key if its resolution task ends without completing.
///
/// Dropping the waiters wakes them up with an error.
struct ResolutionGuard<K: FileKey> {
    inner: Arc<Inner<K>>,
    key: Option<K>,
}

impl<K: FileKey> ResolutionGuard<K> {
    fn complete(mut self, resolved: CacheContents<Resolved>) {
        if let Some(key) = self.key.take() {
            self.inner.complete(&key, resolved);
        }
    }
}

impl<K: FileKey> Drop for ResolutionGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            tracing::error!("Resolution of {:?} ended unexpectedly", key);
            let mut states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(CacheState::Resolving(_)) = states.get(&key) {
                states.remove(&key);
            }
        }
    }
}

/// What the sweep decided for a single entry.
enum Outcome {
    Keep,
    Evict,
    Validated(SystemTime),
    Replace(Option<Backend>, SystemTime),
}

/// Caches which backend a key resolved to, for files that are local or remote.
///
/// Concurrent lookups of the same key are coalesced into a single resolution. Entries are
/// validated against local storage and the origin by [`sweep`](Sweep::sweep), which also
/// evicts entries that were not used for a while.
#[derive(Debug)]
pub struct ResolutionCache<K: FileKey> {
    inner: Arc<Inner<K>>,
}

impl<K: FileKey> Clone for ResolutionCache<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: FileKey> ResolutionCache<K> {
    pub fn new(resolver: BackendResolver, config: HybridCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                states: Mutex::default(),
                resolver,
                config,
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn resolver(&self) -> &BackendResolver {
        &self.inner.resolver
    }

    /// Returns the backend of `key`, resolving it if it is not cached yet.
    ///
    /// With `force_new`, a cached value is ignored and the key is resolved again, bypassing any
    /// remote verdicts. If the key is being resolved already, this waits for that resolution
    /// instead of starting another one.
    pub async fn get(&self, key: &K, force_new: bool) -> CacheContents<Option<Backend>> {
        let receiver = {
            let mut states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
            match states.get_mut(key) {
                Some(CacheState::Cached(entry)) if !force_new => {
                    metric!(counter("caches.hybrid.hit") += 1);
                    entry.last_accessed = Instant::now();
                    return Ok(entry.value.clone());
                }
                Some(CacheState::Resolving(waiters)) => {
                    metric!(counter("caches.hybrid.channel.hit") += 1);
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
                _ => {
                    metric!(counter("caches.hybrid.miss") += 1);
                    let (sender, receiver) = oneshot::channel();
                    states.insert(key.clone(), CacheState::Resolving(vec![sender]));
                    self.spawn_resolution(key.clone(), force_new);
                    receiver
                }
            }
        };

        receiver.await.unwrap_or(Err(CacheError::InternalError))
    }

    /// Resolves `key` in a separate task, so that it completes even if the caller goes away.
    fn spawn_resolution(&self, key: K, force_new: bool) {
        let guard = ResolutionGuard {
            inner: Arc::clone(&self.inner),
            key: Some(key.clone()),
        };
        let resolver = self.inner.resolver.clone();

        let resolution = async move {
            let result = resolver.resolve(&key, force_new).await;
            guard.complete(result);
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(resolution);
    }

    /// Runs `operation` on the backend of `key`.
    ///
    /// If the remote file was replaced while `operation` read from it, the key is resolved again
    /// and `operation` retried once. Returns `None` if the file exists nowhere.
    pub async fn with<F, Fut, T>(&self, key: &K, mut operation: F) -> CacheContents<Option<T>>
    where
        F: FnMut(Backend) -> Fut,
        Fut: Future<Output = CacheContents<T>>,
    {
        let Some(backend) = self.get(key, false).await? else {
            return Ok(None);
        };
        match operation(backend).await {
            Err(CacheError::ModifiedDuringRead) => {
                tracing::debug!("{:?} was modified during read, resolving again", key);
                metric!(counter("caches.hybrid.retry") += 1);
                let Some(backend) = self.get(key, true).await? else {
                    return Ok(None);
                };
                operation(backend).await.map(Some)
            }
            result => result.map(Some),
        }
    }

    /// Revalidates all cached entries, and evicts the ones that are no longer used.
    pub async fn revalidate(&self) -> SweepStats {
        let mut stats = SweepStats {
            ticks: 1,
            ..Default::default()
        };

        let candidates: Vec<_> = {
            let mut states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
            let max_unused_for = self.inner.config.max_unused_for;
            states.retain(|_, state| match state {
                CacheState::Cached(entry) if entry.last_accessed.elapsed() >= max_unused_for => {
                    stats.evicted_inactive += 1;
                    false
                }
                CacheState::Cached(_) => true,
                CacheState::Resolving(_) => {
                    stats.resolving += 1;
                    true
                }
            });
            states
                .iter()
                .filter_map(|(key, state)| match state {
                    CacheState::Cached(entry) => Some((
                        key.clone(),
                        entry.value.clone(),
                        entry.rejected.clone(),
                        entry.last_validated,
                        entry.generation,
                    )),
                    CacheState::Resolving(_) => None,
                })
                .collect()
        };

        for (key, value, rejected, last_validated, generation) in candidates {
            let outcome = self
                .check_entry(
                    &key,
                    value.as_ref(),
                    rejected.as_ref(),
                    last_validated,
                    &mut stats,
                )
                .await;
            self.apply(&key, generation, outcome);
        }

        {
            let states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
            stats.entries = states
                .values()
                .filter(|state| matches!(state, CacheState::Cached(_)))
                .count() as u64;
        }

        self.persist_versions().await;

        stats
    }

    /// Forgets outdated remote verdicts, and writes the rest to disk without blocking the sweep.
    async fn persist_versions(&self) {
        let versions = Arc::clone(self.inner.resolver.versions());
        let pruned = versions.prune(self.inner.config.forget_versions_after);
        if pruned > 0 {
            tracing::debug!("Forgot {} outdated remote file versions", pruned);
        }

        match tokio::task::spawn_blocking(move || versions.persist()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to persist remote file versions"
            ),
            Err(err) => tracing::error!(
                error = &err as &dyn std::error::Error,
                "Persisting remote file versions panicked"
            ),
        }
    }

    async fn check_entry(
        &self,
        key: &K,
        value: Option<&Backend>,
        rejected: Option<&FileIdentity>,
        last_validated: SystemTime,
        stats: &mut SweepStats,
    ) -> Outcome {
        match value {
            Some(Backend::Local(file)) => {
                if file.was_modified() {
                    tracing::debug!("Local file of {:?} was modified", key);
                    stats.local_modified += 1;
                    return Outcome::Evict;
                }
                Outcome::Keep
            }
            Some(Backend::Remote(file)) => self.check_remote(key, file, last_validated, stats).await,
            None => {
                // an invalid local file is only retried once it changes
                let current = FileIdentity::of(&key.local_path());
                if current.as_ref() != rejected {
                    tracing::debug!("Local file of {:?} changed", key);
                    stats.local_modified += 1;
                    return Outcome::Evict;
                }
                if rejected.is_some() {
                    return Outcome::Keep;
                }
                self.check_missing(key, last_validated, stats).await
            }
        }
    }

    async fn check_remote(
        &self,
        key: &K,
        file: &Arc<RemoteFile>,
        last_validated: SystemTime,
        stats: &mut SweepStats,
    ) -> Outcome {
        // a local file takes precedence once it appears
        if key.local_path().exists() {
            stats.local_modified += 1;
            return Outcome::Evict;
        }
        let Some(url) = key.remote_url() else {
            return Outcome::Evict;
        };

        let now = SystemTime::now();
        let last_validated = last_validated.max(file.last_validated());
        let budget = key.revalidate_every(file.version().last_modified, now);
        if is_fresh(last_validated, budget, now) {
            return Outcome::Keep;
        }

        match self.inner.resolver.revalidate(key, &url, file).await {
            Ok(Revalidation::Unchanged) => {
                stats.remote_revalidated += 1;
                Outcome::Validated(now)
            }
            Ok(Revalidation::Replaced(new)) => {
                stats.remote_modified += 1;
                self.replace_blocks(file, &new);
                Outcome::Replace(Some(Backend::Remote(new)), now)
            }
            Ok(Revalidation::Deleted) => {
                stats.remote_deleted += 1;
                Outcome::Replace(None, now)
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to revalidate {:?}",
                    key
                );
                Outcome::Keep
            }
        }
    }

    async fn check_missing(
        &self,
        key: &K,
        last_validated: SystemTime,
        stats: &mut SweepStats,
    ) -> Outcome {
        let Some(url) = key.remote_url() else {
            return Outcome::Keep;
        };

        let now = SystemTime::now();
        if is_fresh(last_validated, key.revalidate_every(None, now), now) {
            return Outcome::Keep;
        }

        stats.remote_checked_exist += 1;
        match self.inner.resolver.check_exists(key, &url).await {
            Ok(Some(file)) => {
                tracing::debug!("Remote file of {:?} appeared", key);
                Outcome::Replace(Some(Backend::Remote(file)), now)
            }
            Ok(None) => Outcome::Validated(now),
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to check existence of {:?}",
                    key
                );
                Outcome::Keep
            }
        }
    }

    /// Drops the blocks of a replaced file, and warms up its successor.
    ///
    /// Blocks accessed within the grace window are kept, as readers may still be using them.
    fn replace_blocks(&self, old: &RemoteFile, new: &Arc<RemoteFile>) {
        let config = &self.inner.config;
        let active = if config.preload {
            old.active_blocks(config.preload_window)
        } else {
            Vec::new()
        };

        let deleted = old.delete_cached_blocks(config.block_grace);
        tracing::debug!(
            "Deleted {} blocks of replaced file `{}`",
            deleted,
            old.url()
        );

        if active.is_empty() {
            return;
        }
        let new = Arc::clone(new);
        let preload = async move {
            match new.preload(&active).await {
                Ok(count) => {
                    metric!(counter("blocks.preloaded") += count as i64);
                    tracing::debug!("Preloaded {} blocks of `{}`", count, new.url());
                }
                Err(err) => tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to preload blocks of `{}`",
                    new.url()
                ),
            }
        }
        .bind_hub(Hub::new_from_top(Hub::current()));
        tokio::spawn(preload);
    }

    /// Applies the outcome of a sweep, unless the entry was replaced in the meantime.
    fn apply(&self, key: &K, generation: u64, outcome: Outcome) {
        if let Outcome::Keep = outcome {
            return;
        }

        let mut states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(CacheState::Cached(entry)) = states.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            tracing::trace!("Entry of {:?} changed during the sweep", key);
            return;
        }

        match outcome {
            Outcome::Keep => {}
            Outcome::Evict => {
                states.remove(key);
            }
            Outcome::Validated(at) => entry.last_validated = at,
            Outcome::Replace(value, at) => {
                entry.value = value;
                entry.rejected = None;
                entry.last_validated = at;
                entry.generation = self.inner.next_generation();
            }
        }
    }
}

impl<K: FileKey> Sweep for ResolutionCache<K> {
    const NAME: &'static str = "hybrid";

    fn sweep(&self) -> impl Future<Output = SweepStats> + Send {
        self.revalidate()
    }
}
