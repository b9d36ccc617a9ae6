//! # Resolution caching
//!
//! Every request for an array file first needs to know *where* the file is. A file can exist on
//! local storage, on the remote origin, or nowhere at all, and the answer changes over time as
//! new model runs are written. Finding out is comparatively expensive (an `open`, or a `HEAD`
//! request plus a header read), so the answers are cached.
//!
//! ## Layers
//!
//! - The [`ResolutionCache`] maps keys to the [`Backend`](crate::files::Backend) they resolved
//!   to. Concurrent lookups of a key that is not cached yet are coalesced, only one resolution
//!   happens, and all callers receive its result. Failed resolutions are never cached.
//! - The [`VersionStore`] remembers what the origin last said about a URL, including that a
//!   file does not exist. It is consulted by the [`BackendResolver`] to avoid asking the origin
//!   again within the revalidation budget of a key, and can be persisted across restarts.
//! - The [block store](crate::blocks) holds the contents of remote files. Blocks are keyed by
//!   the file version, so replaced files never serve stale contents.
//!
//! Deployments without a remote origin use the simpler [`LocalFileCache`].
//!
//! ## Sweeping
//!
//! Cached entries are not validated on access. Instead, a [`BackgroundSweeper`] periodically
//! sweeps the cache:
//!
//! - Entries that were not accessed for `max_unused_for` are evicted.
//! - Local files that were deleted or replaced are evicted, as are missing entries whose local
//!   file appeared. The next lookup resolves them again.
//! - Remote files are revalidated with the origin once their revalidation budget is exhausted.
//!   A replaced file swaps in the new version, drops the blocks of the old version that were
//!   not accessed within `block_grace`, and preloads the recently active ones.
//! - Missing files are checked for existence once their budget is exhausted.
//!
//! ### Metrics
//!
//! - `caches.hybrid.hit` / `caches.hybrid.miss`: lookups served from / not served from the cache.
//! - `caches.hybrid.channel.hit`: lookups coalesced with a running resolution.
//! - `caches.hybrid.retry`: operations retried because the remote file was replaced.
//! - `caches.sweep`: sweep outcomes, tagged by `cache` and `outcome`.
//! - `caches.entries` / `caches.resolving`: gauges, updated by every sweep.

mod cache_error;
mod local;
mod resolution;
mod resolver;
mod sweeper;
mod versions;


pub use cache_error::{CacheContents, CacheError};
pub use local::LocalFileCache;
pub use resolution::ResolutionCache;
pub use resolver::{BackendResolver, Resolved, Revalidation};
pub use sweeper::{BackgroundSweeper, Sweep, SweepStats};
pub use versions::{RemoteVersion, VersionState, VersionStore};
