use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counters of one or more sweeps of a cache.
///
/// `entries` and `resolving` describe the cache after the latest sweep, all other fields are
/// summed up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub ticks: u64,
    /// Cached entries.
    pub entries: u64,
    /// Keys that were still being resolved, and were skipped.
    pub resolving: u64,
    pub evicted_inactive: u64,
    pub local_modified: u64,
    pub remote_modified: u64,
    pub remote_deleted: u64,
    pub remote_revalidated: u64,
    pub remote_checked_exist: u64,
}

impl SweepStats {
    /// Adds the counters of a later sweep.
    pub fn merge(&mut self, other: &SweepStats) {
        self.ticks += other.ticks;
        self.entries = other.entries;
        self.resolving = other.resolving;
        self.evicted_inactive += other.evicted_inactive;
        self.local_modified += other.local_modified;
        self.remote_modified += other.remote_modified;
        self.remote_deleted += other.remote_deleted;
        self.remote_revalidated += other.remote_revalidated;
        self.remote_checked_exist += other.remote_checked_exist;
    }

    pub fn emit_metrics(&self, cache: &str) {
        metric!(gauge("caches.entries") = self.entries, "cache" => cache);
        metric!(gauge("caches.resolving") = self.resolving, "cache" => cache);

        let counters = [
            ("evicted_inactive", self.evicted_inactive),
            ("local_modified", self.local_modified),
            ("remote_modified", self.remote_modified),
            ("remote_deleted", self.remote_deleted),
            ("remote_revalidated", self.remote_revalidated),
            ("remote_checked_exist", self.remote_checked_exist),
        ];
        for (outcome, count) in counters {
            if count > 0 {
                metric!(
                    counter("caches.sweep") += count as i64,
                    "cache" => cache,
                    "outcome" => outcome,
                );
            }
        }
    }
}

/// A cache that needs to be swept periodically.
pub trait Sweep: Clone + Send + Sync + 'static {
    /// The name used in logs and metrics.
    const NAME: &'static str;

    /// Revalidates and evicts entries.
    fn sweep(&self) -> impl Future<Output = SweepStats> + Send;
}

/// Runs the sweep of a cache at a fixed interval, until dropped.
///
/// Sweeps never overlap. If a sweep takes longer than the interval, the next one is delayed.
#[derive(Debug)]
pub struct BackgroundSweeper {
    handle: JoinHandle<()>,
}

impl BackgroundSweeper {
    /// Spawns the sweeper onto the current runtime.
    ///
    /// Accumulated statistics are logged every `log_stats_every` sweeps.
    pub fn spawn<C: Sweep>(cache: C, interval: Duration, log_stats_every: u32) -> Self {
        let log_stats_every = u64::from(log_stats_every.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            let mut totals = SweepStats::default();
            loop {
                interval.tick().await;

                let start = Instant::now();
                let stats = cache.sweep().await;
                metric!(timer("caches.sweep.duration") = start.elapsed(), "cache" => C::NAME);
                stats.emit_metrics(C::NAME);

                totals.merge(&stats);
                if totals.ticks >= log_stats_every {
                    tracing::info!(cache = C::NAME, stats = ?totals, "Swept cache");
                    totals = SweepStats::default();
                }
            }
        });
        Self { handle }
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[derive(Clone, Default)]
    struct CountingCache(Arc<AtomicU64>);

    impl Sweep for CountingCache {
        const NAME: &'static str = "counting";

        async fn sweep(&self) -> SweepStats {
            self.0.fetch_add(1, Ordering::Relaxed);
            SweepStats {
                ticks: 1,
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_merge() {
        let mut totals = SweepStats::default();
        totals.merge(&SweepStats {
            ticks: 1,
            entries: 10,
            resolving: 2,
            evicted_inactive: 3,
            remote_revalidated: 4,
            ..Default::default()
        });
        totals.merge(&SweepStats {
            ticks: 1,
            entries: 7,
            evicted_inactive: 1,
            remote_modified: 1,
            ..Default::default()
        });

        insta::assert_yaml_snapshot!(totals, @r"
        ticks: 2
        entries: 7
        resolving: 0
        evicted_inactive: 4
        local_modified: 0
        remote_modified: 1
        remote_deleted: 0
        remote_revalidated: 4
        remote_checked_exist: 0
        ");
    }

    #[tokio::test]
    async fn test_sweeps_until_dropped() {
        let cache = CountingCache::default();
        let sweeper = BackgroundSweeper::spawn(cache.clone(), Duration::from_millis(20), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let swept = cache.0.load(Ordering::Relaxed);
        assert!(swept >= 2, "swept {swept} times");

        drop(sweeper);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = cache.0.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.0.load(Ordering::Relaxed), after_drop);
    }
}
