//! Lock-free atomic counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::TelemetrySnapshot;

/// Counters shared by the engine worker and fetch tasks.
///
/// All operations use `Relaxed` ordering; counters are independent.
pub struct EngineMetrics {
    start_time: Instant,

    // === Frame metrics ===
    updates: AtomicU64,
    splits: AtomicU64,
    merges: AtomicU64,
    nodes_pruned: AtomicU64,

    // === Fetch metrics ===
    fetches_submitted: AtomicU64,
    fetches_started: AtomicU64,
    fetches_completed: AtomicU64,
    fetches_failed: AtomicU64,
    fetches_retried: AtomicU64,
    fetches_timed_out: AtomicU64,
    fetches_cancelled: AtomicU64,
    stale_completions: AtomicU64,
    fetches_active: AtomicUsize,
    /// Total fetch time in microseconds.
    fetch_time_us: AtomicU64,

    // === Cache metrics ===
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,
    cache_deferred: AtomicU64,
    cache_size_bytes: AtomicU64,

    // === Scene metrics ===
    drawables_built: AtomicU64,
    drawables_retired: AtomicU64,
    scene_publishes: AtomicU64,
    scene_version: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            updates: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            nodes_pruned: AtomicU64::new(0),
            fetches_submitted: AtomicU64::new(0),
            fetches_started: AtomicU64::new(0),
            fetches_completed: AtomicU64::new(0),
            fetches_failed: AtomicU64::new(0),
            fetches_retried: AtomicU64::new(0),
            fetches_timed_out: AtomicU64::new(0),
            fetches_cancelled: AtomicU64::new(0),
            stale_completions: AtomicU64::new(0),
            fetches_active: AtomicUsize::new(0),
            fetch_time_us: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_evictions: AtomicU64::new(0),
            cache_deferred: AtomicU64::new(0),
            cache_size_bytes: AtomicU64::new(0),
            drawables_built: AtomicU64::new(0),
            drawables_retired: AtomicU64::new(0),
            scene_publishes: AtomicU64::new(0),
            scene_version: AtomicU64::new(0),
        }
    }

    // === Frame tracking ===

    pub fn update_completed(&self, splits: usize, merges: usize) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.splits.fetch_add(splits as u64, Ordering::Relaxed);
        self.merges.fetch_add(merges as u64, Ordering::Relaxed);
    }

    pub fn nodes_pruned(&self, count: usize) {
        self.nodes_pruned.fetch_add(count as u64, Ordering::Relaxed);
    }

    // === Fetch tracking ===

    pub fn fetch_submitted(&self) {
        self.fetches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        self.fetches_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fetch task finishing, whatever its outcome.
    pub fn fetch_finished(&self, duration_us: u64) {
        // Saturate: teardown resets the active count while tasks still run.
        let _ = self
            .fetches_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        self.fetch_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn fetch_completed(&self) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_retried(&self) {
        self.fetches_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_timed_out(&self) {
        self.fetches_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_cancelled(&self) {
        self.fetches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_completion(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    // === Cache tracking ===

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_evicted(&self, count: usize) {
        self.cache_evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn cache_deferred(&self) {
        self.cache_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_size(&self, bytes: usize) {
        self.cache_size_bytes.store(bytes as u64, Ordering::Relaxed);
    }

    // === Scene tracking ===

    pub fn drawables_built(&self, count: usize) {
        self.drawables_built.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn drawables_retired(&self, count: usize) {
        self.drawables_retired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn scene_published(&self, version: u64) {
        self.scene_publishes.fetch_add(1, Ordering::Relaxed);
        self.scene_version.store(version, Ordering::Relaxed);
    }

    // === Snapshot ===

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let uptime = self.start_time.elapsed();
        let uptime_secs = uptime.as_secs_f64().max(0.001);

        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let fetches_completed = self.fetches_completed.load(Ordering::Relaxed);

        TelemetrySnapshot {
            uptime,
            updates: self.updates.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            nodes_pruned: self.nodes_pruned.load(Ordering::Relaxed),
            fetches_submitted: self.fetches_submitted.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_completed,
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            fetches_retried: self.fetches_retried.load(Ordering::Relaxed),
            fetches_timed_out: self.fetches_timed_out.load(Ordering::Relaxed),
            fetches_cancelled: self.fetches_cancelled.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            fetches_active: self.fetches_active.load(Ordering::Relaxed),
            total_fetch_time_ms: self.fetch_time_us.load(Ordering::Relaxed) / 1000,
            fetches_per_second: fetches_completed as f64 / uptime_secs,
            cache_hits,
            cache_misses,
            cache_hit_rate: if cache_total > 0 {
                cache_hits as f64 / cache_total as f64
            } else {
                0.0
            },
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_deferred: self.cache_deferred.load(Ordering::Relaxed),
            cache_size_bytes: self.cache_size_bytes.load(Ordering::Relaxed),
            drawables_built: self.drawables_built.load(Ordering::Relaxed),
            drawables_retired: self.drawables_retired.load(Ordering::Relaxed),
            scene_publishes: self.scene_publishes.load(Ordering::Relaxed),
            scene_version: self.scene_version.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the in-flight gauge. Used on teardown.
    pub fn reset_active(&self) {
        self.fetches_active.store(0, Ordering::Relaxed);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_lifecycle() {
        let metrics = EngineMetrics::new();
        metrics.fetch_submitted();
        metrics.fetch_started();
        assert_eq!(metrics.snapshot().fetches_active, 1);

        metrics.fetch_finished(2_500);
        metrics.fetch_completed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetches_active, 0);
        assert_eq!(snapshot.fetches_completed, 1);
        assert_eq!(snapshot.total_fetch_time_ms, 2);
    }

    #[test]
    fn test_active_gauge_saturates() {
        let metrics = EngineMetrics::new();
        metrics.fetch_started();
        metrics.reset_active();
        metrics.fetch_finished(0);
        assert_eq!(metrics.snapshot().fetches_active, 0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = EngineMetrics::new();
        assert_eq!(metrics.snapshot().cache_hit_rate, 0.0);
        metrics.cache_hit();
        metrics.cache_hit();
        metrics.cache_hit();
        metrics.cache_miss();
        assert!((metrics.snapshot().cache_hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_scene_version_tracked() {
        let metrics = EngineMetrics::new();
        metrics.scene_published(4);
        metrics.scene_published(5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scene_publishes, 2);
        assert_eq!(snapshot.scene_version, 5);
    }
}
