//! Point-in-time telemetry.

use std::fmt;
use std::time::Duration;

use crate::config::format_size;

/// Copy of [`EngineMetrics`](super::EngineMetrics) at one instant.
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
    pub uptime: Duration,

    pub updates: u64,
    pub splits: u64,
    pub merges: u64,
    pub nodes_pruned: u64,

    pub fetches_submitted: u64,
    pub fetches_started: u64,
    pub fetches_completed: u64,
    pub fetches_failed: u64,
    pub fetches_retried: u64,
    pub fetches_timed_out: u64,
    pub fetches_cancelled: u64,
    /// Completions ignored because their request was cancelled or torn down.
    pub stale_completions: u64,
    pub fetches_active: usize,
    pub total_fetch_time_ms: u64,
    pub fetches_per_second: f64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_evictions: u64,
    pub cache_deferred: u64,
    pub cache_size_bytes: u64,

    pub drawables_built: u64,
    pub drawables_retired: u64,
    pub scene_publishes: u64,
    pub scene_version: u64,
}

impl TelemetrySnapshot {
    /// Mean fetch latency in milliseconds.
    pub fn mean_fetch_ms(&self) -> f64 {
        let finished = self.fetches_completed + self.fetches_failed + self.fetches_retried;
        if finished == 0 {
            0.0
        } else {
            self.total_fetch_time_ms as f64 / finished as f64
        }
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uptime:      {:.1}s", self.uptime.as_secs_f64())?;
        writeln!(
            f,
            "Frames:      {} updates, {} splits, {} merges, {} nodes pruned",
            self.updates, self.splits, self.merges, self.nodes_pruned
        )?;
        writeln!(
            f,
            "Fetches:     {} completed, {} failed, {} retried, {} timed out, {} cancelled, {} active",
            self.fetches_completed,
            self.fetches_failed,
            self.fetches_retried,
            self.fetches_timed_out,
            self.fetches_cancelled,
            self.fetches_active
        )?;
        writeln!(
            f,
            "             {:.1}/s, {:.1} ms mean, {} stale completions ignored",
            self.fetches_per_second,
            self.mean_fetch_ms(),
            self.stale_completions
        )?;
        writeln!(
            f,
            "Cache:       {} used, {:.1}% hits, {} evictions, {} deferred inserts",
            format_size(self.cache_size_bytes as usize),
            self.cache_hit_rate * 100.0,
            self.cache_evictions,
            self.cache_deferred
        )?;
        write!(
            f,
            "Scene:       v{} after {} publishes, {} drawables built, {} retired",
            self.scene_version, self.scene_publishes, self.drawables_built, self.drawables_retired
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_sections() {
        let snapshot = TelemetrySnapshot {
            cache_size_bytes: 2 * 1024 * 1024,
            scene_version: 7,
            ..Default::default()
        };
        let text = snapshot.to_string();
        assert!(text.contains("Cache:       2MB used"));
        assert!(text.contains("Scene:       v7"));
    }

    #[test]
    fn test_mean_fetch_ms() {
        let snapshot = TelemetrySnapshot {
            fetches_completed: 3,
            fetches_failed: 1,
            total_fetch_time_ms: 200,
            ..Default::default()
        };
        assert!((snapshot.mean_fetch_ms() - 50.0).abs() < 1e-9);
        assert_eq!(TelemetrySnapshot::default().mean_fetch_ms(), 0.0);
    }
}
