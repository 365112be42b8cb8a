//! Engine telemetry.
//!
//! ```text
//! Engine stages ─────► EngineMetrics ─────► TelemetrySnapshot ─────► CLI
//!                      (atomic counters)    (point-in-time copy)
//! ```
//!
//! The engine worker and its fetch tasks record into a shared
//! `Arc<EngineMetrics>`; readers take snapshots from any thread.

mod metrics;
mod snapshot;

pub use metrics::EngineMetrics;
pub use snapshot::TelemetrySnapshot;
