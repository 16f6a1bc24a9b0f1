//! kubescale-metrics — autoscaler observability.
//!
//! Counters and function-duration summaries recorded by the scale-up
//! path, and Prometheus text exposition of a point-in-time snapshot.
//!
//! # Architecture
//!
//! ```text
//! AutoscalerMetrics (Arc-shared, Send + Sync)
//!   ├── update_duration(FunctionLabel, start)   ← orchestrator phases
//!   ├── register_scale_up / register_failed_scale_up ← executor workers
//!   ├── register_skipped_scale_up_{cpu,memory}  ← node-group filter
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus(&MetricsSnapshot) → text/plain
//! ```

pub mod autoscaler;
pub mod prometheus;

pub use autoscaler::{AutoscalerMetrics, DurationSummary, FunctionLabel, MetricsSnapshot};
pub use prometheus::render_prometheus;
