//! Autoscaler metrics registry.
//!
//! Plain counters are atomics; labelled families sit behind a mutex each.
//! Executor workers record concurrently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kubescale_core::{AutoscalerError, ErrorKind};
use tracing::trace;

/// Instrumented phases of the scale-up path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FunctionLabel {
    ScaleUp,
    BuildPodEquivalenceGroups,
    Estimate,
}

impl FunctionLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            FunctionLabel::ScaleUp => "scaleUp",
            FunctionLabel::BuildPodEquivalenceGroups => "scaleUp:buildPodEquivalenceGroups",
            FunctionLabel::Estimate => "scaleUp:estimate",
        }
    }
}

impl fmt::Display for FunctionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count, sum and maximum of observed durations, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationSummary {
    pub count: u64,
    pub sum_seconds: f64,
    pub max_seconds: f64,
}

impl DurationSummary {
    fn observe(&mut self, d: Duration) {
        let secs = d.as_secs_f64();
        self.count += 1;
        self.sum_seconds += secs;
        if secs > self.max_seconds {
            self.max_seconds = secs;
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub function_durations: BTreeMap<String, DurationSummary>,
    pub scaled_up_nodes_total: u64,
    /// `(gpu_resource_name, gpu_name)` → nodes.
    pub scaled_up_gpu_nodes_total: BTreeMap<(String, String), u64>,
    /// reason → failed scale-ups.
    pub failed_scale_ups_total: BTreeMap<String, u64>,
    /// `(reason, gpu_resource_name, gpu_name)` → failed scale-ups.
    pub failed_gpu_scale_ups_total: BTreeMap<(String, String, String), u64>,
    /// `(direction, reason)` → skipped scale events.
    pub skipped_scale_events_count: BTreeMap<(String, String), u64>,
    pub created_node_groups_total: u64,
    /// error type → errors.
    pub errors_total: BTreeMap<String, u64>,
}

const DIRECTION_UP: &str = "up";
const CPU_RESOURCE_LIMIT: &str = "CpuResourceLimit";
const MEMORY_RESOURCE_LIMIT: &str = "MemoryResourceLimit";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bump<K: Ord>(m: &Mutex<BTreeMap<K, u64>>, key: K, by: u64) {
    *lock(m).entry(key).or_insert(0) += by;
}

#[derive(Debug, Default)]
pub struct AutoscalerMetrics {
    durations: Mutex<BTreeMap<FunctionLabel, DurationSummary>>,
    scaled_up_nodes: AtomicU64,
    scaled_up_gpu_nodes: Mutex<BTreeMap<(String, String), u64>>,
    failed_scale_ups: Mutex<BTreeMap<String, u64>>,
    failed_gpu_scale_ups: Mutex<BTreeMap<(String, String, String), u64>>,
    skipped_scale_events: Mutex<BTreeMap<(String, String), u64>>,
    created_node_groups: AtomicU64,
    errors: Mutex<BTreeMap<String, u64>>,
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the time elapsed since `start` for `label`.
    pub fn update_duration(&self, label: FunctionLabel, start: Instant) {
        let elapsed = start.elapsed();
        trace!(function = %label, elapsed_ms = elapsed.as_millis() as u64, "function duration");
        lock(&self.durations).entry(label).or_default().observe(elapsed);
    }

    /// Count `delta` new nodes; GPU nodes are also counted per GPU type.
    pub fn register_scale_up(&self, delta: usize, gpu_resource_name: &str, gpu_type: &str) {
        self.scaled_up_nodes.fetch_add(delta as u64, Ordering::Relaxed);
        if !gpu_resource_name.is_empty() {
            bump(
                &self.scaled_up_gpu_nodes,
                (gpu_resource_name.to_string(), gpu_type.to_string()),
                delta as u64,
            );
        }
    }

    pub fn register_failed_scale_up(&self, reason: ErrorKind, gpu_resource_name: &str, gpu_type: &str) {
        bump(&self.failed_scale_ups, reason.as_str().to_string(), 1);
        if !gpu_resource_name.is_empty() {
            bump(
                &self.failed_gpu_scale_ups,
                (
                    reason.as_str().to_string(),
                    gpu_resource_name.to_string(),
                    gpu_type.to_string(),
                ),
                1,
            );
        }
    }

    pub fn register_skipped_scale_up_cpu(&self) {
        bump(
            &self.skipped_scale_events,
            (DIRECTION_UP.to_string(), CPU_RESOURCE_LIMIT.to_string()),
            1,
        );
    }

    pub fn register_skipped_scale_up_memory(&self) {
        bump(
            &self.skipped_scale_events,
            (DIRECTION_UP.to_string(), MEMORY_RESOURCE_LIMIT.to_string()),
            1,
        );
    }

    pub fn register_node_group_creation(&self) {
        self.created_node_groups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn register_error(&self, err: &AutoscalerError) {
        bump(&self.errors, err.kind.as_str().to_string(), 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            function_durations: lock(&self.durations)
                .iter()
                .map(|(label, summary)| (label.as_str().to_string(), *summary))
                .collect(),
            scaled_up_nodes_total: self.scaled_up_nodes.load(Ordering::Relaxed),
            scaled_up_gpu_nodes_total: lock(&self.scaled_up_gpu_nodes).clone(),
            failed_scale_ups_total: lock(&self.failed_scale_ups).clone(),
            failed_gpu_scale_ups_total: lock(&self.failed_gpu_scale_ups).clone(),
            skipped_scale_events_count: lock(&self.skipped_scale_events).clone(),
            created_node_groups_total: self.created_node_groups.load(Ordering::Relaxed),
            errors_total: lock(&self.errors).clone(),
        }
    }
}
