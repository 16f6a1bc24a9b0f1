//! Limits on how long option building may run.

use std::time::{Duration, Instant};

use kubescale_cloud::NodeGroupRef;
use tracing::info;

use crate::expander::ExpansionOption;

pub trait BinpackingLimiter: Send {
    fn init_binpacking(&mut self, node_groups: &[NodeGroupRef]);

    fn mark_processed(&mut self, node_group_id: &str);

    /// Whether to stop building options after the ones evaluated so far.
    fn stop_binpacking(&mut self, evaluated_options: &[ExpansionOption]) -> bool;

    fn finalize_binpacking(&mut self, final_options: &[ExpansionOption]);
}

/// Never stops early.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBinpackingLimiter;

impl BinpackingLimiter for NoOpBinpackingLimiter {
    fn init_binpacking(&mut self, _node_groups: &[NodeGroupRef]) {}

    fn mark_processed(&mut self, _node_group_id: &str) {}

    fn stop_binpacking(&mut self, _evaluated_options: &[ExpansionOption]) -> bool {
        false
    }

    fn finalize_binpacking(&mut self, _final_options: &[ExpansionOption]) {}
}

/// Stops once `max_duration` has passed, as long as at least one option
/// was found.
#[derive(Debug)]
pub struct TimeLimitedBinpackingLimiter {
    max_duration: Duration,
    started: Option<Instant>,
    total: usize,
    processed: usize,
}

impl TimeLimitedBinpackingLimiter {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration,
            started: None,
            total: 0,
            processed: 0,
        }
    }
}

impl BinpackingLimiter for TimeLimitedBinpackingLimiter {
    fn init_binpacking(&mut self, node_groups: &[NodeGroupRef]) {
        self.started = Some(Instant::now());
        self.total = node_groups.len();
        self.processed = 0;
    }

    fn mark_processed(&mut self, _node_group_id: &str) {
        self.processed += 1;
    }

    fn stop_binpacking(&mut self, evaluated_options: &[ExpansionOption]) -> bool {
        if evaluated_options.is_empty() {
            return false;
        }
        let Some(started) = self.started else {
            return false;
        };
        if started.elapsed() <= self.max_duration {
            return false;
        }
        info!(
            processed = self.processed,
            total = self.total,
            options = evaluated_options.len(),
            "binpacking time limit reached, stopping option building"
        );
        true
    }

    fn finalize_binpacking(&mut self, _final_options: &[ExpansionOption]) {
        self.started = None;
    }
}
