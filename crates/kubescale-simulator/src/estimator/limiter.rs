//! Limits on how far a single estimation may go.

use std::time::{Duration, Instant};

use kubescale_cloud::NodeGroup;
use tracing::debug;

use super::EstimationContext;

/// Node budget of one estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLimit {
    Unlimited,
    AtMost(usize),
    /// No node may be added at all.
    Exhausted,
}

impl NodeLimit {
    /// The stricter of two limits.
    pub fn min(self, other: NodeLimit) -> NodeLimit {
        match (self, other) {
            (NodeLimit::Exhausted, _) | (_, NodeLimit::Exhausted) => NodeLimit::Exhausted,
            (NodeLimit::Unlimited, x) | (x, NodeLimit::Unlimited) => x,
            (NodeLimit::AtMost(a), NodeLimit::AtMost(b)) => NodeLimit::AtMost(a.min(b)),
        }
    }
}

fn min_duration(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

pub trait EstimationLimiter: Send {
    fn start_estimation(&mut self, node_group: &dyn NodeGroup, context: &EstimationContext);

    fn end_estimation(&mut self);

    /// Ask to add one more node. Granting it counts against the budget.
    fn permission_to_add_node(&mut self) -> bool;
}

/// One source of limits for the threshold-based limiter.
pub trait Threshold: Send + Sync {
    fn node_limit(&self, node_group: &dyn NodeGroup, context: &EstimationContext) -> NodeLimit;

    fn duration_limit(
        &self,
        node_group: &dyn NodeGroup,
        context: &EstimationContext,
    ) -> Option<Duration>;
}

/// Fixed limits from configuration. Zero disables either limit.
#[derive(Debug, Clone)]
pub struct StaticThreshold {
    max_nodes: usize,
    max_duration: Duration,
}

impl StaticThreshold {
    pub fn new(max_nodes: usize, max_duration: Duration) -> Self {
        Self {
            max_nodes,
            max_duration,
        }
    }
}

impl Threshold for StaticThreshold {
    fn node_limit(&self, _: &dyn NodeGroup, _: &EstimationContext) -> NodeLimit {
        if self.max_nodes == 0 {
            NodeLimit::Unlimited
        } else {
            NodeLimit::AtMost(self.max_nodes)
        }
    }

    fn duration_limit(&self, _: &dyn NodeGroup, _: &EstimationContext) -> Option<Duration> {
        (!self.max_duration.is_zero()).then_some(self.max_duration)
    }
}

/// No more nodes than the group and its similar groups can still grow by.
#[derive(Debug, Clone, Default)]
pub struct SimilarNodeGroupsCapacityThreshold;

impl Threshold for SimilarNodeGroupsCapacityThreshold {
    fn node_limit(&self, node_group: &dyn NodeGroup, context: &EstimationContext) -> NodeLimit {
        let headroom = |group: &dyn NodeGroup| {
            group
                .target_size()
                .map(|target| group.max_size().saturating_sub(target))
                .unwrap_or(0)
        };
        let total = headroom(node_group)
            + context
                .similar_node_groups
                .iter()
                .map(|g| headroom(g.as_ref()))
                .sum::<usize>();
        if total == 0 {
            NodeLimit::Unlimited
        } else {
            NodeLimit::AtMost(total)
        }
    }

    fn duration_limit(&self, _: &dyn NodeGroup, _: &EstimationContext) -> Option<Duration> {
        None
    }
}

/// No more nodes than the cluster-wide cap leaves room for.
#[derive(Debug, Clone, Default)]
pub struct ClusterCapacityThreshold;

impl Threshold for ClusterCapacityThreshold {
    fn node_limit(&self, _: &dyn NodeGroup, context: &EstimationContext) -> NodeLimit {
        if context.cluster_max_node_limit == 0 {
            return NodeLimit::Unlimited;
        }
        match context
            .cluster_max_node_limit
            .saturating_sub(context.current_node_count)
        {
            0 => NodeLimit::Exhausted,
            left => NodeLimit::AtMost(left),
        }
    }

    fn duration_limit(&self, _: &dyn NodeGroup, _: &EstimationContext) -> Option<Duration> {
        None
    }
}

/// Takes the strictest node and duration limit of its thresholds.
pub struct ThresholdBasedEstimationLimiter {
    thresholds: Vec<Box<dyn Threshold>>,
    max_nodes: NodeLimit,
    max_duration: Option<Duration>,
    nodes: usize,
    start: Option<Instant>,
}

impl ThresholdBasedEstimationLimiter {
    pub fn new(thresholds: Vec<Box<dyn Threshold>>) -> Self {
        Self {
            thresholds,
            max_nodes: NodeLimit::Unlimited,
            max_duration: None,
            nodes: 0,
            start: None,
        }
    }
}

impl EstimationLimiter for ThresholdBasedEstimationLimiter {
    fn start_estimation(&mut self, node_group: &dyn NodeGroup, context: &EstimationContext) {
        self.start = Some(Instant::now());
        self.nodes = 0;
        self.max_nodes = NodeLimit::Unlimited;
        self.max_duration = None;
        for threshold in &self.thresholds {
            self.max_nodes = self
                .max_nodes
                .min(threshold.node_limit(node_group, context));
            self.max_duration = min_duration(
                self.max_duration,
                threshold.duration_limit(node_group, context),
            );
        }
    }

    fn end_estimation(&mut self) {
        self.start = None;
    }

    fn permission_to_add_node(&mut self) -> bool {
        match self.max_nodes {
            NodeLimit::Exhausted => {
                debug!("binpacking capped: no node capacity left");
                return false;
            }
            NodeLimit::AtMost(max) if self.nodes >= max => {
                debug!(max, "capping binpacking after exceeding node threshold");
                return false;
            }
            _ => {}
        }
        if let (Some(start), Some(max)) = (self.start, self.max_duration)
            && start.elapsed() > max
        {
            debug!(max_secs = max.as_secs_f64(), "capping binpacking after exceeding max duration");
            return false;
        }
        self.nodes += 1;
        true
    }
}
