//! Node-count estimation for a scale-up candidate.
//!
//! Given the pods that fit a group's template, an [`Estimator`] answers
//! "how many new nodes would it take, and which of these pods would they
//! hold?". The only implementation is bin-packing on template copies
//! inside a forked snapshot.

mod binpacking;
mod limiter;
mod orderer;

use std::sync::Arc;
use std::time::Duration;

use kubescale_cloud::{NodeGroup, NodeGroupRef};
use kubescale_core::{AutoscalingOptions, ConfigError, NodeInfo, PodRef};

use crate::predicates::PredicateChecker;
use crate::snapshot::ClusterSnapshot;

pub use binpacking::BinpackingEstimator;
pub use limiter::{
    ClusterCapacityThreshold, EstimationLimiter, NodeLimit, SimilarNodeGroupsCapacityThreshold,
    StaticThreshold, Threshold, ThresholdBasedEstimationLimiter,
};
pub use orderer::{DecreasingPodOrderer, PodOrderer};

/// Cluster facts an estimation is bounded by.
#[derive(Debug, Clone, Default)]
pub struct EstimationContext {
    /// Groups the scale-up may be balanced across.
    pub similar_node_groups: Vec<NodeGroupRef>,
    /// Nodes in the cluster plus nodes already on their way.
    pub current_node_count: usize,
    /// Cluster-wide node cap, 0 when unlimited.
    pub cluster_max_node_limit: usize,
}

/// Result of one estimation.
#[derive(Debug, Clone, Default)]
pub struct Estimate {
    pub node_count: usize,
    /// Pods the new nodes would hold, in scheduling order.
    pub pods: Vec<PodRef>,
}

pub trait Estimator: Send {
    /// `pod_groups` are groups of equivalent pods; each is non-empty.
    fn estimate(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        pod_groups: &[Vec<PodRef>],
        template: &NodeInfo,
        node_group: &dyn NodeGroup,
    ) -> Estimate;
}

pub trait EstimatorBuilder: Send + Sync {
    fn build(&self, context: EstimationContext) -> Box<dyn Estimator>;
}

/// Builds [`BinpackingEstimator`]s limited by the static, similar-group
/// capacity and cluster capacity thresholds.
pub struct BinpackingEstimatorBuilder {
    predicate_checker: Arc<dyn PredicateChecker>,
    max_nodes_per_scale_up: usize,
    max_duration_per_group: Duration,
}

impl BinpackingEstimatorBuilder {
    pub fn new(
        predicate_checker: Arc<dyn PredicateChecker>,
        max_nodes_per_scale_up: usize,
        max_duration_per_group: Duration,
    ) -> Self {
        Self {
            predicate_checker,
            max_nodes_per_scale_up,
            max_duration_per_group,
        }
    }

    pub fn from_options(
        predicate_checker: Arc<dyn PredicateChecker>,
        options: &AutoscalingOptions,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            predicate_checker,
            options.max_nodes_per_scale_up,
            options.binpacking_duration_per_group()?,
        ))
    }
}

impl EstimatorBuilder for BinpackingEstimatorBuilder {
    fn build(&self, context: EstimationContext) -> Box<dyn Estimator> {
        let limiter = ThresholdBasedEstimationLimiter::new(vec![
            Box::new(StaticThreshold::new(
                self.max_nodes_per_scale_up,
                self.max_duration_per_group,
            )),
            Box::new(SimilarNodeGroupsCapacityThreshold),
            Box::new(ClusterCapacityThreshold),
        ]);
        Box::new(BinpackingEstimator::new(
            self.predicate_checker.clone(),
            Box::new(limiter),
            Box::new(DecreasingPodOrderer),
            context,
        ))
    }
}
