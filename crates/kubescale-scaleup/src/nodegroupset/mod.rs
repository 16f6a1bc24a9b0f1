//! Node-group sets: finding groups interchangeable with a chosen one and
//! spreading a scale-up across them.

mod balancing;
mod comparator;

use std::collections::HashMap;
use std::fmt;

use kubescale_cloud::{CloudProvider, NodeGroup, NodeGroupRef};
use kubescale_core::{AutoscalerResult, NodeGroupAutoscalingOptions, NodeInfo};

pub use balancing::{BalancingNodeGroupSetProcessor, balance_scale_up_between_groups};
pub use comparator::{
    BASIC_IGNORED_LABELS, DifferenceRatios, GenericNodeInfoComparator, LabelNodeInfoComparator,
    NodeInfoComparator, comparator_from_options,
};

/// One node group resize: the unit of work handed to the executor.
#[derive(Clone)]
pub struct ScaleUpInfo {
    pub group: NodeGroupRef,
    pub current_size: usize,
    pub new_size: usize,
    pub max_size: usize,
}

impl ScaleUpInfo {
    pub fn delta(&self) -> usize {
        self.new_size.saturating_sub(self.current_size)
    }
}

impl fmt::Debug for ScaleUpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ScaleUpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} {}->{} (max: {})}}",
            self.group.id(),
            self.current_size,
            self.new_size,
            self.max_size
        )
    }
}

/// Group options, falling back to `defaults` when the provider has none
/// or cannot report them.
pub fn effective_options(
    group: &dyn NodeGroup,
    defaults: &NodeGroupAutoscalingOptions,
) -> NodeGroupAutoscalingOptions {
    match group.get_options(defaults) {
        Ok(Some(options)) => options,
        _ => defaults.clone(),
    }
}

pub fn is_zero_or_max(group: &dyn NodeGroup, defaults: &NodeGroupAutoscalingOptions) -> bool {
    effective_options(group, defaults).zero_or_max_node_scaling
}

pub trait NodeGroupSetProcessor: Send + Sync {
    /// Groups whose templates are interchangeable with `node_group`'s.
    fn find_similar_node_groups(
        &self,
        provider: &dyn CloudProvider,
        node_group: &dyn NodeGroup,
        node_infos: &HashMap<String, NodeInfo>,
    ) -> AutoscalerResult<Vec<NodeGroupRef>>;

    /// Spread `new_nodes` across `groups`.
    fn balance_scale_up_between_groups(
        &self,
        groups: &[NodeGroupRef],
        new_nodes: usize,
        defaults: &NodeGroupAutoscalingOptions,
    ) -> AutoscalerResult<Vec<ScaleUpInfo>>;
}
