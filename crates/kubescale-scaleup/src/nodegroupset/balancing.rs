//! Spreading a scale-up across similar node groups.

use std::collections::HashMap;

use kubescale_cloud::{CloudProvider, NodeGroup, NodeGroupRef};
use kubescale_core::{AutoscalerError, AutoscalerResult, ErrorKind, NodeGroupAutoscalingOptions, NodeInfo};
use tracing::{debug, warn};

use super::comparator::NodeInfoComparator;
use super::{NodeGroupSetProcessor, ScaleUpInfo, is_zero_or_max};

/// Finds similar groups with a [`NodeInfoComparator`] and balances with
/// [`balance_scale_up_between_groups`].
pub struct BalancingNodeGroupSetProcessor {
    comparator: Box<dyn NodeInfoComparator>,
}

impl BalancingNodeGroupSetProcessor {
    pub fn new(comparator: Box<dyn NodeInfoComparator>) -> Self {
        Self { comparator }
    }
}

impl NodeGroupSetProcessor for BalancingNodeGroupSetProcessor {
    fn find_similar_node_groups(
        &self,
        provider: &dyn CloudProvider,
        node_group: &dyn NodeGroup,
        node_infos: &HashMap<String, NodeInfo>,
    ) -> AutoscalerResult<Vec<NodeGroupRef>> {
        let id = node_group.id();
        let Some(reference) = node_infos.get(&id) else {
            return Err(AutoscalerError::new(
                ErrorKind::Internal,
                format!("failed to find template node info for node group {id}"),
            ));
        };

        let mut similar = Vec::new();
        for candidate in provider.node_groups() {
            let candidate_id = candidate.id();
            if candidate_id == id {
                continue;
            }
            let Some(info) = node_infos.get(&candidate_id) else {
                warn!(node_group = %candidate_id, "no template node info, skipping in similarity check");
                continue;
            };
            if self.comparator.similar(reference, info) {
                similar.push(candidate);
            }
        }
        debug!(node_group = %id, similar = similar.len(), "found similar node groups");
        Ok(similar)
    }

    fn balance_scale_up_between_groups(
        &self,
        groups: &[NodeGroupRef],
        new_nodes: usize,
        defaults: &NodeGroupAutoscalingOptions,
    ) -> AutoscalerResult<Vec<ScaleUpInfo>> {
        balance_scale_up_between_groups(groups, new_nodes, defaults)
    }
}

/// Split `new_nodes` across `groups` so that the resulting sizes are as
/// even as possible, filling the smallest groups first.
///
/// Groups already at max are skipped. Zero-or-max groups are taken whole
/// (current to max) or not at all. The total is capped at the combined
/// remaining capacity. Only groups that grow are returned, sorted by id.
pub fn balance_scale_up_between_groups(
    groups: &[NodeGroupRef],
    new_nodes: usize,
    defaults: &NodeGroupAutoscalingOptions,
) -> AutoscalerResult<Vec<ScaleUpInfo>> {
    if groups.is_empty() {
        return Err(AutoscalerError::new(
            ErrorKind::Internal,
            "can't balance scale-up between 0 node groups",
        ));
    }

    let mut regular = Vec::new();
    let mut whole = Vec::new();
    for group in groups {
        let current_size = group.target_size().map_err(|e| {
            AutoscalerError::from(e).add_prefix(format!(
                "failed to get target size of node group {}: ",
                group.id()
            ))
        })?;
        let max_size = group.max_size();
        if current_size >= max_size {
            continue;
        }
        let info = ScaleUpInfo {
            group: group.clone(),
            current_size,
            new_size: current_size,
            max_size,
        };
        if is_zero_or_max(group.as_ref(), defaults) {
            whole.push(info);
        } else {
            regular.push(info);
        }
    }

    let by_size = |a: &ScaleUpInfo, b: &ScaleUpInfo| {
        a.current_size
            .cmp(&b.current_size)
            .then_with(|| a.group.id().cmp(&b.group.id()))
    };

    let mut remaining = new_nodes;
    whole.sort_by(by_size);
    for info in &mut whole {
        let capacity = info.max_size - info.current_size;
        if capacity <= remaining {
            info.new_size = info.max_size;
            remaining -= capacity;
        }
    }

    let capacity: usize = regular.iter().map(|i| i.max_size - i.current_size).sum();
    if remaining > capacity {
        debug!(requested = remaining, capacity, "capping scale-up to combined node group capacity");
        remaining = capacity;
    }

    regular.sort_by(by_size);
    // Groups in [start, current] share the same new size; everything before
    // start is full.
    let mut start = 0;
    let mut current = 0;
    while remaining > 0 && start < regular.len() {
        if regular[current].new_size < regular[current].max_size {
            regular[current].new_size += 1;
            remaining -= 1;
        } else {
            regular.swap(start, current);
            start += 1;
        }
        if start >= regular.len() {
            break;
        }
        let size = regular[current].new_size;
        current = if current + 1 < regular.len() && size > regular[current + 1].new_size {
            current + 1
        } else {
            start
        };
    }

    let mut result: Vec<ScaleUpInfo> = whole
        .into_iter()
        .chain(regular)
        .filter(|info| info.new_size > info.current_size)
        .collect();
    result.sort_by_key(|info| info.group.id());
    Ok(result)
}
