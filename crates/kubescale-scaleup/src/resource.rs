//! Cluster-wide resource accounting for scale-up.
//!
//! Limits are per-resource headroom left under the provider's maxima;
//! deltas are what one new node of a group adds. Cores are whole cores,
//! memory is bytes, custom resources (GPU types) are device counts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kubescale_cloud::{CloudProvider, NodeGroup, RESOURCE_CORES, RESOURCE_MEMORY};
use kubescale_core::resources::millis_to_cores;
use kubescale_core::{AutoscalerError, AutoscalerResult, ErrorKind, Node, NodeInfo};
use tracing::error;

use crate::processors::CustomResourcesProcessor;

/// Headroom that could not be computed.
pub const LIMIT_UNKNOWN: i64 = i64::MAX;

/// Resource name → headroom left. No entry means unlimited.
pub type Limits = BTreeMap<String, i64>;

/// Resource name → amount one node adds.
pub type Delta = BTreeMap<String, i64>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitsCheckResult {
    pub exceeded: bool,
    pub exceeded_resources: Vec<String>,
}

/// Whether adding `delta` would exceed any known limit.
pub fn check_delta_within_limits(left: &Limits, delta: &Delta) -> LimitsCheckResult {
    let exceeded_resources: Vec<String> = delta
        .iter()
        .filter(|(resource, amount)| {
            left.get(resource.as_str())
                .is_some_and(|&limit| **amount > 0 && (limit == LIMIT_UNKNOWN || **amount > limit))
        })
        .map(|(resource, _)| resource.clone())
        .collect();
    LimitsCheckResult {
        exceeded: !exceeded_resources.is_empty(),
        exceeded_resources,
    }
}

/// Whole cores and memory bytes of a node's capacity.
pub fn node_cores_and_memory(node: &Node) -> (i64, i64) {
    (
        millis_to_cores(node.capacity.cpu_millis()),
        node.capacity.memory_bytes().max(0),
    )
}

pub struct ResourceManager {
    custom_resources: Arc<dyn CustomResourcesProcessor>,
}

impl ResourceManager {
    pub fn new(custom_resources: Arc<dyn CustomResourcesProcessor>) -> Self {
        Self { custom_resources }
    }

    /// Resources one node created from `node_info` adds to the cluster.
    pub fn delta_for_node(
        &self,
        provider: &dyn CloudProvider,
        node_info: &NodeInfo,
        node_group: &dyn NodeGroup,
    ) -> AutoscalerResult<Delta> {
        let (cores, memory) = node_cores_and_memory(&node_info.node);
        let mut delta = Delta::new();
        delta.insert(RESOURCE_CORES.to_string(), cores);
        delta.insert(RESOURCE_MEMORY.to_string(), memory);

        let limiter = provider.resource_limiter().map_err(AutoscalerError::from)?;
        if limiter.has_custom_resources() {
            let targets = self
                .custom_resources
                .node_resource_targets(provider, &node_info.node, Some(node_group))
                .map_err(|e| {
                    AutoscalerError::from_error(ErrorKind::CloudProvider, e).add_prefix(format!(
                        "failed to get target custom resources for node group {}: ",
                        node_group.id()
                    ))
                })?;
            for target in targets {
                delta.insert(target.resource_type, target.resource_count);
            }
        }
        Ok(delta)
    }

    /// Headroom per limited resource: autoscaled groups count as
    /// target size times their template, other nodes count as they are.
    pub fn resources_left(
        &self,
        provider: &dyn CloudProvider,
        node_infos: &HashMap<String, NodeInfo>,
        nodes: &[Node],
    ) -> AutoscalerResult<Limits> {
        let limiter = provider.resource_limiter().map_err(AutoscalerError::from)?;
        let unmanaged = nodes_outside_node_groups(provider, nodes)?;
        let cores_memory = self.cores_memory_total(provider, node_infos, &unmanaged);
        let custom = if limiter.has_custom_resources() {
            Some(self.custom_resources_total(provider, node_infos, &unmanaged))
        } else {
            None
        };

        let mut left = Limits::new();
        for resource in limiter.resources() {
            let max = limiter.get_max(&resource);
            if max <= 0 {
                continue;
            }
            let value = match resource.as_str() {
                RESOURCE_CORES | RESOURCE_MEMORY => {
                    let (cores, memory) = match &cores_memory {
                        Ok(totals) => *totals,
                        Err(e) => return Err(e.clone()),
                    };
                    let total = if resource == RESOURCE_CORES { cores } else { memory };
                    (max - total).max(0)
                }
                _ => match &custom {
                    Some(Ok(totals)) => (max - totals.get(&resource).copied().unwrap_or(0)).max(0),
                    _ => LIMIT_UNKNOWN,
                },
            };
            left.insert(resource, value);
        }
        Ok(left)
    }

    /// Cap `new_count` so the added resources stay within `left`.
    pub fn apply_limits(
        &self,
        provider: &dyn CloudProvider,
        new_count: usize,
        left: &Limits,
        node_info: &NodeInfo,
        node_group: &dyn NodeGroup,
    ) -> AutoscalerResult<usize> {
        let delta = self.delta_for_node(provider, node_info, node_group)?;
        let mut count = i64::try_from(new_count).unwrap_or(i64::MAX);
        for (resource, per_node) in &delta {
            let Some(&limit) = left.get(resource) else {
                continue;
            };
            if limit == LIMIT_UNKNOWN {
                return Err(AutoscalerError::internal(format!(
                    "limit unknown for resource {resource}"
                )));
            }
            if *per_node <= 0 || count.saturating_mul(*per_node) <= limit {
                continue;
            }
            count = limit / per_node;
        }
        if count < 1 {
            return Err(AutoscalerError::internal("max resource limit reached"));
        }
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    fn cores_memory_total(
        &self,
        provider: &dyn CloudProvider,
        node_infos: &HashMap<String, NodeInfo>,
        unmanaged: &[&Node],
    ) -> AutoscalerResult<(i64, i64)> {
        let (mut cores, mut memory) = (0i64, 0i64);
        for group in provider.node_groups() {
            let size = group_size(group.as_ref())?;
            if size == 0 {
                continue;
            }
            let info = node_infos.get(&group.id()).ok_or_else(|| {
                AutoscalerError::cloud_provider(format!("no node info for: {}", group.id()))
            })?;
            let (node_cores, node_memory) = node_cores_and_memory(&info.node);
            cores += size * node_cores;
            memory += size * node_memory;
        }
        for node in unmanaged {
            let (node_cores, node_memory) = node_cores_and_memory(node);
            cores += node_cores;
            memory += node_memory;
        }
        Ok((cores, memory))
    }

    fn custom_resources_total(
        &self,
        provider: &dyn CloudProvider,
        node_infos: &HashMap<String, NodeInfo>,
        unmanaged: &[&Node],
    ) -> AutoscalerResult<BTreeMap<String, i64>> {
        let mut totals = BTreeMap::new();
        let mut add = |targets: Vec<crate::processors::CustomResourceTarget>, size: i64| {
            for target in targets {
                if target.resource_type.is_empty() || target.resource_count == 0 {
                    continue;
                }
                *totals.entry(target.resource_type).or_insert(0) += target.resource_count * size;
            }
        };
        for group in provider.node_groups() {
            let size = group_size(group.as_ref())?;
            if size == 0 {
                continue;
            }
            let info = node_infos.get(&group.id()).ok_or_else(|| {
                AutoscalerError::cloud_provider(format!("no node info for: {}", group.id()))
            })?;
            let targets = self
                .custom_resources
                .node_resource_targets(provider, &info.node, Some(group.as_ref()))
                .map_err(|e| {
                    e.add_prefix(format!("failed to get target gpu for node group {}: ", group.id()))
                })?;
            add(targets, size);
        }
        for node in unmanaged {
            let targets = self
                .custom_resources
                .node_resource_targets(provider, node, None)
                .map_err(|e| e.add_prefix(format!("failed to get target gpu for node {}: ", node.name)))?;
            add(targets, 1);
        }
        Ok(totals)
    }
}

fn group_size(group: &dyn NodeGroup) -> AutoscalerResult<i64> {
    let size = group.target_size().map_err(|e| {
        AutoscalerError::from_error(ErrorKind::CloudProvider, e)
            .add_prefix(format!("failed to get node group size of {}: ", group.id()))
    })?;
    Ok(i64::try_from(size).unwrap_or(i64::MAX))
}

fn nodes_outside_node_groups<'a>(
    provider: &dyn CloudProvider,
    nodes: &'a [Node],
) -> AutoscalerResult<Vec<&'a Node>> {
    let mut result = Vec::new();
    for node in nodes {
        match provider.node_group_for_node(node) {
            Ok(None) => result.push(node),
            Ok(Some(_)) => {}
            Err(e) => {
                error!(node = %node.name, error = %e, "failed to get node group for node");
                return Err(AutoscalerError::from_error(ErrorKind::CloudProvider, e));
            }
        }
    }
    Ok(result)
}
