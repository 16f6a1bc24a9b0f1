//! Per-group template node infos, preferring what real nodes look like.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use kubescale_cloud::{CloudProvider, CloudProviderError, NodeGroupRef};
use kubescale_core::{AutoscalerError, AutoscalerResult, DaemonSet, Node, NodeInfo, PodRef};
use kubescale_simulator::template::TO_BE_DELETED_TAINT;
use kubescale_simulator::{TaintConfig, sanitized_template_node_info};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedTemplate {
    info: NodeInfo,
    added: Instant,
}

/// Builds a template `NodeInfo` for every node group. Sources, in order:
/// a ready, schedulable node of the group; a cached template younger
/// than the TTL; the cloud provider's template; an unready node of the
/// group.
#[derive(Debug)]
pub struct TemplateNodeInfoCache {
    ttl: Duration,
    cache: HashMap<String, CachedTemplate>,
}

impl TemplateNodeInfoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: HashMap::new(),
        }
    }

    pub fn process(
        &mut self,
        provider: &dyn CloudProvider,
        nodes: &[Node],
        scheduled_pods: &[PodRef],
        daemon_sets: &[DaemonSet],
        taint_config: &TaintConfig,
        now: Instant,
    ) -> AutoscalerResult<HashMap<String, NodeInfo>> {
        let mut pods_by_node: HashMap<&str, Vec<PodRef>> = HashMap::new();
        for pod in scheduled_pods {
            if let Some(node_name) = pod.spec.node_name.as_deref() {
                pods_by_node.entry(node_name).or_default().push(pod.clone());
            }
        }
        let base_info = |node: &Node| {
            NodeInfo::with_pods(
                node.clone(),
                pods_by_node.get(node.name.as_str()).into_iter().flatten().cloned(),
            )
        };

        let mut result: HashMap<String, NodeInfo> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        for node in nodes.iter().filter(|n| is_usable_template_source(n)) {
            let Some(group) = group_for_node(provider, node)? else {
                continue;
            };
            let id = group.id();
            if !seen.insert(id.clone()) {
                continue;
            }
            let info = sanitized_template_node_info(&base_info(node), &id, daemon_sets, taint_config);
            self.cache.insert(
                id.clone(),
                CachedTemplate {
                    info: info.clone(),
                    added: now,
                },
            );
            debug!(node_group = %id, node = %node.name, "template built from live node");
            result.insert(id, info);
        }

        let groups = provider.node_groups();
        for group in &groups {
            let id = group.id();
            if seen.contains(&id) {
                continue;
            }
            if let Some(cached) = self.cache.get(&id) {
                if now.duration_since(cached.added) < self.ttl {
                    result.insert(id, cached.info.clone());
                    continue;
                }
            }
            match group.template_node_info() {
                Ok(base) => {
                    let info = sanitized_template_node_info(&base, &id, daemon_sets, taint_config);
                    result.insert(id, info);
                }
                Err(CloudProviderError::NotImplemented) => {
                    debug!(node_group = %id, "provider has no template for node group");
                }
                Err(err) => {
                    return Err(AutoscalerError::from(err).add_prefix(format!(
                        "failed to obtain template for node group {id}: "
                    )));
                }
            }
        }

        for node in nodes.iter().filter(|n| !n.ready) {
            let Some(group) = group_for_node(provider, node)? else {
                continue;
            };
            let id = group.id();
            if result.contains_key(&id) {
                continue;
            }
            warn!(node_group = %id, node = %node.name, "falling back to unready node as template");
            let info = sanitized_template_node_info(&base_info(node), &id, daemon_sets, taint_config);
            result.insert(id, info);
        }

        let live: HashSet<String> = groups.iter().map(|g| g.id()).collect();
        self.cache.retain(|id, _| live.contains(id));
        Ok(result)
    }

    pub fn cached_groups(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn is_usable_template_source(node: &Node) -> bool {
    node.ready && !node.unschedulable && !node.taints.iter().any(|t| t.key == TO_BE_DELETED_TAINT)
}

fn group_for_node(provider: &dyn CloudProvider, node: &Node) -> AutoscalerResult<Option<NodeGroupRef>> {
    provider
        .node_group_for_node(node)
        .map_err(|e| AutoscalerError::from(e).add_prefix(format!("failed to get node group for {}: ", node.name)))
}
