//! Expansion options and the strategies that pick one.

use std::collections::HashMap;
use std::fmt;

use kubescale_cloud::NodeGroupRef;
use kubescale_core::{ConfigError, NodeInfo, PodRef};
use tracing::warn;

pub const MOST_PODS: &str = "most-pods";
pub const LEAST_WASTE: &str = "least-waste";
pub const LEAST_NODES: &str = "least-nodes";

/// A candidate scale-up: grow `node_group` by `node_count` nodes to hold
/// `pods`.
#[derive(Clone)]
pub struct ExpansionOption {
    pub node_group: NodeGroupRef,
    pub node_count: usize,
    pub pods: Vec<PodRef>,
    /// Groups the scale-up may be balanced across.
    pub similar_node_groups: Vec<NodeGroupRef>,
    pub debug: Option<String>,
}

impl fmt::Debug for ExpansionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpansionOption")
            .field("node_group", &self.node_group.id())
            .field("node_count", &self.node_count)
            .field("pods", &self.pods.len())
            .field(
                "similar_node_groups",
                &self
                    .similar_node_groups
                    .iter()
                    .map(|g| g.id())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Picks the best option, or none when `options` is empty.
pub trait Strategy: Send + Sync {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption>;
}

pub fn strategy_from_name(name: &str) -> Result<Box<dyn Strategy>, ConfigError> {
    match name {
        MOST_PODS => Ok(Box::new(MostPods)),
        LEAST_WASTE => Ok(Box::new(LeastWaste)),
        LEAST_NODES => Ok(Box::new(LeastNodes)),
        other => Err(ConfigError::Invalid(format!("unknown expander {other:?}"))),
    }
}

/// The option with the lowest score; ties go to the smallest group id.
fn min_by_score<F>(options: &[ExpansionOption], mut score: F) -> Option<ExpansionOption>
where
    F: FnMut(&ExpansionOption) -> Option<f64>,
{
    let mut best: Option<(f64, &ExpansionOption)> = None;
    for option in options {
        let Some(s) = score(option) else {
            continue;
        };
        best = match best {
            Some((best_score, current))
                if best_score < s
                    || (best_score == s && current.node_group.id() <= option.node_group.id()) =>
            {
                Some((best_score, current))
            }
            _ => Some((s, option)),
        };
    }
    best.map(|(_, option)| option.clone())
}

/// Prefers the option that schedules the most pods.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostPods;

impl Strategy for MostPods {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        _node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        min_by_score(options, |o| Some(-(o.pods.len() as f64)))
    }
}

/// Prefers the option needing the fewest new nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastNodes;

impl Strategy for LeastNodes {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        _node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        min_by_score(options, |o| Some(o.node_count as f64))
    }
}

/// Prefers the option leaving the least cpu and memory idle on the new
/// nodes. Options without a template node info are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastWaste;

impl LeastWaste {
    fn wasted_score(option: &ExpansionOption, info: &NodeInfo) -> f64 {
        let (requested_cpu, requested_memory) =
            option.pods.iter().fold((0i64, 0i64), |(cpu, memory), pod| {
                let requests = pod.requests();
                (cpu + requests.cpu_millis(), memory + requests.memory_bytes())
            });
        let count = option.node_count as i64;
        let available_cpu = info.node.capacity.cpu_millis() * count;
        let available_memory = info.node.capacity.memory_bytes() * count;
        waste(available_cpu, requested_cpu) + waste(available_memory, requested_memory)
    }
}

fn waste(available: i64, requested: i64) -> f64 {
    if available <= 0 {
        return 0.0;
    }
    (available - requested) as f64 / available as f64
}

impl Strategy for LeastWaste {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        min_by_score(options, |option| {
            let id = option.node_group.id();
            match node_infos.get(&id) {
                Some(info) => Some(Self::wasted_score(option, info)),
                None => {
                    warn!(node_group = %id, "no node info for expansion option");
                    None
                }
            }
        })
    }
}
