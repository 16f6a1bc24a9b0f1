//! Scheduling predicates.
//!
//! A small, deterministic subset of the scheduler's filter plugins: the
//! ones whose outcome depends on the node template rather than on live
//! cluster state.

use std::collections::HashSet;

use kubescale_core::labels::HOSTNAME;
use kubescale_core::resources::PODS;
use kubescale_core::{NodeInfo, Pod};
use thiserror::Error;

use crate::snapshot::ClusterSnapshot;

pub const NODE_UNSCHEDULABLE: &str = "NodeUnschedulable";
pub const NODE_RESOURCES_FIT: &str = "NodeResourcesFit";
pub const NODE_AFFINITY: &str = "NodeAffinity";
pub const TAINT_TOLERATION: &str = "TaintToleration";
pub const NODE_PORTS: &str = "NodePorts";
pub const INTER_POD_AFFINITY: &str = "InterPodAffinity";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// The pod does not fit; `reasons` are user-facing.
    #[error("{predicate} predicate mismatch, reasons: {}", reasons.join(", "))]
    FailingPredicate {
        predicate: String,
        reasons: Vec<String>,
    },

    #[error("node {0} not found in snapshot")]
    NodeNotFound(String),

    #[error("pod {0} does not fit on any matching node")]
    NoMatchingNode(String),
}

impl SchedulingError {
    fn failing(predicate: &str, reason: impl Into<String>) -> Self {
        SchedulingError::FailingPredicate {
            predicate: predicate.to_string(),
            reasons: vec![reason.into()],
        }
    }

    /// User-facing reasons the pod was rejected.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            SchedulingError::FailingPredicate { reasons, .. } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Answers "can this pod be scheduled on that node?".
pub trait PredicateChecker: Send + Sync {
    fn check_predicates(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), SchedulingError>;

    /// Name of the first node (by name order) accepted by `filter` that
    /// fits `pod`.
    fn fits_any_node_matching(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        filter: &dyn Fn(&NodeInfo) -> bool,
    ) -> Result<String, SchedulingError> {
        for info in snapshot.node_infos() {
            if !filter(info) {
                continue;
            }
            if self.check_predicates(snapshot, pod, info.name()).is_ok() {
                return Ok(info.name().to_string());
            }
        }
        Err(SchedulingError::NoMatchingNode(pod.key()))
    }
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerPredicateChecker;

impl SchedulerPredicateChecker {
    pub fn new() -> Self {
        Self
    }
}

impl PredicateChecker for SchedulerPredicateChecker {
    fn check_predicates(
        &self,
        snapshot: &dyn ClusterSnapshot,
        pod: &Pod,
        node_name: &str,
    ) -> Result<(), SchedulingError> {
        let info = snapshot
            .get_node_info(node_name)
            .ok_or_else(|| SchedulingError::NodeNotFound(node_name.to_string()))?;
        check_unschedulable(pod, info)?;
        check_node_affinity(pod, info)?;
        check_taints(pod, info)?;
        check_resources(pod, info)?;
        check_ports(pod, info)?;
        check_anti_affinity(snapshot, pod, info)?;
        Ok(())
    }
}

fn check_unschedulable(pod: &Pod, info: &NodeInfo) -> Result<(), SchedulingError> {
    if !info.node.unschedulable {
        return Ok(());
    }
    let tolerated = pod
        .spec
        .tolerations
        .iter()
        .any(|t| t.key == "node.kubernetes.io/unschedulable" || t.key.is_empty());
    if tolerated {
        Ok(())
    } else {
        Err(SchedulingError::failing(
            NODE_UNSCHEDULABLE,
            "node(s) were unschedulable",
        ))
    }
}

fn check_node_affinity(pod: &Pod, info: &NodeInfo) -> Result<(), SchedulingError> {
    let labels = &info.node.labels;
    let selector_ok = pod
        .spec
        .node_selector
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v));
    let affinity_ok = pod
        .spec
        .affinity
        .required_node_affinity
        .iter()
        .all(|req| req.matches(labels));
    if selector_ok && affinity_ok {
        Ok(())
    } else {
        Err(SchedulingError::failing(
            NODE_AFFINITY,
            "node(s) didn't match Pod's node affinity/selector",
        ))
    }
}

fn check_taints(pod: &Pod, info: &NodeInfo) -> Result<(), SchedulingError> {
    for taint in info.node.taints.iter().filter(|t| t.blocks_scheduling()) {
        if !pod.spec.tolerations.iter().any(|t| t.tolerates(taint)) {
            return Err(SchedulingError::failing(
                TAINT_TOLERATION,
                format!(
                    "node(s) had untolerated taint {{{}: {}}}",
                    taint.key, taint.value
                ),
            ));
        }
    }
    Ok(())
}

fn check_resources(pod: &Pod, info: &NodeInfo) -> Result<(), SchedulingError> {
    let allocatable = &info.node.allocatable;
    let mut insufficient = Vec::new();

    if allocatable.contains(PODS) && info.requested.get(PODS) + 1 > allocatable.get(PODS) {
        insufficient.push("Too many pods".to_string());
    }
    for (name, request) in pod.requests().iter() {
        if request <= 0 || name == PODS {
            continue;
        }
        let free = allocatable.get(name) - info.requested.get(name);
        if request > free {
            insufficient.push(format!("Insufficient {name}"));
        }
    }
    if insufficient.is_empty() {
        Ok(())
    } else {
        Err(SchedulingError::FailingPredicate {
            predicate: NODE_RESOURCES_FIT.to_string(),
            reasons: insufficient,
        })
    }
}

fn check_ports(pod: &Pod, info: &NodeInfo) -> Result<(), SchedulingError> {
    let wanted = pod.host_ports();
    if wanted.is_empty() {
        return Ok(());
    }
    let used: HashSet<(String, u16)> = info.pods.iter().flat_map(|p| p.host_ports()).collect();
    if wanted.is_disjoint(&used) {
        Ok(())
    } else {
        Err(SchedulingError::failing(
            NODE_PORTS,
            "node(s) didn't have free ports for the requested pod ports",
        ))
    }
}

/// Required anti-affinity in both directions: the incoming pod's terms
/// against pods already in the topology domain, and existing pods' terms
/// against the incoming pod.
fn check_anti_affinity(
    snapshot: &dyn ClusterSnapshot,
    pod: &Pod,
    info: &NodeInfo,
) -> Result<(), SchedulingError> {
    let violated = || {
        SchedulingError::failing(
            INTER_POD_AFFINITY,
            "node(s) didn't match pod anti-affinity rules",
        )
    };

    for term in &pod.spec.affinity.pod_anti_affinity {
        let conflict = nodes_in_domain(snapshot, info, &term.topology_key)
            .iter()
            .flat_map(|n| n.pods.iter())
            .any(|existing| existing.namespace == pod.namespace && term.selects(existing));
        if conflict {
            return Err(violated());
        }
    }

    for other in snapshot.node_infos() {
        for existing in &other.pods {
            for term in &existing.spec.affinity.pod_anti_affinity {
                if existing.namespace != pod.namespace || !term.selects(pod) {
                    continue;
                }
                let same_domain = match term.topology_key.as_str() {
                    HOSTNAME => other.name() == info.name(),
                    key => match (info.node.labels.get(key), other.node.labels.get(key)) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    },
                };
                if same_domain {
                    return Err(violated());
                }
            }
        }
    }
    Ok(())
}

/// Nodes sharing `info`'s value for `topology_key`.
fn nodes_in_domain<'a>(
    snapshot: &'a dyn ClusterSnapshot,
    info: &'a NodeInfo,
    topology_key: &str,
) -> Vec<&'a NodeInfo> {
    if topology_key == HOSTNAME {
        return vec![info];
    }
    match info.node.labels.get(topology_key) {
        Some(value) => snapshot
            .node_infos()
            .into_iter()
            .filter(|other| other.node.labels.get(topology_key) == Some(value))
            .collect(),
        None => Vec::new(),
    }
}
