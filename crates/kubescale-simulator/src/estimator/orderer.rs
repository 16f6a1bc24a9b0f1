//! Ordering of pod groups before bin-packing.

use std::cmp::Ordering;

use kubescale_core::resources::{CPU, MEMORY};
use kubescale_core::{NodeInfo, PodRef};

pub trait PodOrderer: Send + Sync {
    fn order(&self, pod_groups: &[Vec<PodRef>], template: &NodeInfo) -> Vec<Vec<PodRef>>;
}

/// Largest pods first, scored by the exemplar's cpu and memory requests
/// relative to the template's allocatable. Ties keep input order.
#[derive(Debug, Clone, Default)]
pub struct DecreasingPodOrderer;

impl DecreasingPodOrderer {
    fn score(pod: &PodRef, template: &NodeInfo) -> f64 {
        let requests = pod.requests();
        let allocatable = &template.node.allocatable;
        [CPU, MEMORY]
            .iter()
            .filter(|r| allocatable.get(r) > 0)
            .map(|r| requests.get(r) as f64 / allocatable.get(r) as f64)
            .sum()
    }
}

impl PodOrderer for DecreasingPodOrderer {
    fn order(&self, pod_groups: &[Vec<PodRef>], template: &NodeInfo) -> Vec<Vec<PodRef>> {
        let mut scored: Vec<(f64, &Vec<PodRef>)> = pod_groups
            .iter()
            .filter_map(|group| group.first().map(|p| (Self::score(p, template), group)))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.into_iter().map(|(_, g)| g.clone()).collect()
    }
}
