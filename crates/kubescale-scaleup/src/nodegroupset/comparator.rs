//! Node-info similarity used to decide which groups to balance across.

use std::collections::{BTreeMap, HashSet};

use kubescale_core::labels::{
    HOSTNAME, TOPOLOGY_REGION, TOPOLOGY_ZONE, ZONE_FAILURE_DOMAIN_BETA, ZONE_REGION_BETA,
};
use kubescale_core::resources::MEMORY;
use kubescale_core::{AutoscalingOptions, NodeInfo, ResourceList};

/// Labels that differ between otherwise identical groups.
pub const BASIC_IGNORED_LABELS: &[&str] = &[
    HOSTNAME,
    TOPOLOGY_ZONE,
    TOPOLOGY_REGION,
    ZONE_FAILURE_DOMAIN_BETA,
    ZONE_REGION_BETA,
    "beta.kubernetes.io/fluentd-ds-ready",
    "kops.k8s.io/instancegroup",
];

/// Relative differences tolerated between two similar templates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferenceRatios {
    pub max_allocatable: f64,
    pub max_free: f64,
    pub max_capacity_memory: f64,
}

impl Default for DifferenceRatios {
    fn default() -> Self {
        Self {
            max_allocatable: 0.05,
            max_free: 0.05,
            max_capacity_memory: 0.015,
        }
    }
}

pub trait NodeInfoComparator: Send + Sync {
    fn similar(&self, a: &NodeInfo, b: &NodeInfo) -> bool;
}

/// Capacity must match exactly (memory within a small ratio), allocatable
/// and free resources within a few percent, labels equal apart from the
/// ignored ones.
#[derive(Debug, Clone)]
pub struct GenericNodeInfoComparator {
    ignored_labels: HashSet<String>,
    ratios: DifferenceRatios,
}

impl GenericNodeInfoComparator {
    pub fn new(extra_ignored_labels: &[String], ratios: DifferenceRatios) -> Self {
        let ignored_labels = BASIC_IGNORED_LABELS
            .iter()
            .map(|l| l.to_string())
            .chain(extra_ignored_labels.iter().cloned())
            .collect();
        Self {
            ignored_labels,
            ratios,
        }
    }
}

impl Default for GenericNodeInfoComparator {
    fn default() -> Self {
        Self::new(&[], DifferenceRatios::default())
    }
}

impl NodeInfoComparator for GenericNodeInfoComparator {
    fn similar(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        let capacity = collect([&a.node.capacity, &b.node.capacity]);
        let allocatable = collect([&a.node.allocatable, &b.node.allocatable]);
        let frees = [a.free(), b.free()];
        let free = collect([&frees[0], &frees[1]]);

        for (name, values) in &capacity {
            let ok = if *name == MEMORY {
                within_tolerance(values, self.ratios.max_capacity_memory)
            } else {
                values.len() == 2 && values[0] == values[1]
            };
            if !ok {
                return false;
            }
        }
        all_within_tolerance(&allocatable, self.ratios.max_allocatable)
            && all_within_tolerance(&free, self.ratios.max_free)
            && labels_match(a, b, |label| !self.ignored_labels.contains(label))
    }
}

/// Similar when every one of `labels` is present on both with equal values.
#[derive(Debug, Clone)]
pub struct LabelNodeInfoComparator {
    labels: Vec<String>,
}

impl LabelNodeInfoComparator {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl NodeInfoComparator for LabelNodeInfoComparator {
    fn similar(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        self.labels.iter().all(|label| {
            match (a.node.labels.get(label), b.node.labels.get(label)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        })
    }
}

/// `balancing_labels` selects the label comparator, otherwise the generic
/// one with the extra ignored labels.
pub fn comparator_from_options(options: &AutoscalingOptions) -> Box<dyn NodeInfoComparator> {
    if options.balancing_labels.is_empty() {
        Box::new(GenericNodeInfoComparator::new(
            &options.balancing_extra_ignored_labels,
            DifferenceRatios::default(),
        ))
    } else {
        Box::new(LabelNodeInfoComparator::new(options.balancing_labels.clone()))
    }
}

fn collect<'a>(lists: [&'a ResourceList; 2]) -> BTreeMap<&'a str, Vec<i64>> {
    let mut out: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for list in lists {
        for (name, value) in list.iter() {
            out.entry(name).or_default().push(value);
        }
    }
    out
}

fn within_tolerance(values: &[i64], ratio: f64) -> bool {
    if values.len() != 2 {
        return false;
    }
    let (x, y) = (values[0] as f64, values[1] as f64);
    let larger = x.max(y);
    let smaller = x.min(y);
    larger - smaller <= larger * ratio
}

fn all_within_tolerance(resources: &BTreeMap<&str, Vec<i64>>, ratio: f64) -> bool {
    resources.values().all(|values| within_tolerance(values, ratio))
}

fn labels_match(a: &NodeInfo, b: &NodeInfo, considered: impl Fn(&str) -> bool) -> bool {
    let keys: HashSet<&str> = a
        .node
        .labels
        .keys()
        .chain(b.node.labels.keys())
        .map(String::as_str)
        .filter(|k| considered(k))
        .collect();
    keys.into_iter()
        .all(|k| matches!((a.node.labels.get(k), b.node.labels.get(k)), (Some(x), Some(y)) if x == y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubescale_core::resources::{CPU, NVIDIA_GPU};
    use kubescale_core::Node;

    const GIB: i64 = 1 << 30;

    fn info(name: &str, cpu: i64, memory: i64) -> NodeInfo {
        NodeInfo::new(Node::new(name, ResourceList::cpu_memory(cpu, memory)))
    }

    #[test]
    fn identical_templates_in_different_zones_are_similar() {
        let mut a = info("a", 4000, 16 * GIB);
        let mut b = info("b", 4000, 16 * GIB);
        a.node.labels.insert(TOPOLOGY_ZONE.to_string(), "zone-a".to_string());
        b.node.labels.insert(TOPOLOGY_ZONE.to_string(), "zone-b".to_string());
        assert!(GenericNodeInfoComparator::default().similar(&a, &b));
    }

    #[test]
    fn cpu_capacity_must_match_exactly() {
        let a = info("a", 4000, 16 * GIB);
        let b = info("b", 4001, 16 * GIB);
        assert!(!GenericNodeInfoComparator::default().similar(&a, &b));
    }

    #[test]
    fn memory_capacity_within_ratio() {
        let a = info("a", 4000, 1000 * GIB);
        let close = info("b", 4000, 990 * GIB);
        let far = info("c", 4000, 900 * GIB);
        let comparator = GenericNodeInfoComparator::default();
        assert!(comparator.similar(&a, &close));
        assert!(!comparator.similar(&a, &far));
    }

    #[test]
    fn extra_resources_break_similarity() {
        let a = info("a", 4000, 16 * GIB);
        let mut b = info("b", 4000, 16 * GIB);
        b.node.capacity.set(NVIDIA_GPU, 1);
        assert!(!GenericNodeInfoComparator::default().similar(&a, &b));
    }

    #[test]
    fn custom_labels_must_match_unless_ignored() {
        let mut a = info("a", 4000, 16 * GIB);
        let mut b = info("b", 4000, 16 * GIB);
        a.node.labels.insert("pool".to_string(), "blue".to_string());
        b.node.labels.insert("pool".to_string(), "green".to_string());
        assert!(!GenericNodeInfoComparator::default().similar(&a, &b));
        let lenient = GenericNodeInfoComparator::new(&["pool".to_string()], DifferenceRatios::default());
        assert!(lenient.similar(&a, &b));
    }

    #[test]
    fn free_resources_compared_with_tolerance() {
        let mut a = info("a", 4000, 16 * GIB);
        let b = info("b", 4000, 16 * GIB);
        a.requested.set(CPU, 1000);
        let mut c = b.clone();
        c.requested.set(CPU, 1000);
        let comparator = GenericNodeInfoComparator::default();
        assert!(!comparator.similar(&a, &b));
        assert!(comparator.similar(&a, &c));
    }

    #[test]
    fn label_comparator_only_checks_listed_labels() {
        let mut a = info("a", 2000, GIB);
        let mut b = info("b", 8000, 4 * GIB);
        a.node.labels.insert("pool".to_string(), "batch".to_string());
        b.node.labels.insert("pool".to_string(), "batch".to_string());
        let comparator = LabelNodeInfoComparator::new(vec!["pool".to_string()]);
        assert!(comparator.similar(&a, &b));
        b.node.labels.remove("pool");
        assert!(!comparator.similar(&a, &b));
    }
}
