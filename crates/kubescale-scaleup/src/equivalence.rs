//! Grouping of unschedulable pods whose scheduling requirements are
//! indistinguishable, so each group is simulated once via its exemplar.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kubescale_core::{Pod, PodRef};

use crate::reasons::Reasons;

/// Distinct representatives kept per controller. Pods past the cap that
/// match none of them are simulated individually.
pub const MAX_GROUPS_PER_CONTROLLER: usize = 10;

#[derive(Debug, Clone)]
pub struct PodEquivalenceGroup {
    /// Never empty; the first pod is the exemplar.
    pub pods: Vec<PodRef>,
    /// Node group id → why the exemplar does not fit there.
    pub scheduling_errors: BTreeMap<String, Reasons>,
    /// Node groups the exemplar was shown to fit on.
    pub schedulable_groups: BTreeSet<String>,
    pub schedulable: bool,
}

impl PodEquivalenceGroup {
    fn new(pod: PodRef) -> Self {
        Self {
            pods: vec![pod],
            scheduling_errors: BTreeMap::new(),
            schedulable_groups: BTreeSet::new(),
            schedulable: false,
        }
    }

    pub fn exemplar(&self) -> &PodRef {
        &self.pods[0]
    }

    pub fn mark_schedulable_on(&mut self, node_group: &str) {
        self.schedulable_groups.insert(node_group.to_string());
        self.schedulable = true;
    }

    pub fn mark_rejected_by(&mut self, node_group: &str, reasons: Reasons) {
        self.scheduling_errors.insert(node_group.to_string(), reasons);
    }
}

/// Partition `pods` into equivalence groups, ordered by first appearance.
pub fn build_pod_equivalence_groups(pods: &[PodRef]) -> Vec<PodEquivalenceGroup> {
    let mut groups: Vec<PodEquivalenceGroup> = Vec::new();
    let mut representatives: HashMap<&str, Vec<usize>> = HashMap::new();

    for pod in pods {
        let owner = match pod.controller_ref() {
            Some(owner) if !pod.is_daemon_set_pod() => owner,
            _ => {
                groups.push(PodEquivalenceGroup::new(pod.clone()));
                continue;
            }
        };
        let reps = representatives.entry(owner.uid.as_str()).or_default();
        if let Some(&index) = reps
            .iter()
            .find(|&&index| equivalent(groups[index].exemplar(), pod))
        {
            groups[index].pods.push(pod.clone());
            continue;
        }
        if reps.len() < MAX_GROUPS_PER_CONTROLLER {
            reps.push(groups.len());
        }
        groups.push(PodEquivalenceGroup::new(pod.clone()));
    }
    groups
}

fn equivalent(a: &Pod, b: &Pod) -> bool {
    a.labels == b.labels && a.spec.semantically_equal(&b.spec)
}

/// Mark every schedulable group as rejected with `reason` by each node
/// group it fit on.
pub fn mark_all_unschedulable(groups: &mut [PodEquivalenceGroup], reason: &Reasons) {
    for group in groups.iter_mut().filter(|g| g.schedulable) {
        let ids: Vec<String> = group.schedulable_groups.iter().cloned().collect();
        for id in ids {
            group.scheduling_errors.insert(id, reason.clone());
        }
        group.schedulable = false;
    }
}
