//! First-fit bin-packing on template copies.

use std::collections::HashSet;
use std::sync::Arc;

use kubescale_cloud::NodeGroup;
use kubescale_core::{NodeInfo, PodRef};
use tracing::{debug, warn};

use super::limiter::EstimationLimiter;
use super::orderer::PodOrderer;
use super::{Estimate, EstimationContext, Estimator};
use crate::predicates::PredicateChecker;
use crate::snapshot::{ClusterSnapshot, ForkGuard, SnapshotResult};
use crate::template::node_info_copy;

/// Packs pods onto new copies of the template, one node at a time. Pods
/// first try the nodes already added; a new node is only added while the
/// limiter allows it, and never after a fresh node stayed empty.
pub struct BinpackingEstimator {
    predicate_checker: Arc<dyn PredicateChecker>,
    limiter: Box<dyn EstimationLimiter>,
    orderer: Box<dyn PodOrderer>,
    context: EstimationContext,
}

#[derive(Default)]
struct EstimationState {
    new_node_names: HashSet<String>,
    new_nodes_with_pods: HashSet<String>,
    last_node_name: Option<String>,
    next_index: usize,
    scheduled: Vec<PodRef>,
}

impl BinpackingEstimator {
    pub fn new(
        predicate_checker: Arc<dyn PredicateChecker>,
        limiter: Box<dyn EstimationLimiter>,
        orderer: Box<dyn PodOrderer>,
        context: EstimationContext,
    ) -> Self {
        Self {
            predicate_checker,
            limiter,
            orderer,
            context,
        }
    }

    /// Schedule a prefix of `pods` on the new nodes added so far; returns
    /// the pods that did not fit.
    fn schedule_on_existing_nodes<'p>(
        &self,
        snapshot: &mut dyn ClusterSnapshot,
        state: &mut EstimationState,
        pods: &'p [PodRef],
    ) -> SnapshotResult<&'p [PodRef]> {
        for (index, pod) in pods.iter().enumerate() {
            let new_nodes = &state.new_node_names;
            let fit = self.predicate_checker.fits_any_node_matching(
                &*snapshot,
                pod,
                &|info: &NodeInfo| new_nodes.contains(info.name()),
            );
            match fit {
                Ok(node_name) => {
                    snapshot.add_pod(pod.clone(), &node_name)?;
                    state.scheduled.push(pod.clone());
                    state.new_nodes_with_pods.insert(node_name);
                }
                Err(_) => return Ok(&pods[index..]),
            }
        }
        Ok(&[])
    }

    fn schedule_on_new_nodes(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        state: &mut EstimationState,
        template: &NodeInfo,
        pods: &[PodRef],
    ) -> SnapshotResult<()> {
        for pod in pods {
            if let Some(last) = &state.last_node_name
                && self
                    .predicate_checker
                    .check_predicates(&*snapshot, pod, last)
                    .is_ok()
            {
                let last = last.clone();
                snapshot.add_pod(pod.clone(), &last)?;
                state.scheduled.push(pod.clone());
                state.new_nodes_with_pods.insert(last);
                continue;
            }

            // A pod that did not fit on an empty template copy will not fit
            // on another one.
            if let Some(last) = &state.last_node_name
                && !state.new_nodes_with_pods.contains(last)
            {
                break;
            }
            if !self.limiter.permission_to_add_node() {
                break;
            }

            state.next_index += 1;
            let name = format!("{}-e-{}", template.name(), state.next_index);
            snapshot.add_node_info(node_info_copy(template, &name))?;
            state.new_node_names.insert(name.clone());
            state.last_node_name = Some(name.clone());

            if self
                .predicate_checker
                .check_predicates(&*snapshot, pod, &name)
                .is_err()
            {
                break;
            }
            snapshot.add_pod(pod.clone(), &name)?;
            state.scheduled.push(pod.clone());
            state.new_nodes_with_pods.insert(name);
        }
        Ok(())
    }
}

impl Estimator for BinpackingEstimator {
    fn estimate(
        &mut self,
        snapshot: &mut dyn ClusterSnapshot,
        pod_groups: &[Vec<PodRef>],
        template: &NodeInfo,
        node_group: &dyn NodeGroup,
    ) -> Estimate {
        self.limiter.start_estimation(node_group, &self.context);
        let ordered = self.orderer.order(pod_groups, template);

        let mut state = EstimationState::default();
        {
            let mut guard = ForkGuard::new(snapshot);
            for group in &ordered {
                let remaining = match self.schedule_on_existing_nodes(&mut *guard, &mut state, group) {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        warn!(node_group = %node_group.id(), error = %e, "estimation stopped");
                        break;
                    }
                };
                if let Err(e) = self.schedule_on_new_nodes(&mut *guard, &mut state, template, remaining) {
                    warn!(node_group = %node_group.id(), error = %e, "estimation stopped");
                    break;
                }
            }
        }
        self.limiter.end_estimation();

        let estimate = Estimate {
            node_count: state.new_nodes_with_pods.len(),
            pods: state.scheduled,
        };
        debug!(
            node_group = %node_group.id(),
            nodes = estimate.node_count,
            pods = estimate.pods.len(),
            "binpacking estimate"
        );
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::limiter::{StaticThreshold, ThresholdBasedEstimationLimiter};
    use crate::estimator::orderer::DecreasingPodOrderer;
    use crate::predicates::SchedulerPredicateChecker;
    use crate::snapshot::BasicClusterSnapshot;
    use kubescale_cloud::{TestCloudProvider, TestNodeGroupSpec};
    use kubescale_core::resources::PODS;
    use kubescale_core::{Container, Node, Pod, PodSpec, ResourceList};
    use std::time::Duration;

    fn pod(uid: &str, cpu: i64) -> PodRef {
        Arc::new(Pod {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: uid.to_string(),
            spec: PodSpec {
                containers: vec![Container {
                    name: "c".to_string(),
                    requests: ResourceList::new().with(kubescale_core::resources::CPU, cpu),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn template(cpu: i64) -> NodeInfo {
        NodeInfo::new(Node::new(
            "template",
            ResourceList::cpu_memory(cpu, 1000).with(PODS, 110),
        ))
    }

    fn estimator(max_nodes: usize) -> BinpackingEstimator {
        BinpackingEstimator::new(
            Arc::new(SchedulerPredicateChecker::new()),
            Box::new(ThresholdBasedEstimationLimiter::new(vec![Box::new(
                StaticThreshold::new(max_nodes, Duration::ZERO),
            )])),
            Box::new(DecreasingPodOrderer),
            EstimationContext::default(),
        )
    }

    fn group_of(prefix: &str, n: usize, cpu: i64) -> Vec<PodRef> {
        (0..n).map(|i| pod(&format!("{prefix}-{i}"), cpu)).collect()
    }

    #[test]
    fn packs_pods_per_node() {
        let provider = TestCloudProvider::new();
        let group = provider.add_node_group(TestNodeGroupSpec::new("ng", 0, 100, 0));
        let mut snapshot = BasicClusterSnapshot::new();

        let estimate = estimator(0).estimate(
            &mut snapshot,
            &[group_of("web", 10, 300)],
            &template(1000),
            group.as_ref(),
        );
        // three 300m pods per 1000m node
        assert_eq!(estimate.node_count, 4);
        assert_eq!(estimate.pods.len(), 10);
        assert_eq!(snapshot.node_count(), 0);
        assert_eq!(snapshot.depth(), 0);
    }

    #[test]
    fn mixed_groups_share_nodes() {
        let provider = TestCloudProvider::new();
        let group = provider.add_node_group(TestNodeGroupSpec::new("ng", 0, 100, 0));
        let mut snapshot = BasicClusterSnapshot::new();

        let estimate = estimator(0).estimate(
            &mut snapshot,
            &[group_of("small", 2, 200), group_of("big", 2, 600)],
            &template(1000),
            group.as_ref(),
        );
        assert_eq!(estimate.node_count, 2);
        assert_eq!(estimate.pods.len(), 4);
        assert_eq!(estimate.pods[0].uid, "big-0");
    }

    #[test]
    fn limiter_caps_nodes() {
        let provider = TestCloudProvider::new();
        let group = provider.add_node_group(TestNodeGroupSpec::new("ng", 0, 100, 0));
        let mut snapshot = BasicClusterSnapshot::new();

        let estimate = estimator(2).estimate(
            &mut snapshot,
            &[group_of("web", 11, 1000)],
            &template(1000),
            group.as_ref(),
        );
        assert_eq!(estimate.node_count, 2);
        assert_eq!(estimate.pods.len(), 2);
    }

    #[test]
    fn oversized_pod_adds_no_node() {
        let provider = TestCloudProvider::new();
        let group = provider.add_node_group(TestNodeGroupSpec::new("ng", 0, 100, 0));
        let mut snapshot = BasicClusterSnapshot::new();

        let estimate = estimator(0).estimate(
            &mut snapshot,
            &[group_of("huge", 3, 5000)],
            &template(1000),
            group.as_ref(),
        );
        assert_eq!(estimate.node_count, 0);
        assert!(estimate.pods.is_empty());
    }
}
