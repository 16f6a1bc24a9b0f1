//! The scale-up orchestrator.
//!
//! One [`ScaleUpOrchestrator::scale_up`] call turns a batch of
//! unschedulable pods into at most one scale-up decision:
//!
//! ```text
//! pods ──► equivalence groups ──► filter node groups ──► fit exemplars
//!                                                            │
//!   execute ◄── balance ◄── limits ◄── create ◄── expander ◄─┘ estimate
//! ```
//!
//! Every outcome is reported as a [`ScaleUpStatus`]; failures carry their
//! error in `scale_up_error` next to whatever partial state was reached.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use kubescale_cloud::{CloudProvider, NodeGroupRef, RESOURCE_CORES, RESOURCE_MEMORY};
use kubescale_clusterstate::ClusterStateRegistry;
use kubescale_core::events::AUTOSCALER_OBJECT;
use kubescale_core::{AutoscalerError, AutoscalerResult, DaemonSet, Node, NodeInfo, PodRef};
use kubescale_metrics::FunctionLabel;
use kubescale_simulator::{EstimationContext, EstimatorBuilder, ForkGuard, TaintConfig, template_node_info_from_node_group};
use tracing::{debug, error, info, warn};

use crate::context::AutoscalingContext;
use crate::equivalence::{PodEquivalenceGroup, build_pod_equivalence_groups, mark_all_unschedulable};
use crate::executor::ScaleUpExecutor;
use crate::expander::ExpansionOption;
use crate::initializer::{AsyncNodeGroupInitializer, TargetSizes};
use crate::nodegroupset::{ScaleUpInfo, is_zero_or_max};
use crate::processors::AutoscalingProcessors;
use crate::reasons::Reasons;
use crate::resource::{Delta, Limits, ResourceManager, check_delta_within_limits};
use crate::status::{NoScaleUpInfo, ScaleUpResult, ScaleUpStatus};

/// Unschedulable pods logged one by one before switching to a count.
const MAX_PODS_LOGGED: usize = 20;

pub const MAX_NODES_TOTAL_REACHED: &str = "MaxNodesTotalReached";

/// Node group id → indices of the equivalence groups whose exemplar fits
/// that group's template.
type SchedulablePodGroups = HashMap<String, Vec<usize>>;

struct Orchestrator {
    context: AutoscalingContext,
    processors: AutoscalingProcessors,
    registry: Arc<ClusterStateRegistry>,
    estimator_builder: Arc<dyn EstimatorBuilder>,
    taint_config: TaintConfig,
    resource_manager: ResourceManager,
    executor: ScaleUpExecutor,
    /// Planned sizes of groups whose asynchronous creation is still
    /// running, keyed by the id of the group being created.
    in_flight: HashMap<String, TargetSizes>,
}

/// Decides and executes scale-ups. Unusable until
/// [`initialize`](Self::initialize) has been called.
#[derive(Default)]
pub struct ScaleUpOrchestrator {
    inner: Option<Orchestrator>,
}

impl ScaleUpOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(
        &mut self,
        context: AutoscalingContext,
        processors: AutoscalingProcessors,
        registry: Arc<ClusterStateRegistry>,
        estimator_builder: Arc<dyn EstimatorBuilder>,
        taint_config: TaintConfig,
    ) {
        let resource_manager = ResourceManager::new(processors.custom_resources.clone());
        let executor = ScaleUpExecutor::new(
            context.cloud_provider.clone(),
            registry.clone(),
            context.event_recorder.clone(),
            context.metrics.clone(),
            context.options.parallel_scale_up,
        );
        self.inner = Some(Orchestrator {
            context,
            processors,
            registry,
            estimator_builder,
            taint_config,
            resource_manager,
            executor,
            in_flight: HashMap::new(),
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    /// The context, for callers that refresh the cluster snapshot between
    /// iterations.
    pub fn context_mut(&mut self) -> Option<&mut AutoscalingContext> {
        self.inner.as_mut().map(|o| &mut o.context)
    }

    /// Try to make room for `unschedulable_pods` by growing one node group
    /// (and groups similar to it). `node_infos` maps node group ids to
    /// their template; groups created along the way are added to a local
    /// copy. With `all_or_nothing`, nothing is changed unless every pod
    /// can be helped.
    pub async fn scale_up(
        &mut self,
        unschedulable_pods: &[PodRef],
        nodes: &[Node],
        daemon_sets: &[DaemonSet],
        node_infos: HashMap<String, NodeInfo>,
        all_or_nothing: bool,
    ) -> ScaleUpStatus {
        let Some(inner) = self.inner.as_mut() else {
            return not_initialized();
        };
        let status = inner
            .scale_up(unschedulable_pods, nodes, daemon_sets, node_infos, all_or_nothing)
            .await;
        inner.register_outcome(&status);
        status
    }

    /// Raise every healthy group whose target is below its minimum size
    /// back to the minimum, within resource limits and the node cap.
    pub async fn scale_up_to_node_group_min_size(
        &mut self,
        nodes: &[Node],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> ScaleUpStatus {
        let Some(inner) = self.inner.as_mut() else {
            return not_initialized();
        };
        let status = inner.scale_up_to_node_group_min_size(nodes, node_infos).await;
        inner.register_outcome(&status);
        status
    }
}

fn not_initialized() -> ScaleUpStatus {
    ScaleUpStatus::default().into_error(AutoscalerError::internal("scale-up orchestrator is not initialized"))
}

impl Orchestrator {
    fn provider(&self) -> &dyn CloudProvider {
        self.context.cloud_provider.as_ref()
    }

    fn register_outcome(&self, status: &ScaleUpStatus) {
        if let Some(err) = &status.scale_up_error {
            self.context.metrics.register_error(err);
        }
    }

    async fn scale_up(
        &mut self,
        unschedulable_pods: &[PodRef],
        nodes: &[Node],
        daemon_sets: &[DaemonSet],
        mut node_infos: HashMap<String, NodeInfo>,
        all_or_nothing: bool,
    ) -> ScaleUpStatus {
        if unschedulable_pods.is_empty() {
            info!("no unschedulable pods");
            return ScaleUpStatus::with_result(ScaleUpResult::NotNeeded);
        }
        let start = Instant::now();
        let now = start;
        log_unschedulable_pods(unschedulable_pods);

        let grouping_start = Instant::now();
        let mut pod_groups = build_pod_equivalence_groups(unschedulable_pods);
        self.context
            .metrics
            .update_duration(FunctionLabel::BuildPodEquivalenceGroups, grouping_start);

        let upcoming = match self.upcoming_node_count(&node_infos) {
            Ok(count) => count,
            Err(e) => return ScaleUpStatus::default().into_error(e),
        };
        let current_node_count = nodes.len() + upcoming;

        let resources_left = match self.resource_manager.resources_left(self.provider(), &node_infos, nodes) {
            Ok(left) => left,
            Err(e) => {
                return ScaleUpStatus::default().into_error(e.add_prefix("could not compute total resources: "));
            }
        };

        let node_groups = self.context.cloud_provider.node_groups();
        let (valid_groups, skipped) =
            self.filter_valid_scale_up_node_groups(&node_groups, &node_infos, &resources_left, current_node_count, now);

        let mut schedulable = self.compute_schedulable_pod_groups(&mut pod_groups, &valid_groups, &node_infos);

        let mut options = Vec::new();
        self.processors.binpacking_limiter.init_binpacking(&valid_groups);
        for group in &valid_groups {
            let id = group.id();
            let option = self.compute_expansion_option(
                group,
                &schedulable,
                &pod_groups,
                &node_infos,
                current_node_count,
                unschedulable_pods.len(),
                all_or_nothing,
                now,
            );
            self.processors.binpacking_limiter.mark_processed(&id);
            if let Some(option) = option {
                options.push(option);
            }
            if self.processors.binpacking_limiter.stop_binpacking(&options) {
                break;
            }
        }
        self.processors.binpacking_limiter.finalize_binpacking(&options);

        if options.is_empty() {
            info!("no expansion options");
            if all_or_nothing {
                mark_all_unschedulable(&mut pod_groups, &Reasons::all_or_nothing());
            }
            return ScaleUpStatus {
                result: ScaleUpResult::NoOptionsAvailable,
                pods_remain_unschedulable: remaining_pods(&pod_groups, &skipped),
                considered_node_groups: node_groups,
                ..Default::default()
            };
        }

        let best = match self.context.expander.best_option(&options, &node_infos) {
            Some(best) if best.node_count > 0 => best,
            _ => {
                info!("no expansion option was chosen");
                return ScaleUpStatus {
                    result: ScaleUpResult::NoOptionsAvailable,
                    pods_remain_unschedulable: remaining_pods(&pod_groups, &skipped),
                    considered_node_groups: node_groups,
                    ..Default::default()
                };
            }
        };
        info!(
            node_group = %best.node_group.id(),
            nodes = best.node_count,
            pods = best.pods.len(),
            "best option to resize"
        );
        if let Some(note) = &best.debug {
            debug!(node_group = %best.node_group.id(), "{note}");
        }

        // Builds the status for every later exit.
        let base = |pod_groups: &[PodEquivalenceGroup]| ScaleUpStatus {
            pods_triggered_scale_up: best.pods.clone(),
            pods_remain_unschedulable: remaining_pods(pod_groups, &skipped),
            considered_node_groups: node_groups.clone(),
            ..Default::default()
        };

        let mut new_nodes = match self.capped_new_node_count(best.node_count, current_node_count) {
            Ok(count) => count,
            Err(e) => return base(&pod_groups).into_error(e),
        };
        if all_or_nothing && new_nodes < best.node_count {
            return all_or_nothing_abort(&mut pod_groups, &skipped, &node_groups, "node cap");
        }

        let mut best_group = best.node_group.clone();
        let mut created_groups: Vec<NodeGroupRef> = Vec::new();
        // Asynchronous creation starts only once the final plan is known,
        // so the initializer always sees the balanced size.
        let mut async_creation: Option<AsyncNodeGroupInitializer> = None;

        if !best_group.exist() {
            if all_or_nothing && best_group.max_size() < new_nodes {
                return all_or_nothing_abort(&mut pod_groups, &skipped, &node_groups, "new group max size");
            }
            let created = if self.context.options.async_node_groups_enabled {
                self.async_creation_initializer(&best_group, &node_infos, daemon_sets, all_or_nothing)
                    .map(|initializer| {
                        async_creation = Some(initializer);
                        Vec::new()
                    })
            } else {
                self.create_node_group(&best_group, &mut node_infos, daemon_sets)
                    .map(|groups| {
                        // Pods are checked against the real templates of
                        // the created groups.
                        let fits = self.compute_schedulable_pod_groups(&mut pod_groups, &groups, &node_infos);
                        schedulable.extend(fits);
                        groups
                    })
            };
            match created {
                Ok(groups) => {
                    if let Some(main) = groups.first() {
                        best_group = main.clone();
                    }
                    created_groups = groups;
                }
                Err(e) => {
                    let mut status = base(&pod_groups);
                    status.failed_creation_node_groups = vec![best_group.clone()];
                    return status.into_error(e);
                }
            }
        }

        let Some(node_info) = node_infos.get(&best_group.id()) else {
            let mut status = base(&pod_groups);
            status.created_node_groups = created_groups;
            return status.into_error(AutoscalerError::cloud_provider("no node info for best expansion option"));
        };
        new_nodes = match self.resource_manager.apply_limits(
            self.provider(),
            new_nodes,
            &resources_left,
            node_info,
            best_group.as_ref(),
        ) {
            Ok(count) => count,
            Err(e) => {
                let mut status = base(&pod_groups);
                status.created_node_groups = created_groups;
                return status.into_error(e);
            }
        };
        if all_or_nothing && new_nodes < best.node_count {
            return all_or_nothing_abort(&mut pod_groups, &skipped, &node_groups, "resource limits");
        }

        let mut target_groups = vec![best_group.clone()];
        if self.context.options.balance_similar_node_groups {
            let similar = self.compute_similar_node_groups(&best_group, &schedulable, &node_infos, now);
            if !similar.is_empty() {
                info!(
                    node_group = %best_group.id(),
                    similar = ?similar.iter().map(|g| g.id()).collect::<Vec<_>>(),
                    "balancing scale-up between similar node groups"
                );
            }
            target_groups.extend(similar);
        }

        let infos = match self.processors.node_group_set.balance_scale_up_between_groups(
            &target_groups,
            new_nodes,
            &self.context.options.node_group_defaults,
        ) {
            Ok(infos) => infos,
            Err(e) => {
                let mut status = base(&pod_groups);
                status.created_node_groups = created_groups;
                return status.into_error(e);
            }
        };
        if infos.is_empty() {
            info!("balancing left nothing to scale up");
            let mut status = base(&pod_groups);
            status.result = ScaleUpResult::NoOptionsAvailable;
            status.pods_triggered_scale_up.clear();
            status.created_node_groups = created_groups;
            return status;
        }
        let total: usize = infos.iter().map(ScaleUpInfo::delta).sum();
        if all_or_nothing && total < new_nodes {
            return all_or_nothing_abort(&mut pod_groups, &skipped, &node_groups, "balancing");
        }

        if let Some(initializer) = async_creation {
            let id = best_group.id();
            let sizes = initializer.target_sizes();
            for info in infos.iter().filter(|info| !info.group.exist()) {
                sizes.set(&info.group.id(), info.new_size);
            }
            if sizes.get(&id).is_some() {
                match self
                    .processors
                    .node_group_manager
                    .create_node_group_async(&best_group, initializer)
                {
                    Ok(result) => {
                        self.in_flight.insert(id, sizes);
                        created_groups = result.all_created().cloned().collect();
                    }
                    Err(e) => {
                        let mut status = base(&pod_groups);
                        status.failed_creation_node_groups = vec![best_group.clone()];
                        return status.into_error(e);
                    }
                }
            } else {
                debug!(node_group = %id, "balanced plan leaves nothing for the new node group, not creating it");
            }
        }

        info!(plan = ?infos, "final scale-up plan");
        if let Err(failure) = self
            .executor
            .execute_scale_ups(&infos, &node_infos, now, all_or_nothing)
            .await
        {
            let mut status = base(&pod_groups);
            status.created_node_groups = created_groups;
            status.failed_resize_node_groups = failure.failed_groups;
            return status.into_error(failure.error);
        }
        self.registry.recalculate();
        self.context.metrics.update_duration(FunctionLabel::ScaleUp, start);

        ScaleUpStatus {
            result: ScaleUpResult::Successful,
            scale_up_infos: infos,
            pods_triggered_scale_up: best.pods.clone(),
            pods_remain_unschedulable: remaining_pods(&pod_groups, &skipped),
            pods_await_evaluation: pods_awaiting_evaluation(&pod_groups, &best_group.id()),
            created_node_groups: created_groups,
            considered_node_groups: node_groups,
            ..Default::default()
        }
    }

    async fn scale_up_to_node_group_min_size(
        &mut self,
        nodes: &[Node],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> ScaleUpStatus {
        let now = Instant::now();
        let mut resources_left = match self.resource_manager.resources_left(self.provider(), node_infos, nodes) {
            Ok(left) => left,
            Err(e) => {
                return ScaleUpStatus::default().into_error(e.add_prefix("could not compute total resources: "));
            }
        };

        let node_groups = self.context.cloud_provider.node_groups();
        let mut infos = Vec::new();
        let mut planned = 0;
        for group in node_groups.iter().cloned() {
            let id = group.id();
            if !group.exist() {
                debug!(node_group = %id, "skipping min size check for non-existing node group");
                continue;
            }
            let target = match group.target_size() {
                Ok(target) => target,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "failed to get target size");
                    continue;
                }
            };
            if target >= group.min_size() {
                continue;
            }
            debug!(node_group = %id, target, min = group.min_size(), max = group.max_size(), "node group below min size");
            let safety = self.registry.node_group_scaling_safety(group.as_ref(), now);
            if !safety.safe_to_scale {
                warn!(node_group = %id, healthy = safety.healthy, "node group is not ready for scale-up");
                continue;
            }
            let Some(node_info) = node_infos.get(&id) else {
                warn!(node_group = %id, "no node info");
                continue;
            };
            let delta = match self.resource_manager.delta_for_node(self.provider(), node_info, group.as_ref()) {
                Ok(delta) => delta,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "failed to compute resource delta");
                    continue;
                }
            };
            let check = check_delta_within_limits(&resources_left, &delta);
            if check.exceeded {
                warn!(node_group = %id, exceeded = ?check.exceeded_resources, "scale-up to min size would exceed resource limits");
                continue;
            }
            let count = match self.resource_manager.apply_limits(
                self.provider(),
                group.min_size() - target,
                &resources_left,
                node_info,
                group.as_ref(),
            ) {
                Ok(count) => count,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "resource limits leave no room");
                    continue;
                }
            };
            let count = match self.capped_new_node_count(count, nodes.len() + planned) {
                Ok(count) => count,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "node cap leaves no room");
                    continue;
                }
            };
            consume(&mut resources_left, &delta, count);
            planned += count;
            infos.push(ScaleUpInfo {
                current_size: target,
                new_size: target + count,
                max_size: group.max_size(),
                group,
            });
        }

        if infos.is_empty() {
            info!("scale-up to min size not needed");
            return ScaleUpStatus::with_result(ScaleUpResult::NotNeeded);
        }
        info!(plan = ?infos, "scale-up to min size plan");
        if let Err(failure) = self.executor.execute_scale_ups(&infos, node_infos, now, false).await {
            return ScaleUpStatus {
                failed_resize_node_groups: failure.failed_groups,
                ..Default::default()
            }
            .into_error(failure.error);
        }
        self.registry.recalculate();
        ScaleUpStatus {
            result: ScaleUpResult::Successful,
            scale_up_infos: infos,
            considered_node_groups: node_groups,
            ..Default::default()
        }
    }

    /// Nodes requested but not registered yet, across all groups,
    /// including the planned sizes of groups still being created.
    fn upcoming_node_count(&mut self, node_infos: &HashMap<String, NodeInfo>) -> AutoscalerResult<usize> {
        let checker = self.processors.async_node_group_state_checker.clone();
        let creating: HashSet<String> = self
            .context
            .cloud_provider
            .node_groups()
            .iter()
            .filter(|group| checker.is_upcoming(group.as_ref()))
            .map(|group| group.id())
            .collect();
        self.in_flight.retain(|id, _| creating.contains(id));
        let mut total: usize = self
            .in_flight
            .values()
            .flat_map(|sizes| sizes.snapshot().into_values())
            .sum();

        for (id, count) in self.registry.upcoming_nodes() {
            if count == 0 {
                continue;
            }
            if !node_infos.contains_key(&id) {
                return Err(AutoscalerError::internal(format!(
                    "failed to find template node for node group {id}"
                )));
            }
            total += count;
        }
        Ok(total)
    }

    fn filter_valid_scale_up_node_groups(
        &self,
        node_groups: &[NodeGroupRef],
        node_infos: &HashMap<String, NodeInfo>,
        resources_left: &Limits,
        current_node_count: usize,
        now: Instant,
    ) -> (Vec<NodeGroupRef>, BTreeMap<String, Reasons>) {
        let options = &self.context.options;
        let may_create = options.node_autoprovisioning_enabled || options.async_node_groups_enabled;
        let mut valid = Vec::new();
        let mut skipped = BTreeMap::new();

        for group in node_groups {
            let id = group.id();
            let exist = group.exist();
            if !exist && !may_create {
                debug!(node_group = %id, "skipping non-existing node group");
                continue;
            }
            if !exist && self.processors.async_node_group_state_checker.is_upcoming(group.as_ref()) {
                debug!(node_group = %id, "skipping node group, creation still in progress");
                continue;
            }
            if exist {
                let safety = self.registry.node_group_scaling_safety(group.as_ref(), now);
                if !safety.safe_to_scale {
                    let reason = if safety.healthy {
                        Reasons::backoff()
                    } else {
                        Reasons::not_ready()
                    };
                    debug!(node_group = %id, reason = %reason, "skipping node group");
                    skipped.insert(id, reason);
                    continue;
                }
            }

            let current = match group.target_size() {
                Ok(size) => size,
                Err(_) if !exist => 0,
                Err(e) => {
                    error!(node_group = %id, error = %e, "failed to get node group size");
                    skipped.insert(id, Reasons::not_ready());
                    continue;
                }
            };
            if current >= group.max_size() {
                debug!(node_group = %id, size = current, "skipping node group, max size reached");
                skipped.insert(id, Reasons::max_limit_reached());
                continue;
            }

            let mut unit = 1;
            if is_zero_or_max(group.as_ref(), &options.node_group_defaults) {
                unit = group.max_size() - current;
                if options.max_nodes_total > 0 && current_node_count + unit > options.max_nodes_total {
                    debug!(node_group = %id, "skipping node group, atomic scale-up exceeds cluster node cap");
                    skipped.insert(id, Reasons::atomic_exceeds_node_cap());
                    continue;
                }
            }

            let Some(node_info) = node_infos.get(&id) else {
                error!(node_group = %id, "no node info for node group");
                skipped.insert(id, Reasons::not_ready());
                continue;
            };
            let delta = match self.resource_manager.delta_for_node(self.provider(), node_info, group.as_ref()) {
                Ok(delta) => delta,
                Err(e) => {
                    error!(node_group = %id, error = %e, "failed to compute resource delta");
                    skipped.insert(id, Reasons::not_ready());
                    continue;
                }
            };
            let scaled: Delta = delta
                .into_iter()
                .map(|(resource, amount)| (resource, amount.saturating_mul(unit as i64)))
                .collect();
            let check = check_delta_within_limits(resources_left, &scaled);
            if check.exceeded {
                info!(node_group = %id, exceeded = ?check.exceeded_resources, "skipping node group, resource limits exceeded");
                for resource in &check.exceeded_resources {
                    match resource.as_str() {
                        RESOURCE_CORES => self.context.metrics.register_skipped_scale_up_cpu(),
                        RESOURCE_MEMORY => self.context.metrics.register_skipped_scale_up_memory(),
                        _ => {}
                    }
                }
                skipped.insert(id, Reasons::max_resource_limit_reached(&check.exceeded_resources));
                continue;
            }
            valid.push(group.clone());
        }
        (valid, skipped)
    }

    /// Check each equivalence group's exemplar against each group's
    /// template and record the verdicts on the equivalence groups.
    fn compute_schedulable_pod_groups(
        &mut self,
        pod_groups: &mut [PodEquivalenceGroup],
        node_groups: &[NodeGroupRef],
        node_infos: &HashMap<String, NodeInfo>,
    ) -> SchedulablePodGroups {
        let mut out = SchedulablePodGroups::new();
        for group in node_groups {
            let id = group.id();
            let Some(template) = node_infos.get(&id) else {
                continue;
            };
            out.insert(id.clone(), self.schedulable_on_template(pod_groups, &id, template));
        }
        out
    }

    fn schedulable_on_template(
        &mut self,
        pod_groups: &mut [PodEquivalenceGroup],
        node_group_id: &str,
        template: &NodeInfo,
    ) -> Vec<usize> {
        let checker = self.context.predicate_checker.clone();
        let mut snapshot = ForkGuard::new(self.context.cluster_snapshot.as_mut());
        if let Err(e) = snapshot.add_node_info(template.clone()) {
            error!(node_group = %node_group_id, error = %e, "failed to add template node to snapshot");
            return Vec::new();
        }
        let node_name = template.name().to_string();

        let mut fits = Vec::new();
        for (index, group) in pod_groups.iter_mut().enumerate() {
            match checker.check_predicates(&*snapshot, group.exemplar(), &node_name) {
                Ok(()) => {
                    group.mark_schedulable_on(node_group_id);
                    fits.push(index);
                }
                Err(err) => group.mark_rejected_by(node_group_id, Reasons::from(&err)),
            }
        }
        fits
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_expansion_option(
        &mut self,
        group: &NodeGroupRef,
        schedulable: &SchedulablePodGroups,
        pod_groups: &[PodEquivalenceGroup],
        node_infos: &HashMap<String, NodeInfo>,
        current_node_count: usize,
        unschedulable_count: usize,
        all_or_nothing: bool,
        now: Instant,
    ) -> Option<ExpansionOption> {
        let id = group.id();
        let indices = schedulable.get(&id).filter(|i| !i.is_empty())?;
        let template = node_infos.get(&id)?;
        let similar = self.compute_similar_node_groups(group, schedulable, node_infos, now);

        let pods: Vec<Vec<PodRef>> = indices.iter().map(|&i| pod_groups[i].pods.clone()).collect();
        let mut estimator = self.estimator_builder.build(EstimationContext {
            similar_node_groups: similar.clone(),
            current_node_count,
            cluster_max_node_limit: self.context.options.max_nodes_total,
        });
        let estimate_start = Instant::now();
        let estimate = estimator.estimate(self.context.cluster_snapshot.as_mut(), &pods, template, group.as_ref());
        self.context
            .metrics
            .update_duration(FunctionLabel::Estimate, estimate_start);

        let mut option = ExpansionOption {
            node_group: group.clone(),
            node_count: estimate.node_count,
            pods: estimate.pods,
            similar_node_groups: similar,
            debug: None,
        };

        if option.node_count > 0 && is_zero_or_max(group.as_ref(), &self.context.options.node_group_defaults) {
            if all_or_nothing && option.node_count > group.max_size() {
                debug!(node_group = %id, nodes = option.node_count, "estimate exceeds max size of zero-or-max node group");
                return None;
            }
            option.node_count = group.max_size();
        }

        if option.node_count == 0 || option.pods.is_empty() {
            debug!(node_group = %id, "no pod can fit on new nodes of node group");
            return None;
        }
        if all_or_nothing && option.pods.len() < unschedulable_count {
            debug!(
                node_group = %id,
                fitting = option.pods.len(),
                pending = unschedulable_count,
                "not all pods fit, discarding option"
            );
            return None;
        }
        Some(option)
    }

    /// Groups `group`'s scale-up may be spread over: similar templates,
    /// safe to scale, and able to hold every pod group `group` can.
    fn compute_similar_node_groups(
        &self,
        group: &NodeGroupRef,
        schedulable: &SchedulablePodGroups,
        node_infos: &HashMap<String, NodeInfo>,
        now: Instant,
    ) -> Vec<NodeGroupRef> {
        let options = &self.context.options;
        if !options.balance_similar_node_groups || is_zero_or_max(group.as_ref(), &options.node_group_defaults) {
            return Vec::new();
        }
        let fits_on = |id: &str| -> HashSet<usize> { schedulable.get(id).into_iter().flatten().copied().collect() };
        let own = fits_on(&group.id());

        let similar = match self
            .processors
            .node_group_set
            .find_similar_node_groups(self.provider(), group.as_ref(), node_infos)
        {
            Ok(similar) => similar,
            Err(e) => {
                warn!(node_group = %group.id(), error = %e, "failed to find similar node groups");
                return Vec::new();
            }
        };
        similar
            .into_iter()
            .filter(|candidate| {
                let id = candidate.id();
                if !candidate.exist() {
                    return false;
                }
                if !self.registry.node_group_scaling_safety(candidate.as_ref(), now).safe_to_scale {
                    debug!(node_group = %id, "ignoring similar node group, not safe to scale");
                    return false;
                }
                own.is_subset(&fits_on(&id))
            })
            .collect()
    }

    /// `new_nodes` reduced so the cluster stays within `max_nodes_total`.
    fn capped_new_node_count(&self, new_nodes: usize, current_node_count: usize) -> AutoscalerResult<usize> {
        let max = self.context.options.max_nodes_total;
        if max == 0 || new_nodes + current_node_count <= max {
            return Ok(new_nodes);
        }
        warn!(max, current = current_node_count, "capping scale-up at max nodes total");
        self.context.event_recorder.warning(
            AUTOSCALER_OBJECT,
            MAX_NODES_TOTAL_REACHED,
            format!("Max total nodes in cluster reached: {max}"),
        );
        let capped = max.saturating_sub(current_node_count);
        if capped < 1 {
            return Err(AutoscalerError::transient("max node total count already reached"));
        }
        Ok(capped)
    }

    /// Create `group` inline. Templates of every created group are added
    /// to `node_infos`; the main group comes first in the result.
    fn create_node_group(
        &mut self,
        group: &NodeGroupRef,
        node_infos: &mut HashMap<String, NodeInfo>,
        daemon_sets: &[DaemonSet],
    ) -> AutoscalerResult<Vec<NodeGroupRef>> {
        let result = self.processors.node_group_manager.create_node_group(group)?;
        let old_id = group.id();
        let main = result.main_created.clone();
        match template_node_info_from_node_group(main.as_ref(), daemon_sets, &self.taint_config) {
            Ok(info) => {
                node_infos.insert(main.id(), info);
            }
            Err(e) => {
                warn!(node_group = %main.id(), error = %e, "failed to build template for created node group, reusing the old one");
                if let Some(info) = node_infos.get(&old_id).cloned() {
                    node_infos.insert(main.id(), info);
                }
            }
        }
        for extra in &result.extra_created {
            match template_node_info_from_node_group(extra.as_ref(), daemon_sets, &self.taint_config) {
                Ok(info) => {
                    node_infos.insert(extra.id(), info);
                }
                Err(e) => warn!(node_group = %extra.id(), error = %e, "failed to build template for created node group"),
            }
        }
        self.registry.recalculate();
        Ok(result.all_created().cloned().collect())
    }

    /// The initializer that finishes a background creation of `group`.
    /// Creation is started later, once its target sizes are set.
    fn async_creation_initializer(
        &self,
        group: &NodeGroupRef,
        node_infos: &HashMap<String, NodeInfo>,
        daemon_sets: &[DaemonSet],
        all_or_nothing: bool,
    ) -> AutoscalerResult<AsyncNodeGroupInitializer> {
        let id = group.id();
        let fallback = node_infos
            .get(&id)
            .cloned()
            .ok_or_else(|| AutoscalerError::internal(format!("no node info for node group {id}")))?;
        Ok(AsyncNodeGroupInitializer::new(
            group.clone(),
            fallback,
            self.executor.clone(),
            self.registry.clone(),
            self.processors.scale_up_status.clone(),
            all_or_nothing,
        )
        .with_templates(daemon_sets.to_vec(), self.taint_config.clone()))
    }
}

fn log_unschedulable_pods(pods: &[PodRef]) {
    for pod in pods.iter().take(MAX_PODS_LOGGED) {
        info!(pod = %pod.key(), "pod is unschedulable");
    }
    if pods.len() > MAX_PODS_LOGGED {
        info!(more = pods.len() - MAX_PODS_LOGGED, "more pods are unschedulable");
    }
    info!(count = pods.len(), "unschedulable pods");
}

fn consume(left: &mut Limits, delta: &Delta, count: usize) {
    for (resource, amount) in delta {
        if let Some(limit) = left.get_mut(resource) {
            *limit = limit.saturating_sub(amount.saturating_mul(count as i64)).max(0);
        }
    }
}

/// Every pod of an equivalence group no node group could take.
fn remaining_pods(pod_groups: &[PodEquivalenceGroup], skipped: &BTreeMap<String, Reasons>) -> Vec<NoScaleUpInfo> {
    pod_groups
        .iter()
        .filter(|group| !group.schedulable)
        .flat_map(|group| {
            group.pods.iter().map(|pod| NoScaleUpInfo {
                pod: pod.clone(),
                rejected_node_groups: group.scheduling_errors.clone(),
                skipped_node_groups: skipped.clone(),
            })
        })
        .collect()
}

/// Pods that fit somewhere, just not on `best_group_id`.
fn pods_awaiting_evaluation(pod_groups: &[PodEquivalenceGroup], best_group_id: &str) -> Vec<PodRef> {
    pod_groups
        .iter()
        .filter(|group| group.schedulable && group.scheduling_errors.contains_key(best_group_id))
        .flat_map(|group| group.pods.iter().cloned())
        .collect()
}

fn all_or_nothing_abort(
    pod_groups: &mut [PodEquivalenceGroup],
    skipped: &BTreeMap<String, Reasons>,
    node_groups: &[NodeGroupRef],
    stage: &str,
) -> ScaleUpStatus {
    info!(stage, "not all pods can be helped, aborting all-or-nothing scale-up");
    mark_all_unschedulable(pod_groups, &Reasons::all_or_nothing());
    ScaleUpStatus {
        result: ScaleUpResult::NoOptionsAvailable,
        pods_remain_unschedulable: remaining_pods(pod_groups, skipped),
        considered_node_groups: node_groups.to_vec(),
        ..Default::default()
    }
}
