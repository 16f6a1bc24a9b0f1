//! Executing a scale-up plan against the provider.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use kubescale_cloud::{CloudProvider, CloudProviderError, NodeGroup, NodeGroupRef, gpu_info_for_metrics};
use kubescale_clusterstate::ClusterStateRegistry;
use kubescale_core::events::AUTOSCALER_OBJECT;
use kubescale_core::{AutoscalerError, AutoscalerResult, ErrorKind, EventRecorder, NodeInfo};
use kubescale_metrics::AutoscalerMetrics;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::nodegroupset::ScaleUpInfo;

pub const SCALED_UP_GROUP: &str = "ScaledUpGroup";
pub const FAILED_TO_SCALE_UP_GROUP: &str = "FailedToScaleUpGroup";

/// A failed plan: the (possibly combined) error and the groups whose
/// resize failed.
#[derive(Debug, Clone)]
pub struct ScaleUpFailure {
    pub error: AutoscalerError,
    pub failed_groups: Vec<NodeGroupRef>,
}

/// Resizes node groups, one provider call per [`ScaleUpInfo`], either in
/// order or concurrently.
///
/// Groups that do not exist yet are never resized here: the initializer
/// of their asynchronous creation resizes and registers them once the
/// provider has created them.
#[derive(Clone)]
pub struct ScaleUpExecutor {
    provider: Arc<dyn CloudProvider>,
    registry: Arc<ClusterStateRegistry>,
    event_recorder: Arc<dyn EventRecorder>,
    metrics: Arc<AutoscalerMetrics>,
    parallel: bool,
}

impl ScaleUpExecutor {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        registry: Arc<ClusterStateRegistry>,
        event_recorder: Arc<dyn EventRecorder>,
        metrics: Arc<AutoscalerMetrics>,
        parallel: bool,
    ) -> Self {
        Self {
            provider,
            registry,
            event_recorder,
            metrics,
            parallel,
        }
    }

    /// Execute every resize in `infos`. `node_infos` supplies the template
    /// of each group for GPU metric labels; groups without one are
    /// skipped.
    pub async fn execute_scale_ups(
        &self,
        infos: &[ScaleUpInfo],
        node_infos: &HashMap<String, NodeInfo>,
        now: Instant,
        atomic: bool,
    ) -> Result<(), ScaleUpFailure> {
        if self.parallel {
            self.execute_parallel(infos, node_infos, now, atomic).await
        } else {
            self.execute_sequential(infos, node_infos, now, atomic).await
        }
    }

    async fn execute_sequential(
        &self,
        infos: &[ScaleUpInfo],
        node_infos: &HashMap<String, NodeInfo>,
        now: Instant,
        atomic: bool,
    ) -> Result<(), ScaleUpFailure> {
        for info in infos {
            let Some(node_info) = executable_node_info(info, node_infos) else {
                continue;
            };
            let executor = self.clone();
            let task_info = info.clone();
            let result = tokio::task::spawn_blocking(move || {
                executor.execute_one(&task_info, &node_info, now, atomic)
            })
            .await
            .unwrap_or_else(|e| Err(worker_failed(e)));
            if let Err(error) = result {
                return Err(ScaleUpFailure {
                    error,
                    failed_groups: vec![info.group.clone()],
                });
            }
        }
        Ok(())
    }

    async fn execute_parallel(
        &self,
        infos: &[ScaleUpInfo],
        node_infos: &HashMap<String, NodeInfo>,
        now: Instant,
        atomic: bool,
    ) -> Result<(), ScaleUpFailure> {
        let mut seen = HashSet::new();
        if !infos.iter().all(|info| seen.insert(info.group.id())) {
            return Err(ScaleUpFailure {
                error: AutoscalerError::internal("assertion failure: detected group double scaling"),
                failed_groups: infos.iter().map(|info| info.group.clone()).collect(),
            });
        }

        let mut workers = JoinSet::new();
        let mut worker_groups = HashMap::new();
        for info in infos {
            let Some(node_info) = executable_node_info(info, node_infos) else {
                continue;
            };
            let executor = self.clone();
            let task_info = info.clone();
            let handle = workers.spawn_blocking(move || executor.execute_one(&task_info, &node_info, now, atomic));
            worker_groups.insert(handle.id(), info.group.clone());
        }

        let mut errors = Vec::new();
        let mut failed_groups = Vec::new();
        while let Some(joined) = workers.join_next_with_id().await {
            let (task_id, error) = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((task_id, Err(e))) => (task_id, e),
                Err(e) => (e.id(), worker_failed(e)),
            };
            errors.push(error);
            if let Some(group) = worker_groups.remove(&task_id) {
                failed_groups.push(group);
            }
        }
        failed_groups.sort_by_key(|g| g.id());

        match combine_concurrent_scale_up_errors(errors) {
            None => Ok(()),
            Some(error) => Err(ScaleUpFailure {
                error,
                failed_groups,
            }),
        }
    }

    /// Resize one group. Blocks on the provider.
    fn execute_one(
        &self,
        info: &ScaleUpInfo,
        node_info: &NodeInfo,
        now: Instant,
        atomic: bool,
    ) -> AutoscalerResult<()> {
        let group = info.group.as_ref();
        let id = group.id();
        let (gpu_resource_name, gpu_type) = gpu_info_for_metrics(
            self.provider.node_gpu_config(&node_info.node).as_ref(),
            &self.provider.available_gpu_types(),
            &node_info.node,
        );

        if info.new_size < info.current_size {
            return Err(AutoscalerError::internal(format!(
                "increase in number of nodes cannot be negative, got: {} -> {}",
                info.current_size, info.new_size
            )));
        }
        let delta = info.delta();

        info!(
            node_group = %id,
            current = info.current_size,
            new = info.new_size,
            max = info.max_size,
            atomic,
            "scale-up: setting group size"
        );
        self.event_recorder.normal(
            AUTOSCALER_OBJECT,
            SCALED_UP_GROUP,
            format!(
                "Scale-up: setting group {id} size to {} instead of {} (max: {})",
                info.new_size, info.current_size, info.max_size
            ),
        );

        if let Err(e) = increase_size(group, delta, atomic) {
            warn!(node_group = %id, error = %e, "scale-up failed");
            self.event_recorder.warning(
                AUTOSCALER_OBJECT,
                FAILED_TO_SCALE_UP_GROUP,
                format!("Scale-up failed for group {id}: {e}"),
            );
            let err = AutoscalerError::from_error(ErrorKind::CloudProvider, e)
                .add_prefix("failed to increase node group size: ");
            self.registry.register_failed_scale_up(
                group,
                err.kind,
                &err.message,
                &gpu_resource_name,
                &gpu_type,
                now,
            );
            self.metrics
                .register_failed_scale_up(err.kind, &gpu_resource_name, &gpu_type);
            return Err(err);
        }

        self.registry.register_scale_up(group, delta, now);
        self.metrics.register_scale_up(delta, &gpu_resource_name, &gpu_type);
        self.event_recorder.normal(
            AUTOSCALER_OBJECT,
            SCALED_UP_GROUP,
            format!(
                "Scale-up: group {id} size set to {} instead of {} (max: {})",
                info.new_size, info.current_size, info.max_size
            ),
        );
        Ok(())
    }
}

/// The template of `info`'s group, or `None` when the group must not be
/// resized by the executor.
fn executable_node_info(info: &ScaleUpInfo, node_infos: &HashMap<String, NodeInfo>) -> Option<NodeInfo> {
    let id = info.group.id();
    if !info.group.exist() {
        debug!(node_group = %id, "node group is still being created, leaving the resize to its initializer");
        return None;
    }
    let node_info = node_infos.get(&id).cloned();
    if node_info.is_none() {
        error!(node_group = %id, "failed to get node info for node group, skipping scale-up");
    }
    node_info
}

/// Atomic increase when asked for, falling back to a plain increase on
/// providers that do not implement it.
fn increase_size(group: &dyn NodeGroup, delta: usize, atomic: bool) -> Result<(), CloudProviderError> {
    if atomic {
        match group.atomic_increase_size(delta) {
            Err(CloudProviderError::NotImplemented) => {}
            other => return other,
        }
    }
    group.increase_size(delta)
}

fn worker_failed(err: tokio::task::JoinError) -> AutoscalerError {
    AutoscalerError::internal(format!("scale-up worker failed: {err}"))
}

/// Fold the errors of concurrent resizes into one.
///
/// The result does not depend on the order of `errors`: they are sorted
/// by kind name and message, the first one gives the kind and leads the
/// message, the distinct others are appended quoted.
pub fn combine_concurrent_scale_up_errors(mut errors: Vec<AutoscalerError>) -> Option<AutoscalerError> {
    if errors.len() <= 1 {
        return errors.pop();
    }
    errors.sort_by(|a, b| {
        a.kind
            .as_str()
            .cmp(b.kind.as_str())
            .then_with(|| a.message.cmp(&b.message))
    });
    errors.dedup();
    let first = &errors[0];
    if errors.len() == 1 {
        return Some(first.clone());
    }

    let print_kinds = errors.iter().map(|e| e.kind).collect::<BTreeSet<_>>().len() > 1;
    let others: Vec<String> = errors[1..]
        .iter()
        .map(|e| {
            let text = if print_kinds {
                format!("[{}] {}", e.kind, e.message)
            } else {
                e.message.clone()
            };
            format!("{text:?}")
        })
        .collect();
    Some(AutoscalerError::new(
        first.kind,
        format!(
            "{} ...and other concurrent errors: [{}]",
            first.message,
            others.join(", ")
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubescale_cloud::{CloudProviderResult, TestCloudProvider, TestNodeGroupSpec};
    use kubescale_clusterstate::ClusterStateConfig;
    use kubescale_core::{Node, RecordingEventRecorder, ResourceList};

    struct Fixture {
        provider: Arc<TestCloudProvider>,
        registry: Arc<ClusterStateRegistry>,
        recorder: Arc<RecordingEventRecorder>,
        metrics: Arc<AutoscalerMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let provider = Arc::new(TestCloudProvider::new());
            let registry = Arc::new(ClusterStateRegistry::new(
                provider.clone(),
                ClusterStateConfig::default(),
            ));
            Self {
                provider,
                registry,
                recorder: Arc::new(RecordingEventRecorder::new()),
                metrics: Arc::new(AutoscalerMetrics::new()),
            }
        }

        fn executor(&self, parallel: bool) -> ScaleUpExecutor {
            ScaleUpExecutor::new(
                self.provider.clone(),
                self.registry.clone(),
                self.recorder.clone(),
                self.metrics.clone(),
                parallel,
            )
        }

        fn group(&self, spec: TestNodeGroupSpec) -> (ScaleUpInfo, NodeInfo) {
            let current = spec.target_size;
            let max = spec.max_size;
            let group: NodeGroupRef = self.provider.add_node_group(spec);
            let info = ScaleUpInfo {
                group,
                current_size: current,
                new_size: current + 1,
                max_size: max,
            };
            (info, NodeInfo::new(Node::new("t", ResourceList::cpu_memory(1000, 1000))))
        }
    }

    fn node_infos(pairs: &[(ScaleUpInfo, NodeInfo)]) -> HashMap<String, NodeInfo> {
        pairs
            .iter()
            .map(|(info, node)| (info.group.id(), node.clone()))
            .collect()
    }

    #[tokio::test]
    async fn sequential_success_registers_scale_up() {
        let fx = Fixture::new();
        let pair = fx.group(TestNodeGroupSpec::new("ng1", 0, 5, 1));
        let infos = vec![pair.0.clone()];
        fx.executor(false)
            .execute_scale_ups(&infos, &node_infos(&[pair]), Instant::now(), false)
            .await
            .unwrap();

        assert_eq!(fx.provider.increases(), vec![("ng1".to_string(), 1)]);
        assert_eq!(fx.registry.scale_up_requests()[0].increase, 1);
        assert_eq!(fx.metrics.snapshot().scaled_up_nodes_total, 1);
        let events = fx.recorder.with_reason(SCALED_UP_GROUP);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].message,
            "Scale-up: setting group ng1 size to 2 instead of 1 (max: 5)"
        );
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let fx = Fixture::new();
        let bad = fx.group(TestNodeGroupSpec::new("bad", 0, 5, 1).failing_increase("quota exceeded"));
        let good = fx.group(TestNodeGroupSpec::new("good", 0, 5, 1));
        let infos = vec![bad.0.clone(), good.0.clone()];
        let failure = fx
            .executor(false)
            .execute_scale_ups(&infos, &node_infos(&[bad, good]), Instant::now(), false)
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind, ErrorKind::CloudProvider);
        assert_eq!(
            failure.error.message,
            "failed to increase node group size: quota exceeded"
        );
        assert_eq!(failure.failed_groups[0].id(), "bad");
        assert!(fx.provider.increases().is_empty());
        assert_eq!(fx.registry.failed_scale_ups().len(), 1);
        assert!(fx.registry.backoff_status("bad", Instant::now()).is_backed_off);
        assert_eq!(fx.recorder.with_reason(FAILED_TO_SCALE_UP_GROUP).len(), 1);
    }

    #[tokio::test]
    async fn atomic_falls_back_when_not_implemented() {
        let fx = Fixture::new();
        let plain = fx.group(TestNodeGroupSpec::new("plain", 0, 5, 0));
        let atomic = fx.group(TestNodeGroupSpec::new("atomic", 0, 5, 0).atomic());
        let infos = vec![plain.0.clone(), atomic.0.clone()];
        fx.executor(false)
            .execute_scale_ups(&infos, &node_infos(&[plain, atomic]), Instant::now(), true)
            .await
            .unwrap();
        assert_eq!(fx.provider.increases().len(), 2);
    }

    #[tokio::test]
    async fn parallel_rejects_double_scaling() {
        let fx = Fixture::new();
        let pair = fx.group(TestNodeGroupSpec::new("ng1", 0, 5, 1));
        let infos = vec![pair.0.clone(), pair.0.clone()];
        let failure = fx
            .executor(true)
            .execute_scale_ups(&infos, &node_infos(&[pair]), Instant::now(), false)
            .await
            .unwrap_err();
        assert_eq!(failure.error.kind, ErrorKind::Internal);
        assert_eq!(
            failure.error.message,
            "assertion failure: detected group double scaling"
        );
        assert!(fx.provider.increases().is_empty());
    }

    #[tokio::test]
    async fn parallel_combines_failures() {
        let fx = Fixture::new();
        let a = fx.group(TestNodeGroupSpec::new("a", 0, 2, 1).failing_increase("error a"));
        let b = fx.group(TestNodeGroupSpec::new("b", 0, 2, 1).failing_increase("error b"));
        let c = fx.group(TestNodeGroupSpec::new("c", 0, 2, 1));
        let infos = vec![b.0.clone(), c.0.clone(), a.0.clone()];
        let failure = fx
            .executor(true)
            .execute_scale_ups(&infos, &node_infos(&[a, b, c]), Instant::now(), false)
            .await
            .unwrap_err();

        assert_eq!(
            failure.error.message,
            "failed to increase node group size: error a ...and other concurrent errors: \
             [\"failed to increase node group size: error b\"]"
        );
        let failed: Vec<String> = failure.failed_groups.iter().map(|g| g.id()).collect();
        assert_eq!(failed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fx.provider.increases(), vec![("c".to_string(), 1)]);
    }

    /// A group whose provider call panics.
    #[derive(Debug)]
    struct PanickingGroup;

    impl NodeGroup for PanickingGroup {
        fn id(&self) -> String {
            "panicking".to_string()
        }

        fn exist(&self) -> bool {
            true
        }

        fn min_size(&self) -> usize {
            0
        }

        fn max_size(&self) -> usize {
            5
        }

        fn target_size(&self) -> CloudProviderResult<usize> {
            Ok(1)
        }

        fn increase_size(&self, _delta: usize) -> CloudProviderResult<()> {
            panic!("provider client crashed");
        }

        fn template_node_info(&self) -> CloudProviderResult<NodeInfo> {
            Err(CloudProviderError::NotImplemented)
        }

        fn nodes(&self) -> CloudProviderResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn parallel_reports_group_of_crashed_worker() {
        let fx = Fixture::new();
        let good = fx.group(TestNodeGroupSpec::new("good", 0, 5, 1));
        let crashing = ScaleUpInfo {
            group: Arc::new(PanickingGroup),
            current_size: 1,
            new_size: 2,
            max_size: 5,
        };
        let mut templates = node_infos(&[good.clone()]);
        templates.insert("panicking".to_string(), good.1.clone());
        let infos = vec![good.0.clone(), crashing];

        let failure = fx
            .executor(true)
            .execute_scale_ups(&infos, &templates, Instant::now(), false)
            .await
            .unwrap_err();

        assert_eq!(failure.error.kind, ErrorKind::Internal);
        assert!(failure.error.message.starts_with("scale-up worker failed"), "{}", failure.error.message);
        let failed: Vec<String> = failure.failed_groups.iter().map(|g| g.id()).collect();
        assert_eq!(failed, vec!["panicking".to_string()]);
        assert_eq!(fx.provider.increases(), vec![("good".to_string(), 1)]);
    }

    #[tokio::test]
    async fn placeholders_are_left_to_their_initializer() {
        let fx = Fixture::new();
        let placeholder = fx.group(TestNodeGroupSpec::new("new", 0, 5, 0).not_existing());
        let existing = fx.group(TestNodeGroupSpec::new("old", 0, 5, 1));
        let infos = vec![placeholder.0.clone(), existing.0.clone()];

        for parallel in [false, true] {
            fx.executor(parallel)
                .execute_scale_ups(&infos, &node_infos(&[placeholder.clone(), existing.clone()]), Instant::now(), false)
                .await
                .unwrap();
        }

        assert_eq!(
            fx.provider.increases(),
            vec![("old".to_string(), 1), ("old".to_string(), 1)]
        );
        let requests: Vec<String> = fx.registry.scale_up_requests().into_iter().map(|r| r.node_group).collect();
        assert_eq!(requests, vec!["old".to_string()]);
    }

    #[test]
    fn combine_handles_trivial_cases() {
        assert_eq!(combine_concurrent_scale_up_errors(Vec::new()), None);
        let single = AutoscalerError::cloud_provider("boom");
        assert_eq!(
            combine_concurrent_scale_up_errors(vec![single.clone()]),
            Some(single.clone())
        );
        assert_eq!(
            combine_concurrent_scale_up_errors(vec![single.clone(), single.clone()]),
            Some(single)
        );
    }

    #[test]
    fn combine_prints_kinds_when_they_differ() {
        let errors = vec![
            AutoscalerError::internal("b"),
            AutoscalerError::cloud_provider("a"),
            AutoscalerError::cloud_provider("a"),
            AutoscalerError::cloud_provider("say \"hi\""),
        ];
        let combined = combine_concurrent_scale_up_errors(errors).unwrap();
        assert_eq!(combined.kind, ErrorKind::CloudProvider);
        assert_eq!(
            combined.message,
            r#"a ...and other concurrent errors: ["[cloudProviderError] say \"hi\"", "[internalError] b"]"#
        );
    }

    #[test]
    fn combine_is_order_independent() {
        let errors = vec![
            AutoscalerError::transient("x"),
            AutoscalerError::cloud_provider("z"),
            AutoscalerError::cloud_provider("y"),
            AutoscalerError::internal("x"),
        ];
        let expected = combine_concurrent_scale_up_errors(errors.clone());
        let mut rotated = errors.clone();
        for _ in 0..errors.len() {
            rotated.rotate_left(1);
            assert_eq!(combine_concurrent_scale_up_errors(rotated.clone()), expected);
        }
        let mut reversed = errors;
        reversed.reverse();
        assert_eq!(combine_concurrent_scale_up_errors(reversed), expected);
    }
}
