//! Finishing a scale-up once an asynchronously created group exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use kubescale_cloud::{CreateNodeGroupResult, NodeGroupRef};
use kubescale_clusterstate::ClusterStateRegistry;
use kubescale_core::{AutoscalerResult, DaemonSet, NodeInfo};
use kubescale_simulator::{TaintConfig, template_node_info_from_node_group};
use tracing::{error, info, warn};

use crate::executor::ScaleUpExecutor;
use crate::nodegroupset::ScaleUpInfo;
use crate::processors::ScaleUpStatusProcessor;
use crate::status::{ScaleUpResult, ScaleUpStatus};

/// Target sizes for groups that are still being created, shared between
/// the orchestrator (which decides them) and the initializer (which
/// applies them).
#[derive(Debug, Clone, Default)]
pub struct TargetSizes(Arc<Mutex<HashMap<String, usize>>>);

impl TargetSizes {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, node_group_id: &str, size: usize) {
        self.lock().insert(node_group_id.to_string(), size);
    }

    pub fn get(&self, node_group_id: &str) -> Option<usize> {
        self.lock().get(node_group_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.lock().clone()
    }
}

/// Runs the initial scale-up of a group created in the background and
/// publishes the outcome through the status processor.
pub struct AsyncNodeGroupInitializer {
    node_group: NodeGroupRef,
    fallback_node_info: NodeInfo,
    target_sizes: TargetSizes,
    executor: ScaleUpExecutor,
    registry: Arc<ClusterStateRegistry>,
    status_processor: Arc<dyn ScaleUpStatusProcessor>,
    daemon_sets: Vec<DaemonSet>,
    taint_config: TaintConfig,
    all_or_nothing: bool,
}

impl AsyncNodeGroupInitializer {
    pub fn new(
        node_group: NodeGroupRef,
        fallback_node_info: NodeInfo,
        executor: ScaleUpExecutor,
        registry: Arc<ClusterStateRegistry>,
        status_processor: Arc<dyn ScaleUpStatusProcessor>,
        all_or_nothing: bool,
    ) -> Self {
        Self {
            node_group,
            fallback_node_info,
            target_sizes: TargetSizes::default(),
            executor,
            registry,
            status_processor,
            daemon_sets: Vec::new(),
            taint_config: TaintConfig::default(),
            all_or_nothing,
        }
    }

    /// Daemon sets and taint handling used to rebuild the template from
    /// the created group.
    pub fn with_templates(mut self, daemon_sets: Vec<DaemonSet>, taint_config: TaintConfig) -> Self {
        self.daemon_sets = daemon_sets;
        self.taint_config = taint_config;
        self
    }

    pub fn node_group_id(&self) -> String {
        self.node_group.id()
    }

    /// Handle for updating target sizes after the initializer was handed
    /// to the node group manager.
    pub fn target_sizes(&self) -> TargetSizes {
        self.target_sizes.clone()
    }

    /// Called with the outcome of the creation. Sizes reported by the
    /// creation result win over the ones set through [`TargetSizes`].
    pub async fn initialize(self, result: AutoscalerResult<CreateNodeGroupResult>) {
        let id = self.node_group.id();
        let created = match result {
            Ok(created) => created,
            Err(err) => {
                error!(node_group = %id, error = %err, "async node group creation failed");
                let status = ScaleUpStatus {
                    failed_creation_node_groups: vec![self.node_group.clone()],
                    ..Default::default()
                }
                .into_error(err);
                self.status_processor.process(&status);
                return;
            }
        };

        let main = created.main_created.clone();
        let node_info = match template_node_info_from_node_group(
            main.as_ref(),
            &self.daemon_sets,
            &self.taint_config,
        ) {
            Ok(info) => info,
            Err(e) => {
                warn!(node_group = %main.id(), error = %e, "cannot build node info for created node group, using fallback");
                self.fallback_node_info.clone()
            }
        };

        let target_sizes = if created.target_sizes.is_empty() {
            self.target_sizes.snapshot()
        } else {
            created.target_sizes.clone()
        };
        let mut infos = Vec::new();
        let mut node_infos = HashMap::new();
        for group in created.all_created() {
            let group_id = group.id();
            let Some(target) = target_sizes.get(&group_id).copied().filter(|t| *t > 0) else {
                continue;
            };
            node_infos.insert(group_id, node_info.clone());
            infos.push(ScaleUpInfo {
                group: group.clone(),
                current_size: 0,
                new_size: target.min(group.max_size()),
                max_size: group.max_size(),
            });
        }

        let mut status = ScaleUpStatus {
            created_node_groups: created.all_created().cloned().collect(),
            considered_node_groups: vec![main],
            ..Default::default()
        };
        match self
            .executor
            .execute_scale_ups(&infos, &node_infos, Instant::now(), self.all_or_nothing)
            .await
        {
            Ok(()) => {
                info!(node_group = %id, groups = infos.len(), "initial scale-up of created node group done");
                status.result = ScaleUpResult::Successful;
                status.scale_up_infos = infos;
            }
            Err(failure) => {
                error!(node_group = %id, error = %failure.error, "initial scale-up of created node group failed");
                status.failed_resize_node_groups = failure.failed_groups;
                status = status.into_error(failure.error);
            }
        }
        self.registry.recalculate();
        self.status_processor.process(&status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::RecordingScaleUpStatusProcessor;
    use kubescale_cloud::{CloudProviderError, NodeGroup, TestCloudProvider, TestNodeGroupSpec};
    use kubescale_clusterstate::ClusterStateConfig;
    use kubescale_core::{AutoscalerError, ErrorKind, LogEventRecorder, Node, ResourceList};
    use kubescale_metrics::AutoscalerMetrics;

    fn template() -> NodeInfo {
        NodeInfo::new(Node::new("t", ResourceList::cpu_memory(1000, 1 << 30)))
    }

    fn initializer(
        provider: &Arc<TestCloudProvider>,
        group: NodeGroupRef,
        statuses: Arc<RecordingScaleUpStatusProcessor>,
    ) -> AsyncNodeGroupInitializer {
        let registry = Arc::new(ClusterStateRegistry::new(
            provider.clone(),
            ClusterStateConfig::default(),
        ));
        let executor = ScaleUpExecutor::new(
            provider.clone(),
            registry.clone(),
            Arc::new(LogEventRecorder),
            Arc::new(AutoscalerMetrics::new()),
            false,
        );
        AsyncNodeGroupInitializer::new(group, template(), executor, registry, statuses, false)
    }

    #[tokio::test]
    async fn scales_created_group_to_preset_target() {
        let provider = Arc::new(TestCloudProvider::new());
        let placeholder: NodeGroupRef = provider.add_node_group(
            TestNodeGroupSpec::new("ng-new", 0, 10, 0)
                .not_existing()
                .with_template(template()),
        );
        let statuses = Arc::new(RecordingScaleUpStatusProcessor::new());
        let initializer = initializer(&provider, placeholder.clone(), statuses.clone());
        initializer.target_sizes().set("ng-new", 4);

        let created = placeholder.create().map_err(AutoscalerError::from);
        initializer.initialize(created).await;

        let status = statuses.last().unwrap();
        assert_eq!(status.result, ScaleUpResult::Successful);
        assert_eq!(status.scale_up_infos.len(), 1);
        assert_eq!(status.scale_up_infos[0].new_size, 4);
        assert_eq!(provider.increases(), vec![("ng-new".to_string(), 4)]);
        assert_eq!(provider.group("ng-new").unwrap().target_size().unwrap(), 4);
    }

    #[tokio::test]
    async fn failed_creation_is_published_as_error() {
        let provider = Arc::new(TestCloudProvider::new());
        let placeholder: NodeGroupRef =
            provider.add_node_group(TestNodeGroupSpec::new("ng-new", 0, 10, 0).not_existing());
        let statuses = Arc::new(RecordingScaleUpStatusProcessor::new());
        let initializer = initializer(&provider, placeholder, statuses.clone());

        initializer
            .initialize(Err(AutoscalerError::from(CloudProviderError::Provider(
                "quota".to_string(),
            ))))
            .await;

        let status = statuses.last().unwrap();
        assert_eq!(status.result, ScaleUpResult::Error);
        assert_eq!(status.scale_up_error.map(|e| e.kind), Some(ErrorKind::CloudProvider));
        assert_eq!(status.failed_creation_node_groups[0].id(), "ng-new");
        assert!(provider.increases().is_empty());
    }
}
