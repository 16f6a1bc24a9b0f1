//! Creating node groups, inline or in the background.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kubescale_cloud::{CreateNodeGroupResult, NodeGroupRef};
use kubescale_core::{AutoscalerError, AutoscalerResult};
use kubescale_metrics::AutoscalerMetrics;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::async_state::UpcomingNodeGroups;
use crate::initializer::AsyncNodeGroupInitializer;

pub trait NodeGroupManager: Send + Sync {
    /// Create `node_group` and wait for the provider.
    fn create_node_group(&self, node_group: &NodeGroupRef) -> AutoscalerResult<CreateNodeGroupResult>;

    /// Start creating `node_group` and return at once with a result
    /// naming the placeholder. `initializer` runs once the provider is
    /// done.
    fn create_node_group_async(
        &self,
        node_group: &NodeGroupRef,
        initializer: AsyncNodeGroupInitializer,
    ) -> AutoscalerResult<CreateNodeGroupResult>;
}

fn creation_error(node_group_id: &str, err: impl Into<AutoscalerError>) -> AutoscalerError {
    err.into()
        .add_prefix(format!("failed to create node group {node_group_id}: "))
}

/// Creates groups through the provider. Background creations run on the
/// current tokio runtime; the group counts as upcoming until its
/// initializer has finished.
pub struct ProviderNodeGroupManager {
    metrics: Arc<AutoscalerMetrics>,
    upcoming: Arc<UpcomingNodeGroups>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ProviderNodeGroupManager {
    pub fn new(metrics: Arc<AutoscalerMetrics>, upcoming: Arc<UpcomingNodeGroups>) -> Self {
        Self {
            metrics,
            upcoming,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upcoming(&self) -> Arc<UpcomingNodeGroups> {
        self.upcoming.clone()
    }

    /// Wait for every background creation started so far.
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut *self.pending());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "async node group creation task failed");
            }
        }
    }
}

impl NodeGroupManager for ProviderNodeGroupManager {
    fn create_node_group(&self, node_group: &NodeGroupRef) -> AutoscalerResult<CreateNodeGroupResult> {
        let id = node_group.id();
        let result = node_group.create().map_err(|e| creation_error(&id, e))?;
        self.metrics.register_node_group_creation();
        info!(node_group = %id, extra = result.extra_created.len(), "node group created");
        Ok(result)
    }

    fn create_node_group_async(
        &self,
        node_group: &NodeGroupRef,
        initializer: AsyncNodeGroupInitializer,
    ) -> AutoscalerResult<CreateNodeGroupResult> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            AutoscalerError::internal(format!("async node group creation needs a tokio runtime: {e}"))
        })?;
        let id = node_group.id();
        self.upcoming.register(&id);

        let group = node_group.clone();
        let metrics = self.metrics.clone();
        let upcoming = self.upcoming.clone();
        let task_id = id.clone();
        let task = runtime.spawn(async move {
            let created = tokio::task::spawn_blocking(move || group.create()).await;
            let result = match created {
                Ok(Ok(result)) => {
                    metrics.register_node_group_creation();
                    info!(node_group = %task_id, "node group created asynchronously");
                    Ok(result)
                }
                Ok(Err(e)) => Err(creation_error(&task_id, e)),
                Err(e) => Err(creation_error(
                    &task_id,
                    AutoscalerError::internal(format!("creation task failed: {e}")),
                )),
            };
            initializer.initialize(result).await;
            upcoming.remove(&task_id);
        });

        let mut pending = self.pending();
        pending.retain(|handle| !handle.is_finished());
        pending.push(task);
        info!(node_group = %id, "async node group creation started");
        Ok(CreateNodeGroupResult::new(node_group.clone()))
    }
}
