//! Pluggable policies the orchestrator consults.

mod async_state;
mod binpacking_limiter;
mod custom_resources;
mod node_group_manager;
mod status;

use std::sync::Arc;

use kubescale_core::{AutoscalingOptions, ConfigError, EventRecorder};

pub use async_state::{AsyncNodeGroupStateChecker, UpcomingNodeGroups};
pub use binpacking_limiter::{BinpackingLimiter, NoOpBinpackingLimiter, TimeLimitedBinpackingLimiter};
pub use custom_resources::{CustomResourceTarget, CustomResourcesProcessor, GpuCustomResourcesProcessor};
pub use node_group_manager::{NodeGroupManager, ProviderNodeGroupManager};
pub use status::{
    CombinedScaleUpStatusProcessor, EventingScaleUpStatusProcessor, NOT_TRIGGER_SCALE_UP,
    NoOpScaleUpStatusProcessor, RecordingScaleUpStatusProcessor, ScaleUpStatusProcessor,
    TRIGGERED_SCALE_UP,
};

use crate::nodegroupset::{BalancingNodeGroupSetProcessor, NodeGroupSetProcessor, comparator_from_options};

/// Every policy the orchestrator consults, in one bundle.
pub struct AutoscalingProcessors {
    pub node_group_set: Box<dyn NodeGroupSetProcessor>,
    pub scale_up_status: Arc<dyn ScaleUpStatusProcessor>,
    pub node_group_manager: Arc<dyn NodeGroupManager>,
    pub async_node_group_state_checker: Arc<dyn AsyncNodeGroupStateChecker>,
    pub binpacking_limiter: Box<dyn BinpackingLimiter>,
    pub custom_resources: Arc<dyn CustomResourcesProcessor>,
}

impl AutoscalingProcessors {
    /// The standard set: balancing by template similarity, eventing status
    /// processor, provider-backed group creation and a time-limited
    /// binpacking budget.
    pub fn from_options(
        options: &AutoscalingOptions,
        event_recorder: Arc<dyn EventRecorder>,
        node_group_manager: Arc<ProviderNodeGroupManager>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            node_group_set: Box::new(BalancingNodeGroupSetProcessor::new(comparator_from_options(options))),
            scale_up_status: Arc::new(EventingScaleUpStatusProcessor::new(event_recorder)),
            async_node_group_state_checker: node_group_manager.upcoming(),
            node_group_manager,
            binpacking_limiter: Box::new(TimeLimitedBinpackingLimiter::new(options.max_binpacking_time()?)),
            custom_resources: Arc::new(GpuCustomResourcesProcessor),
        })
    }
}
