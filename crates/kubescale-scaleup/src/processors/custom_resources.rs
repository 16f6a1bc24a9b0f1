//! Custom (non cpu/memory) resources a node contributes, for limits.

use kubescale_cloud::{CloudProvider, NodeGroup};
use kubescale_core::resources::NVIDIA_GPU;
use kubescale_core::{AutoscalerError, AutoscalerResult, ErrorKind, Node};
use tracing::warn;

/// `resource_count` units of `resource_type` on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomResourceTarget {
    pub resource_type: String,
    pub resource_count: i64,
}

pub trait CustomResourcesProcessor: Send + Sync {
    /// Custom resources `node` has, or will have once its drivers are up.
    /// `node_group` is `None` for nodes outside autoscaled groups.
    fn node_resource_targets(
        &self,
        provider: &dyn CloudProvider,
        node: &Node,
        node_group: Option<&dyn NodeGroup>,
    ) -> AutoscalerResult<Vec<CustomResourceTarget>>;
}

/// Counts GPUs per GPU type. A node labelled with a GPU type whose
/// devices are not allocatable yet is sized from its group's template.
#[derive(Debug, Default, Clone)]
pub struct GpuCustomResourcesProcessor;

impl CustomResourcesProcessor for GpuCustomResourcesProcessor {
    fn node_resource_targets(
        &self,
        provider: &dyn CloudProvider,
        node: &Node,
        node_group: Option<&dyn NodeGroup>,
    ) -> AutoscalerResult<Vec<CustomResourceTarget>> {
        let Some(gpu_type) = node.labels.get(provider.gpu_label()) else {
            return Ok(Vec::new());
        };
        let allocatable = node.allocatable.get(NVIDIA_GPU);
        if allocatable > 0 {
            return Ok(vec![CustomResourceTarget {
                resource_type: gpu_type.clone(),
                resource_count: allocatable,
            }]);
        }
        let Some(group) = node_group else {
            return Ok(Vec::new());
        };
        let template = group
            .template_node_info()
            .map_err(|e| AutoscalerError::from_error(ErrorKind::CloudProvider, e))?;
        let capacity = template.node.capacity.get(NVIDIA_GPU);
        if capacity > 0 {
            return Ok(vec![CustomResourceTarget {
                resource_type: gpu_type.clone(),
                resource_count: capacity,
            }]);
        }
        warn!(
            node = %node.name,
            node_group = %group.id(),
            "node has a gpu label but its template defines no gpus"
        );
        Ok(Vec::new())
    }
}
