//! Provider and node-group capability traits.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use kubescale_core::{Node, NodeGroupAutoscalingOptions, NodeInfo};

use crate::error::{CloudProviderError, CloudProviderResult};
use crate::gpu::{GpuConfig, gpu_config_from_node};
use crate::limiter::ResourceLimiter;

pub type NodeGroupRef = Arc<dyn NodeGroup>;

/// A provider-managed pool of identically templated nodes.
///
/// Methods may block on provider RPCs. Implementations are shared by
/// concurrent executor workers.
pub trait NodeGroup: Send + Sync + fmt::Debug {
    fn id(&self) -> String;

    /// False for auto-provisioned groups that have not been created yet.
    fn exist(&self) -> bool;

    fn min_size(&self) -> usize;

    fn max_size(&self) -> usize;

    fn target_size(&self) -> CloudProviderResult<usize>;

    fn increase_size(&self, delta: usize) -> CloudProviderResult<()>;

    /// Increase the size in one all-or-nothing request.
    fn atomic_increase_size(&self, _delta: usize) -> CloudProviderResult<()> {
        Err(CloudProviderError::NotImplemented)
    }

    /// A node info describing a node this group would create.
    fn template_node_info(&self) -> CloudProviderResult<NodeInfo>;

    /// Group-specific options, or `None` to use `defaults`.
    fn get_options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> CloudProviderResult<Option<NodeGroupAutoscalingOptions>> {
        Err(CloudProviderError::NotImplemented)
    }

    /// Names of the nodes currently belonging to this group.
    fn nodes(&self) -> CloudProviderResult<Vec<String>>;

    /// Create a group that does not exist yet.
    fn create(&self) -> CloudProviderResult<CreateNodeGroupResult> {
        Err(CloudProviderError::NotImplemented)
    }

    fn delete(&self) -> CloudProviderResult<()> {
        Err(CloudProviderError::NotImplemented)
    }

    fn autoprovisioned(&self) -> bool {
        false
    }
}

/// Outcome of creating a node group. Creating one group may bring extra
/// groups with it (for example one per zone).
#[derive(Clone)]
pub struct CreateNodeGroupResult {
    pub main_created: NodeGroupRef,
    pub extra_created: Vec<NodeGroupRef>,
    /// Sizes the created groups should be scaled to once they exist.
    /// Empty when the creator leaves sizing to the caller.
    pub target_sizes: HashMap<String, usize>,
}

impl CreateNodeGroupResult {
    pub fn new(main_created: NodeGroupRef) -> Self {
        Self {
            main_created,
            extra_created: Vec::new(),
            target_sizes: HashMap::new(),
        }
    }

    /// Main group followed by the extra groups.
    pub fn all_created(&self) -> impl Iterator<Item = &NodeGroupRef> {
        std::iter::once(&self.main_created).chain(self.extra_created.iter())
    }
}

impl fmt::Debug for CreateNodeGroupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateNodeGroupResult")
            .field("main_created", &self.main_created.id())
            .field(
                "extra_created",
                &self.extra_created.iter().map(|g| g.id()).collect::<Vec<_>>(),
            )
            .field("target_sizes", &self.target_sizes)
            .finish()
    }
}

pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// All node groups, in provider-defined order.
    fn node_groups(&self) -> Vec<NodeGroupRef>;

    /// The group owning `node`, or `None` for nodes that are not autoscaled.
    fn node_group_for_node(&self, node: &Node) -> CloudProviderResult<Option<NodeGroupRef>>;

    fn resource_limiter(&self) -> CloudProviderResult<ResourceLimiter>;

    /// Label carrying the GPU type on GPU nodes.
    fn gpu_label(&self) -> &str;

    fn available_gpu_types(&self) -> BTreeSet<String>;

    fn node_gpu_config(&self, node: &Node) -> Option<GpuConfig> {
        gpu_config_from_node(self.gpu_label(), node)
    }
}
