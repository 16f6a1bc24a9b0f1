//! kubescale-cloud — the cloud provider seam.
//!
//! The autoscaler never talks to a cloud directly. It sees a
//! [`CloudProvider`] exposing [`NodeGroup`] handles, a [`ResourceLimiter`]
//! and GPU metadata. Real providers live outside this workspace; the
//! in-memory [`TestCloudProvider`] backs tests and the daemon's fixture
//! mode.
//!
//! # Architecture
//!
//! ```text
//! CloudProvider
//!   ├── node_groups()          → Vec<NodeGroupRef>  (provider order)
//!   ├── node_group_for_node()  → Option<NodeGroupRef>
//!   ├── resource_limiter()     → ResourceLimiter {min, max}
//!   └── gpu_label / node_gpu_config / available_gpu_types
//!
//! NodeGroup (Arc<dyn NodeGroup>)
//!   ├── id / exist / min_size / max_size / target_size
//!   ├── increase_size / atomic_increase_size
//!   ├── template_node_info / get_options
//!   └── create / delete          (auto-provisioned groups)
//! ```

pub mod error;
pub mod gpu;
pub mod limiter;
pub mod provider;
pub mod test_provider;

pub use error::{CloudProviderError, CloudProviderResult};
pub use gpu::{GpuConfig, gpu_info_for_metrics};
pub use limiter::{ResourceLimiter, RESOURCE_CORES, RESOURCE_MEMORY};
pub use provider::{CloudProvider, CreateNodeGroupResult, NodeGroup, NodeGroupRef};
pub use test_provider::{TestCloudProvider, TestNodeGroup, TestNodeGroupSpec};
