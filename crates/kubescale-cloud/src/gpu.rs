//! GPU metadata used for resource accounting and metric labels.

use std::collections::BTreeSet;

use kubescale_core::Node;
use kubescale_core::resources::NVIDIA_GPU;

/// Metric label when the node advertises GPUs but has no type label.
pub const METRICS_MISSING_GPU: &str = "missing-gpu";
/// Metric label when the type label is not one the provider knows.
pub const METRICS_UNKNOWN_GPU: &str = "unknown-gpu";

/// How GPUs appear on a node: the label carrying the GPU type and the
/// extended resource counting the devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub label: String,
    pub gpu_type: String,
    pub extended_resource_name: String,
}

/// Build the GPU config of `node`, if it has GPU capacity or a GPU type
/// label.
pub fn gpu_config_from_node(gpu_label: &str, node: &Node) -> Option<GpuConfig> {
    let gpu_type = node.labels.get(gpu_label);
    let has_capacity = node.capacity.get(NVIDIA_GPU) > 0;
    if gpu_type.is_none() && !has_capacity {
        return None;
    }
    Some(GpuConfig {
        label: gpu_label.to_string(),
        gpu_type: gpu_type.cloned().unwrap_or_default(),
        extended_resource_name: NVIDIA_GPU.to_string(),
    })
}

/// `(gpu_resource_name, gpu_type)` labels for scale-up metrics. Empty
/// strings when the node has no GPUs.
pub fn gpu_info_for_metrics(
    config: Option<&GpuConfig>,
    available_gpu_types: &BTreeSet<String>,
    node: &Node,
) -> (String, String) {
    let Some(config) = config else {
        return (String::new(), String::new());
    };
    let resource = config.extended_resource_name.clone();
    match node.labels.get(&config.label) {
        None => (resource, METRICS_MISSING_GPU.to_string()),
        Some(gpu_type) if available_gpu_types.contains(gpu_type) => (resource, gpu_type.clone()),
        Some(_) => (resource, METRICS_UNKNOWN_GPU.to_string()),
    }
}
