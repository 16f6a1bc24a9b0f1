//! kubescale-core — shared types for the kubescale autoscaler.
//!
//! Everything the scale-up path reasons about lives here: pods and their
//! scheduling-relevant spec, nodes and template `NodeInfo`s, resource
//! lists, the structured `AutoscalerError`, the event recorder seam and
//! the `AutoscalingOptions` configuration.
//!
//! # Units
//!
//! Resource lists store signed 64-bit integers: `cpu` in millicores,
//! `memory` in bytes, everything else (pods, GPUs, extended resources)
//! as plain counts.

pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod node_info;
pub mod pod;
pub mod resources;

pub use config::{AutoscalingOptions, ConfigError, NodeGroupAutoscalingOptions, ResourceLimitsConfig};
pub use error::{AutoscalerError, AutoscalerResult, ErrorKind};
pub use events::{EventKind, EventRecorder, LogEventRecorder, RecordedEvent, RecordingEventRecorder};
pub use node::{Node, Taint, TaintEffect};
pub use node_info::NodeInfo;
pub use pod::{
    Affinity, Container, ContainerPort, DaemonSet, NodeSelectorOperator, NodeSelectorRequirement,
    OwnerReference, Pod, PodAffinityTerm, PodRef, PodSpec, PodStatus, Toleration,
    TolerationOperator, Volume, VolumeMount, VolumeSource,
};
pub use resources::ResourceList;

/// Well-known node label keys.
pub mod labels {
    pub const HOSTNAME: &str = "kubernetes.io/hostname";
    pub const TOPOLOGY_ZONE: &str = "topology.kubernetes.io/zone";
    pub const TOPOLOGY_REGION: &str = "topology.kubernetes.io/region";
    pub const ZONE_FAILURE_DOMAIN_BETA: &str = "failure-domain.beta.kubernetes.io/zone";
    pub const ZONE_REGION_BETA: &str = "failure-domain.beta.kubernetes.io/region";
    pub const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
    pub const ACCELERATOR: &str = "cloud.google.com/gke-accelerator";
}
