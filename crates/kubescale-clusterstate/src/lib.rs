//! kubescale-clusterstate — what the autoscaler remembers between ticks.
//!
//! # Architecture
//!
//! ```text
//! ClusterStateRegistry (Arc-shared, one internal lock)
//!   ├── update(nodes, now)          per-group readiness + upcoming nodes
//!   ├── register_scale_up()         ← executor, on success
//!   ├── register_failed_scale_up()  ← executor, on failure → backoff
//!   ├── node_group_scaling_safety() → healthy? backed off?
//!   └── recalculate()               after a scale-up or creation
//!
//! ExponentialBackoff                initial → ×2 → max, reset after quiet period
//!
//! TemplateNodeInfoCache             group id → template NodeInfo, TTL-bound
//! ```

pub mod backoff;
pub mod node_info_cache;
pub mod registry;

pub use backoff::{BackoffStatus, ExponentialBackoff};
pub use node_info_cache::TemplateNodeInfoCache;
pub use registry::{ClusterStateConfig, ClusterStateRegistry, FailedScaleUp, NodeGroupScalingSafety, ScaleUpRequest};
