//! kubescale-simulator — what-if scheduling.
//!
//! The scale-up path never touches the real cluster. It asks "would this
//! pod fit on a node like that?" against an in-memory [`ClusterSnapshot`],
//! always inside a fork/revert bracket ([`ForkGuard`]).
//!
//! # Architecture
//!
//! ```text
//! BasicClusterSnapshot      layered NodeInfo store, fork / revert / commit
//!   └── ForkGuard           reverts on drop unless committed
//! SchedulerPredicateChecker resources, selectors, taints, ports, anti-affinity
//! template                  sanitised per-group template NodeInfos (+ daemon pods)
//! estimator
//!   ├── BinpackingEstimator first-fit over pod groups on template copies
//!   ├── DecreasingPodOrderer
//!   └── ThresholdBasedEstimationLimiter
//!         ├── StaticThreshold
//!         ├── SimilarNodeGroupsCapacityThreshold
//!         └── ClusterCapacityThreshold
//! ```

pub mod estimator;
pub mod predicates;
pub mod snapshot;
pub mod template;

pub use estimator::{
    BinpackingEstimator, BinpackingEstimatorBuilder, Estimate, EstimationContext,
    EstimationLimiter, Estimator, EstimatorBuilder,
};
pub use predicates::{PredicateChecker, SchedulerPredicateChecker, SchedulingError};
pub use snapshot::{BasicClusterSnapshot, ClusterSnapshot, ForkGuard, SnapshotError, SnapshotResult};
pub use template::{TaintConfig, node_info_copy, sanitized_template_node_info, template_node_info_from_node_group};
