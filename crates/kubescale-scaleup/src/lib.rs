//! kubescale-scaleup — deciding and executing node group scale-ups.
//!
//! # Architecture
//!
//! ```text
//! ScaleUpOrchestrator::scale_up(pods, nodes, daemon sets, templates)
//!   ├── equivalence     pods → equivalence groups (one exemplar each)
//!   ├── filter          backoff / health / max size / zero-or-max / limits
//!   ├── simulate        exemplar vs template, inside a snapshot fork
//!   ├── estimate        EstimatorBuilder → nodes needed per group
//!   ├── expander        MostPods | LeastNodes | LeastWaste → best option
//!   ├── node cap + resource limits (ResourceManager)
//!   ├── creation        NodeGroupManager, inline or background
//!   │                     └── AsyncNodeGroupInitializer (initial resize)
//!   ├── nodegroupset    similar groups + balancing
//!   └── executor        sequential or parallel resizes
//!                         → ClusterStateRegistry, metrics, events
//!
//! ScaleUpStatus ──► ScaleUpStatusProcessor (events per pod)
//! ```

pub mod context;
pub mod equivalence;
pub mod executor;
pub mod expander;
pub mod initializer;
pub mod nodegroupset;
pub mod orchestrator;
pub mod processors;
pub mod reasons;
pub mod resource;
pub mod status;

pub use context::AutoscalingContext;
pub use equivalence::{PodEquivalenceGroup, build_pod_equivalence_groups};
pub use executor::{ScaleUpExecutor, ScaleUpFailure, combine_concurrent_scale_up_errors};
pub use expander::{ExpansionOption, Strategy, strategy_from_name};
pub use initializer::{AsyncNodeGroupInitializer, TargetSizes};
pub use nodegroupset::{NodeGroupSetProcessor, ScaleUpInfo};
pub use orchestrator::ScaleUpOrchestrator;
pub use processors::AutoscalingProcessors;
pub use reasons::Reasons;
pub use resource::{Delta, Limits, ResourceManager};
pub use status::{NoScaleUpInfo, ScaleUpResult, ScaleUpStatus, ScaleUpStatusSummary};
