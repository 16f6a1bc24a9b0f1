//! Everything a scale-up needs to know about the world.

use std::sync::Arc;

use kubescale_cloud::CloudProvider;
use kubescale_core::{AutoscalingOptions, ConfigError, EventRecorder};
use kubescale_metrics::AutoscalerMetrics;
use kubescale_simulator::{BasicClusterSnapshot, ClusterSnapshot, PredicateChecker};

use crate::expander::{Strategy, strategy_from_name};

pub struct AutoscalingContext {
    pub options: AutoscalingOptions,
    pub cloud_provider: Arc<dyn CloudProvider>,
    /// Current cluster; only ever mutated under a fork.
    pub cluster_snapshot: Box<dyn ClusterSnapshot>,
    pub predicate_checker: Arc<dyn PredicateChecker>,
    pub expander: Box<dyn Strategy>,
    pub event_recorder: Arc<dyn EventRecorder>,
    pub metrics: Arc<AutoscalerMetrics>,
}

impl AutoscalingContext {
    /// A context with an empty snapshot and the expander named in
    /// `options`.
    pub fn new(
        options: AutoscalingOptions,
        cloud_provider: Arc<dyn CloudProvider>,
        predicate_checker: Arc<dyn PredicateChecker>,
        event_recorder: Arc<dyn EventRecorder>,
        metrics: Arc<AutoscalerMetrics>,
    ) -> Result<Self, ConfigError> {
        let expander = strategy_from_name(&options.expander)?;
        Ok(Self {
            options,
            cloud_provider,
            cluster_snapshot: Box::new(BasicClusterSnapshot::new()),
            predicate_checker,
            expander,
            event_recorder,
            metrics,
        })
    }
}
