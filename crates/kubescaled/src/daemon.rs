//! The reconciliation loop.
//!
//! Each iteration refreshes cluster state and templates, runs a scale-up
//! for the pending pods and a scale-up to minimum sizes, then plays the
//! cloud: requested nodes join, and pending pods are bound to any node
//! with room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kubescale_cloud::{CloudProvider, TestCloudProvider};
use kubescale_clusterstate::{ClusterStateConfig, ClusterStateRegistry, TemplateNodeInfoCache};
use kubescale_core::labels::HOSTNAME;
use kubescale_core::{AutoscalingOptions, DaemonSet, EventRecorder, LogEventRecorder, Node, PodRef};
use kubescale_metrics::{AutoscalerMetrics, render_prometheus};
use kubescale_scaleup::processors::{ProviderNodeGroupManager, ScaleUpStatusProcessor, UpcomingNodeGroups};
use kubescale_scaleup::{AutoscalingContext, AutoscalingProcessors, ScaleUpOrchestrator, ScaleUpStatusSummary};
use kubescale_simulator::{
    BasicClusterSnapshot, BinpackingEstimatorBuilder, ClusterSnapshot, PredicateChecker, SchedulerPredicateChecker,
    TaintConfig,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::fixture::Cluster;

/// What one iteration did, printed as a JSON line.
#[derive(Debug, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub scale_up: ScaleUpStatusSummary,
    pub min_size_scale_up: ScaleUpStatusSummary,
    pub nodes: usize,
    pub pending_pods: usize,
}

pub struct Daemon {
    provider: Arc<TestCloudProvider>,
    registry: Arc<ClusterStateRegistry>,
    node_info_cache: TemplateNodeInfoCache,
    taint_config: TaintConfig,
    checker: Arc<dyn PredicateChecker>,
    metrics: Arc<AutoscalerMetrics>,
    manager: Arc<ProviderNodeGroupManager>,
    status_processor: Arc<dyn ScaleUpStatusProcessor>,
    orchestrator: ScaleUpOrchestrator,
    nodes: Vec<Node>,
    scheduled: Vec<PodRef>,
    pending: Vec<PodRef>,
    daemon_sets: Vec<DaemonSet>,
}

impl Daemon {
    pub fn new(options: AutoscalingOptions, cluster: Cluster) -> anyhow::Result<Self> {
        options.validate()?;
        let provider: Arc<dyn CloudProvider> = cluster.provider.clone();
        let metrics = Arc::new(AutoscalerMetrics::new());
        let recorder: Arc<dyn EventRecorder> = Arc::new(LogEventRecorder);
        let checker: Arc<dyn PredicateChecker> = Arc::new(SchedulerPredicateChecker::new());

        let registry = Arc::new(ClusterStateRegistry::new(
            provider.clone(),
            ClusterStateConfig::from_options(&options)?,
        ));
        let manager = Arc::new(ProviderNodeGroupManager::new(
            metrics.clone(),
            Arc::new(UpcomingNodeGroups::new()),
        ));
        let processors = AutoscalingProcessors::from_options(&options, recorder.clone(), manager.clone())?;
        let status_processor = processors.scale_up_status.clone();
        let estimator = Arc::new(BinpackingEstimatorBuilder::from_options(checker.clone(), &options)?);
        let taint_config = TaintConfig::from_options(&options);
        let node_info_cache = TemplateNodeInfoCache::new(options.node_info_cache_ttl()?);

        let context = AutoscalingContext::new(options, provider, checker.clone(), recorder, metrics.clone())?;
        let mut orchestrator = ScaleUpOrchestrator::new();
        orchestrator.initialize(context, processors, registry.clone(), estimator, taint_config.clone());
        info!(
            node_groups = cluster.provider.node_groups().len(),
            nodes = cluster.nodes.len(),
            pending = cluster.pending.len(),
            "daemon initialized"
        );

        Ok(Self {
            provider: cluster.provider,
            registry,
            node_info_cache,
            taint_config,
            checker,
            metrics,
            manager,
            status_processor,
            orchestrator,
            nodes: cluster.nodes,
            scheduled: Vec::new(),
            pending: cluster.pending,
            daemon_sets: cluster.daemon_sets,
        })
    }

    /// Run `iterations` iterations (forever when `None`), `interval` apart,
    /// printing one report per iteration.
    pub async fn run(
        &mut self,
        iterations: Option<usize>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(interval_secs = interval.as_secs(), "reconciliation loop started");
        let mut iteration = 0;
        loop {
            iteration += 1;
            let report = self.run_once(iteration).await?;
            println!("{}", serde_json::to_string(&report)?);
            if iterations.is_some_and(|n| iteration >= n) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    info!("reconciliation loop shutting down");
                    break;
                }
            }
        }
        self.manager.drain().await;
        Ok(())
    }

    pub async fn run_once(&mut self, iteration: usize) -> anyhow::Result<IterationReport> {
        let now = Instant::now();
        self.registry.update(&self.nodes, now)?;
        let node_infos = self.node_info_cache.process(
            self.provider.as_ref(),
            &self.nodes,
            &self.scheduled,
            &self.daemon_sets,
            &self.taint_config,
            now,
        )?;
        if let Some(context) = self.orchestrator.context_mut() {
            context.cluster_snapshot = Box::new(BasicClusterSnapshot::from_cluster(&self.nodes, &self.scheduled)?);
        }

        let scale_up = self
            .orchestrator
            .scale_up(&self.pending, &self.nodes, &self.daemon_sets, node_infos.clone(), false)
            .await;
        self.status_processor.process(&scale_up);
        let min_size = self
            .orchestrator
            .scale_up_to_node_group_min_size(&self.nodes, &node_infos)
            .await;

        self.register_requested_nodes();
        self.schedule_pending()?;

        Ok(IterationReport {
            iteration,
            scale_up: scale_up.summary(),
            min_size_scale_up: min_size.summary(),
            nodes: self.nodes.len(),
            pending_pods: self.pending.len(),
        })
    }

    /// Prometheus exposition of everything recorded so far.
    pub fn render_metrics(&self) -> String {
        render_prometheus(&self.metrics.snapshot())
    }

    /// Bring up a node for every requested but missing one, built from the
    /// group's template.
    fn register_requested_nodes(&mut self) {
        let mut registered: HashMap<String, usize> = HashMap::new();
        for node in &self.nodes {
            if let Ok(Some(group)) = self.provider.node_group_for_node(node) {
                *registered.entry(group.id()).or_default() += 1;
            }
        }

        for group in self.provider.node_groups() {
            if !group.exist() {
                continue;
            }
            let id = group.id();
            let Ok(target) = group.target_size() else {
                continue;
            };
            let have = registered.get(&id).copied().unwrap_or(0);
            if target <= have {
                continue;
            }
            let template = match group.template_node_info() {
                Ok(template) => template,
                Err(e) => {
                    warn!(node_group = %id, error = %e, "no template to bring up nodes from");
                    continue;
                }
            };
            for index in have..target {
                let name = format!("{id}-{index}");
                let mut node = template.node.clone();
                node.labels.insert(HOSTNAME.to_string(), name.clone());
                node.provider_id = name.clone();
                node.name = name;
                self.provider.add_node(&id, &node);
                self.nodes.push(node);
            }
            info!(node_group = %id, added = target - have, "nodes joined the cluster");
        }
    }

    /// Bind pending pods first-fit onto the current nodes.
    fn schedule_pending(&mut self) -> anyhow::Result<()> {
        let mut snapshot = BasicClusterSnapshot::from_cluster(&self.nodes, &self.scheduled)?;
        let mut unscheduled = Vec::new();
        for pod in std::mem::take(&mut self.pending) {
            let target = self
                .nodes
                .iter()
                .map(|n| n.name.as_str())
                .find(|name| self.checker.check_predicates(&snapshot, &pod, name).is_ok())
                .map(str::to_string);
            let Some(node_name) = target else {
                unscheduled.push(pod);
                continue;
            };
            let mut bound = (*pod).clone();
            bound.spec.node_name = Some(node_name.clone());
            let bound: PodRef = Arc::new(bound);
            snapshot.add_pod(bound.clone(), &node_name)?;
            debug!(pod = %bound.key(), node = %node_name, "pod scheduled");
            self.scheduled.push(bound);
        }
        self.pending = unscheduled;
        Ok(())
    }
}
