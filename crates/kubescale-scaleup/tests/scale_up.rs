//! End-to-end scale-up runs against the in-memory provider.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use kubescale_cloud::{CloudProvider, NodeGroup, ResourceLimiter, TestCloudProvider, TestNodeGroupSpec};
use kubescale_clusterstate::{ClusterStateConfig, ClusterStateRegistry};
use kubescale_core::{
    AutoscalingOptions, Container, ErrorKind, Node, NodeInfo, Pod, PodRef, PodSpec, RecordingEventRecorder,
    ResourceList,
};
use kubescale_metrics::AutoscalerMetrics;
use kubescale_scaleup::expander::ExpansionOption;
use kubescale_scaleup::nodegroupset::{BalancingNodeGroupSetProcessor, GenericNodeInfoComparator};
use kubescale_scaleup::orchestrator::MAX_NODES_TOTAL_REACHED;
use kubescale_scaleup::processors::{
    GpuCustomResourcesProcessor, NoOpBinpackingLimiter, ProviderNodeGroupManager, RecordingScaleUpStatusProcessor,
    UpcomingNodeGroups,
};
use kubescale_scaleup::{
    AutoscalingContext, AutoscalingProcessors, Reasons, ScaleUpOrchestrator, ScaleUpResult, ScaleUpStatus, Strategy,
};
use kubescale_simulator::{BinpackingEstimatorBuilder, SchedulerPredicateChecker, TaintConfig};

/// Picks the option for one node group, or the first option when that
/// group has none.
struct PickGroup(&'static str);

impl Strategy for PickGroup {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        _node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        options
            .iter()
            .find(|o| o.node_group.id() == self.0)
            .or_else(|| options.first())
            .cloned()
    }
}

fn build_test_pod(name: &str, cpu: i64, memory: i64) -> PodRef {
    Arc::new(Pod {
        uid: name.to_string(),
        namespace: "default".to_string(),
        name: name.to_string(),
        spec: PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                requests: ResourceList::cpu_memory(cpu, memory),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    })
}

fn build_test_node(name: &str, cpu: i64, memory: i64) -> Node {
    Node::new(name, ResourceList::cpu_memory(cpu, memory))
}

struct Group {
    spec: TestNodeGroupSpec,
    cpu: i64,
    memory: i64,
}

fn group(spec: TestNodeGroupSpec, cpu: i64, memory: i64) -> Group {
    Group { spec, cpu, memory }
}

struct Harness {
    provider: Arc<TestCloudProvider>,
    registry: Arc<ClusterStateRegistry>,
    events: Arc<RecordingEventRecorder>,
    metrics: Arc<AutoscalerMetrics>,
    statuses: Arc<RecordingScaleUpStatusProcessor>,
    manager: Arc<ProviderNodeGroupManager>,
    orchestrator: ScaleUpOrchestrator,
    nodes: Vec<Node>,
    node_infos: HashMap<String, NodeInfo>,
}

impl Harness {
    /// Every existing group gets `target_size` registered nodes built from
    /// its template.
    fn new(
        options: AutoscalingOptions,
        provider: TestCloudProvider,
        groups: Vec<Group>,
        expander: Option<Box<dyn Strategy>>,
    ) -> Self {
        let provider = Arc::new(provider);
        let mut nodes = Vec::new();
        let mut node_infos = HashMap::new();
        for Group { spec, cpu, memory } in groups {
            let id = spec.id.clone();
            let template = build_test_node(&format!("{id}-template"), cpu, memory);
            let exist = spec.exist;
            let target = spec.target_size;
            provider.add_node_group(spec.with_template(NodeInfo::new(template.clone())));
            node_infos.insert(id.clone(), NodeInfo::new(template));
            if !exist {
                continue;
            }
            for i in 0..target {
                let node = build_test_node(&format!("{id}-{i}"), cpu, memory);
                provider.add_node(&id, &node);
                nodes.push(node);
            }
        }

        let dyn_provider: Arc<dyn CloudProvider> = provider.clone();
        let registry = Arc::new(ClusterStateRegistry::new(dyn_provider.clone(), ClusterStateConfig::default()));
        registry.update(&nodes, Instant::now()).expect("registry update");

        let events = Arc::new(RecordingEventRecorder::new());
        let metrics = Arc::new(AutoscalerMetrics::new());
        let statuses = Arc::new(RecordingScaleUpStatusProcessor::new());
        let manager = Arc::new(ProviderNodeGroupManager::new(
            metrics.clone(),
            Arc::new(UpcomingNodeGroups::new()),
        ));
        let checker = Arc::new(SchedulerPredicateChecker::new());

        let estimator = Arc::new(BinpackingEstimatorBuilder::from_options(checker.clone(), &options).expect("estimator"));
        let mut context = AutoscalingContext::new(options, dyn_provider, checker, events.clone(), metrics.clone())
            .expect("context");
        if let Some(expander) = expander {
            context.expander = expander;
        }
        let processors = AutoscalingProcessors {
            node_group_set: Box::new(BalancingNodeGroupSetProcessor::new(Box::new(
                GenericNodeInfoComparator::default(),
            ))),
            scale_up_status: statuses.clone(),
            node_group_manager: manager.clone(),
            async_node_group_state_checker: manager.upcoming(),
            binpacking_limiter: Box::new(NoOpBinpackingLimiter),
            custom_resources: Arc::new(GpuCustomResourcesProcessor),
        };

        let mut orchestrator = ScaleUpOrchestrator::new();
        orchestrator.initialize(context, processors, registry.clone(), estimator, TaintConfig::default());

        Self {
            provider,
            registry,
            events,
            metrics,
            statuses,
            manager,
            orchestrator,
            nodes,
            node_infos,
        }
    }

    async fn scale_up(&mut self, pods: &[PodRef], all_or_nothing: bool) -> ScaleUpStatus {
        self.orchestrator
            .scale_up(pods, &self.nodes, &[], self.node_infos.clone(), all_or_nothing)
            .await
    }

    fn target(&self, id: &str) -> usize {
        self.provider
            .group(id)
            .and_then(|g| g.target_size().ok())
            .expect("group exists")
    }
}

fn pod_names(pods: &[PodRef]) -> Vec<String> {
    let mut names: Vec<String> = pods.iter().map(|p| p.name.clone()).collect();
    names.sort();
    names
}

fn sizes(status: &ScaleUpStatus) -> Vec<(String, usize, usize)> {
    status
        .scale_up_infos
        .iter()
        .map(|i| (i.group.id(), i.current_size, i.new_size))
        .collect()
}

#[tokio::test]
async fn basic_scale_up_resizes_chosen_group() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng1", 1, 10, 1), 100, 100),
            group(TestNodeGroupSpec::new("ng2", 1, 10, 1), 1000, 1000),
        ],
        Some(Box::new(PickGroup("ng2"))),
    );

    let status = h.scale_up(&[build_test_pod("p", 500, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ng2".to_string(), 1, 2)]);
    assert_eq!(pod_names(&status.pods_triggered_scale_up), vec!["p"]);
    assert_eq!(h.provider.increases(), vec![("ng2".to_string(), 1)]);
    assert_eq!(h.target("ng2"), 2);
    assert_eq!(h.registry.upcoming_nodes().get("ng2"), Some(&1));
    assert_eq!(h.metrics.snapshot().scaled_up_nodes_total, 1);
    assert_eq!(h.events.with_reason("ScaledUpGroup").len(), 2);
}

#[tokio::test]
async fn mixed_outcome_splits_pods_three_ways() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng1", 0, 10, 1), 100, 1000),
            group(TestNodeGroupSpec::new("ng2", 0, 10, 1), 1000, 100),
        ],
        Some(Box::new(PickGroup("ng2"))),
    );
    let pods = [
        build_test_pod("triggering", 900, 0),
        build_test_pod("remaining", 2000, 0),
        build_test_pod("awaiting", 0, 200),
    ];

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ng2".to_string(), 1, 2)]);
    assert_eq!(pod_names(&status.pods_triggered_scale_up), vec!["triggering"]);
    assert_eq!(pod_names(&status.pods_await_evaluation), vec!["awaiting"]);
    assert_eq!(status.pods_remain_unschedulable.len(), 1);
    let remaining = &status.pods_remain_unschedulable[0];
    assert_eq!(remaining.pod.name, "remaining");
    assert!(remaining.rejected_node_groups.contains_key("ng1"));
    assert!(remaining.rejected_node_groups.contains_key("ng2"));
    assert_eq!(status.considered_node_groups.len(), 2);
}

#[tokio::test]
async fn cpu_limit_caps_new_nodes() {
    let provider = TestCloudProvider::new().with_resource_limiter(ResourceLimiter::default().with_max("cpu", 9));
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        provider,
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 3), 2000, 1 << 30)],
        None,
    );
    let pods = [build_test_pod("a", 2000, 0), build_test_pod("b", 2000, 0), build_test_pod("c", 2000, 0)];

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ng1".to_string(), 3, 4)]);
    assert_eq!(pod_names(&status.pods_triggered_scale_up), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn all_or_nothing_refuses_partial_scale_up() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 1, 10, 1), 1000, 1000)],
        None,
    );
    let pods: Vec<PodRef> = (0..11).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

    let status = h.scale_up(&pods, true).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    assert!(status.scale_up_infos.is_empty());
    assert_eq!(status.pods_remain_unschedulable.len(), 11);
    for info in &status.pods_remain_unschedulable {
        assert_eq!(info.rejected_node_groups.get("ng1"), Some(&Reasons::all_or_nothing()));
    }
    assert!(h.provider.increases().is_empty());
}

#[tokio::test]
async fn resource_limits_abort_all_or_nothing() {
    let provider = TestCloudProvider::new().with_resource_limiter(ResourceLimiter::default().with_max("cpu", 9));
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        provider,
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 3), 2000, 1 << 30)],
        None,
    );
    let pods = [build_test_pod("a", 2000, 0), build_test_pod("b", 2000, 0), build_test_pod("c", 2000, 0)];

    let status = h.scale_up(&pods, true).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    assert!(h.provider.increases().is_empty());
    assert_eq!(status.pods_remain_unschedulable.len(), 3);
    for info in &status.pods_remain_unschedulable {
        assert_eq!(info.rejected_node_groups.get("ng1"), Some(&Reasons::all_or_nothing()));
    }
}

#[tokio::test]
async fn balancing_shortfall_aborts_all_or_nothing() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 3, 1), 1000, 1000)],
        Some(Box::new(Greedy)),
    );

    let status = h.scale_up(&[build_test_pod("p", 1000, 0)], true).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    assert!(status.scale_up_infos.is_empty());
    assert!(h.provider.increases().is_empty());
    assert_eq!(
        status.pods_remain_unschedulable[0].rejected_node_groups.get("ng1"),
        Some(&Reasons::all_or_nothing())
    );
}

#[tokio::test]
async fn parallel_failures_are_combined() {
    let options = AutoscalingOptions {
        parallel_scale_up: true,
        balance_similar_node_groups: true,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng1", 0, 2, 1).failing_increase("quota exceeded in zone a"), 1000, 1000),
            group(TestNodeGroupSpec::new("ng2", 0, 2, 1).failing_increase("quota exceeded in zone b"), 1000, 1000),
        ],
        Some(Box::new(PickGroup("ng1"))),
    );
    let pods = [build_test_pod("a", 1000, 0), build_test_pod("b", 1000, 0)];

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Error);
    let error = status.scale_up_error.clone().expect("error");
    assert_eq!(error.kind, ErrorKind::CloudProvider);
    assert!(error.message.contains("...and other concurrent errors"), "{}", error.message);
    let failed: Vec<String> = status.failed_resize_node_groups.iter().map(|g| g.id()).collect();
    assert_eq!(failed, vec!["ng1", "ng2"]);
    assert_eq!(h.registry.failed_scale_ups().len(), 2);
    assert_eq!(h.metrics.snapshot().errors_total.get("cloudProviderError"), Some(&1));
}

fn async_options() -> AutoscalingOptions {
    AutoscalingOptions {
        async_node_groups_enabled: true,
        ..Default::default()
    }
}

fn increases(h: &Harness) -> Vec<(String, usize)> {
    let mut increases = h.provider.increases();
    increases.sort();
    increases
}

fn requests(h: &Harness) -> Vec<(String, usize)> {
    h.registry
        .scale_up_requests()
        .into_iter()
        .map(|r| (r.node_group, r.increase))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_creation_scales_up_through_initializer() {
    for _ in 0..20 {
        let mut h = Harness::new(
            async_options(),
            TestCloudProvider::new(),
            vec![group(TestNodeGroupSpec::new("async-ng", 0, 10, 0).not_existing(), 1000, 1000)],
            None,
        );
        let pods: Vec<PodRef> = (0..3).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

        let status = h.scale_up(&pods, false).await;
        assert_eq!(status.result, ScaleUpResult::Successful);
        assert_eq!(sizes(&status), vec![("async-ng".to_string(), 0, 3)]);
        assert_eq!(status.created_node_groups.len(), 1);

        h.manager.drain().await;

        assert_eq!(h.provider.created_groups(), vec!["async-ng"]);
        assert_eq!(increases(&h), vec![("async-ng".to_string(), 3)]);
        assert_eq!(requests(&h), vec![("async-ng".to_string(), 3)]);
        let initialized = h.statuses.last().expect("initializer status");
        assert_eq!(initialized.result, ScaleUpResult::Successful);
        assert_eq!(sizes(&initialized), vec![("async-ng".to_string(), 0, 3)]);
        assert_eq!(h.target("async-ng"), 3);
        assert!(h.manager.upcoming().list().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_creation_uses_balanced_size() {
    let options = AutoscalingOptions {
        balance_similar_node_groups: true,
        ..async_options()
    };
    for _ in 0..20 {
        let mut h = Harness::new(
            options.clone(),
            TestCloudProvider::new(),
            vec![
                group(TestNodeGroupSpec::new("async-ng", 0, 10, 0).not_existing(), 1000, 1000),
                group(TestNodeGroupSpec::new("ng-b", 0, 10, 0), 1000, 1000),
            ],
            Some(Box::new(PickGroup("async-ng"))),
        );
        let pods: Vec<PodRef> = (0..4).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

        let status = h.scale_up(&pods, false).await;
        assert_eq!(status.result, ScaleUpResult::Successful);
        assert_eq!(
            sizes(&status),
            vec![("async-ng".to_string(), 0, 2), ("ng-b".to_string(), 0, 2)]
        );

        h.manager.drain().await;

        assert_eq!(h.target("async-ng"), 2);
        assert_eq!(h.target("ng-b"), 2);
        assert_eq!(
            increases(&h),
            vec![("async-ng".to_string(), 2), ("ng-b".to_string(), 2)]
        );
        assert_eq!(
            requests(&h),
            vec![("async-ng".to_string(), 2), ("ng-b".to_string(), 2)]
        );
    }
}

#[tokio::test]
async fn node_group_being_created_counts_against_node_cap() {
    let options = AutoscalingOptions {
        max_nodes_total: 4,
        ..async_options()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("async-ng", 0, 10, 0).not_existing(), 1000, 1000),
            group(TestNodeGroupSpec::new("ng2", 0, 10, 1), 1000, 1000),
        ],
        Some(Box::new(PickGroup("async-ng"))),
    );
    let pods: Vec<PodRef> = (0..3).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

    let first = h.scale_up(&pods, false).await;
    assert_eq!(first.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&first), vec![("async-ng".to_string(), 0, 3)]);

    // The creation task has not run yet on this single-threaded runtime.
    let second = h.scale_up(&[build_test_pod("late", 1000, 0)], false).await;
    assert_eq!(second.result, ScaleUpResult::NoOptionsAvailable);
    assert!(h.provider.increases().is_empty());

    h.manager.drain().await;
    assert_eq!(increases(&h), vec![("async-ng".to_string(), 3)]);
}

#[tokio::test]
async fn autoprovisioned_group_is_created_inline() {
    let options = AutoscalingOptions {
        node_autoprovisioning_enabled: true,
        ..Default::default()
    };
    let mut spec = TestNodeGroupSpec::new("ap-ng", 0, 10, 0).not_existing();
    spec.extra_on_create.push(
        TestNodeGroupSpec::new("extra", 0, 10, 0)
            .with_template(NodeInfo::new(build_test_node("extra-template", 1000, 1000))),
    );
    let mut h = Harness::new(options, TestCloudProvider::new(), vec![group(spec, 1000, 1000)], None);
    let pods = [build_test_pod("a", 1000, 0), build_test_pod("b", 1000, 0)];

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ap-ng".to_string(), 0, 2)]);
    let created: Vec<String> = status.created_node_groups.iter().map(|g| g.id()).collect();
    assert_eq!(created, vec!["ap-ng", "extra"]);
    assert_eq!(h.provider.created_groups(), vec!["ap-ng", "extra"]);
    assert_eq!(h.provider.increases(), vec![("ap-ng".to_string(), 2)]);
    assert_eq!(h.target("ap-ng"), 2);
    assert_eq!(h.metrics.snapshot().created_node_groups_total, 1);
}

#[tokio::test]
async fn failed_creation_is_reported() {
    let options = AutoscalingOptions {
        node_autoprovisioning_enabled: true,
        ..Default::default()
    };
    let mut spec = TestNodeGroupSpec::new("bad-ng", 0, 10, 0).not_existing();
    spec.create_error = Some("zone out of capacity".to_string());
    let mut h = Harness::new(options, TestCloudProvider::new(), vec![group(spec, 1000, 1000)], None);

    let status = h.scale_up(&[build_test_pod("p", 1000, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::Error);
    assert_eq!(status.scale_up_error.as_ref().map(|e| e.kind), Some(ErrorKind::CloudProvider));
    let failed: Vec<String> = status.failed_creation_node_groups.iter().map(|g| g.id()).collect();
    assert_eq!(failed, vec!["bad-ng"]);
    assert!(status.created_node_groups.is_empty());
    assert!(h.provider.created_groups().is_empty());
    assert!(h.provider.increases().is_empty());
}

#[tokio::test]
async fn backed_off_group_is_skipped_on_next_attempt() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 5, 1).failing_increase("stockout"), 1000, 1000)],
        None,
    );
    let pods = [build_test_pod("p", 1000, 0)];

    let first = h.scale_up(&pods, false).await;
    assert_eq!(first.result, ScaleUpResult::Error);

    let second = h.scale_up(&pods, false).await;
    assert_eq!(second.result, ScaleUpResult::NoOptionsAvailable);
    let expected: BTreeMap<String, Reasons> = [("ng1".to_string(), Reasons::backoff())].into_iter().collect();
    assert_eq!(second.pods_remain_unschedulable[0].skipped_node_groups, expected);
}

#[tokio::test]
async fn node_cap_limits_scale_up() {
    let options = AutoscalingOptions {
        max_nodes_total: 4,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 2), 1000, 1000)],
        None,
    );
    let pods: Vec<PodRef> = (0..5).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    let added: usize = status.scale_up_infos.iter().map(|i| i.delta()).sum();
    assert!(added + h.nodes.len() <= 4);
    assert_eq!(added, 2);
}

#[tokio::test]
async fn full_cluster_gets_no_options() {
    let options = AutoscalingOptions {
        max_nodes_total: 2,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 2), 1000, 1000)],
        None,
    );

    let status = h.scale_up(&[build_test_pod("p", 1000, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    assert!(h.provider.increases().is_empty());
}

/// Proposes more nodes than asked for, so the node cap has to cut in.
struct Greedy;

impl Strategy for Greedy {
    fn best_option(
        &self,
        options: &[ExpansionOption],
        _node_infos: &HashMap<String, NodeInfo>,
    ) -> Option<ExpansionOption> {
        options.first().cloned().map(|mut o| {
            o.node_count += 5;
            o
        })
    }
}

#[tokio::test]
async fn node_cap_trims_expander_choice() {
    let options = AutoscalingOptions {
        max_nodes_total: 3,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 2), 1000, 1000)],
        Some(Box::new(Greedy)),
    );

    let status = h.scale_up(&[build_test_pod("p", 1000, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ng1".to_string(), 2, 3)]);
    assert_eq!(h.events.with_reason(MAX_NODES_TOTAL_REACHED).len(), 1);
}

#[tokio::test]
async fn node_cap_aborts_all_or_nothing() {
    let options = AutoscalingOptions {
        max_nodes_total: 3,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 2), 1000, 1000)],
        Some(Box::new(Greedy)),
    );

    let status = h.scale_up(&[build_test_pod("p", 1000, 0)], true).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    assert!(h.provider.increases().is_empty());
    assert_eq!(
        status.pods_remain_unschedulable[0].rejected_node_groups.get("ng1"),
        Some(&Reasons::all_or_nothing())
    );
}

#[tokio::test]
async fn zero_or_max_group_scales_to_max() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("tpu", 0, 4, 0).zero_or_max(), 1000, 1000)],
        None,
    );

    let status = h.scale_up(&[build_test_pod("p", 500, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("tpu".to_string(), 0, 4)]);
}

#[tokio::test]
async fn zero_or_max_group_over_node_cap_is_skipped() {
    let options = AutoscalingOptions {
        max_nodes_total: 5,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng1", 0, 10, 2), 100, 100),
            group(TestNodeGroupSpec::new("tpu", 0, 4, 0).zero_or_max(), 1000, 1000),
        ],
        None,
    );

    let status = h.scale_up(&[build_test_pod("p", 500, 0)], false).await;

    assert_eq!(status.result, ScaleUpResult::NoOptionsAvailable);
    let skipped = &status.pods_remain_unschedulable[0].skipped_node_groups;
    assert_eq!(skipped.get("tpu"), Some(&Reasons::atomic_exceeds_node_cap()));
}

#[tokio::test]
async fn similar_groups_share_the_scale_up() {
    let options = AutoscalingOptions {
        balance_similar_node_groups: true,
        ..Default::default()
    };
    let mut h = Harness::new(
        options,
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng-a", 0, 10, 1), 1000, 1000),
            group(TestNodeGroupSpec::new("ng-b", 0, 10, 1), 1000, 1000),
        ],
        Some(Box::new(PickGroup("ng-a"))),
    );
    let pods: Vec<PodRef> = (0..4).map(|i| build_test_pod(&format!("p{i}"), 1000, 0)).collect();

    let status = h.scale_up(&pods, false).await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(
        sizes(&status),
        vec![("ng-a".to_string(), 1, 3), ("ng-b".to_string(), 1, 3)]
    );
}

#[tokio::test]
async fn groups_below_min_size_are_raised() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![
            group(TestNodeGroupSpec::new("ng1", 3, 10, 1), 1000, 1000),
            group(TestNodeGroupSpec::new("ng2", 1, 10, 1), 1000, 1000),
        ],
        None,
    );

    let status = h
        .orchestrator
        .scale_up_to_node_group_min_size(&h.nodes, &h.node_infos)
        .await;

    assert_eq!(status.result, ScaleUpResult::Successful);
    assert_eq!(sizes(&status), vec![("ng1".to_string(), 1, 3)]);
    let considered: Vec<String> = status.considered_node_groups.iter().map(|g| g.id()).collect();
    assert_eq!(considered, vec!["ng1", "ng2"]);
    assert_eq!(h.target("ng1"), 3);

    let again = h
        .orchestrator
        .scale_up_to_node_group_min_size(&h.nodes, &h.node_infos)
        .await;
    assert_eq!(again.result, ScaleUpResult::NotNeeded);
}

#[tokio::test]
async fn no_pods_means_no_scale_up() {
    let mut h = Harness::new(
        AutoscalingOptions::default(),
        TestCloudProvider::new(),
        vec![group(TestNodeGroupSpec::new("ng1", 0, 10, 1), 1000, 1000)],
        None,
    );
    let status = h.scale_up(&[], false).await;
    assert_eq!(status.result, ScaleUpResult::NotNeeded);
}
