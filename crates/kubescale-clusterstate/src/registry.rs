//! Cluster state registry.
//!
//! Tracks, per node group, how many nodes are registered and ready, which
//! scale-up requests are still in flight, and which groups are backed off
//! after failures. The orchestrator reads it during a tick; executor
//! workers write to it concurrently, so all state sits behind one lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kubescale_cloud::{CloudProvider, NodeGroup};
use kubescale_core::{AutoscalerError, AutoscalerResult, AutoscalingOptions, ConfigError, ErrorKind, Node};
use tracing::{debug, warn};

use crate::backoff::{BackoffStatus, ExponentialBackoff};

/// Unready nodes tolerated in a group regardless of its size.
const OK_TOTAL_UNREADY_COUNT: usize = 3;
/// Above this share of unready nodes (and the count above), a group is
/// unhealthy.
const MAX_TOTAL_UNREADY_PERCENTAGE: f64 = 45.0;

#[derive(Debug, Clone)]
pub struct ClusterStateConfig {
    pub max_node_provision_time: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_reset_timeout: Duration,
}

impl Default for ClusterStateConfig {
    fn default() -> Self {
        Self {
            max_node_provision_time: Duration::from_secs(15 * 60),
            initial_backoff: Duration::from_secs(5 * 60),
            max_backoff: Duration::from_secs(30 * 60),
            backoff_reset_timeout: Duration::from_secs(3 * 3600),
        }
    }
}

impl ClusterStateConfig {
    pub fn from_options(options: &AutoscalingOptions) -> Result<Self, ConfigError> {
        Ok(Self {
            max_node_provision_time: options.max_node_provision_time()?,
            initial_backoff: options.initial_backoff()?,
            max_backoff: options.max_backoff()?,
            backoff_reset_timeout: options.backoff_reset_timeout()?,
        })
    }
}

/// An in-flight request to grow a node group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleUpRequest {
    pub node_group: String,
    pub increase: usize,
    pub time: Instant,
    /// After this the request is considered failed.
    pub expected_add_time: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedScaleUp {
    pub node_group: String,
    pub reason: ErrorKind,
    pub message: String,
    pub gpu_resource_name: String,
    pub gpu_type: String,
    pub time: Instant,
}

/// Whether a group may be scaled up right now, and why not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeGroupScalingSafety {
    pub safe_to_scale: bool,
    pub healthy: bool,
    pub backoff_status: BackoffStatus,
}

#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    ready: usize,
    unready: usize,
}

impl Readiness {
    fn registered(&self) -> usize {
        self.ready + self.unready
    }

    fn healthy(&self) -> bool {
        let total = self.registered();
        if self.unready <= OK_TOTAL_UNREADY_COUNT || total == 0 {
            return true;
        }
        (self.unready as f64) * 100.0 / (total as f64) <= MAX_TOTAL_UNREADY_PERCENTAGE
    }
}

struct RegistryState {
    readiness: HashMap<String, Readiness>,
    upcoming: BTreeMap<String, usize>,
    scale_up_requests: HashMap<String, ScaleUpRequest>,
    failed_scale_ups: Vec<FailedScaleUp>,
    backoff: ExponentialBackoff,
    total_ready: usize,
    total_unready: usize,
}

pub struct ClusterStateRegistry {
    provider: Arc<dyn CloudProvider>,
    config: ClusterStateConfig,
    state: Mutex<RegistryState>,
}

impl ClusterStateRegistry {
    pub fn new(provider: Arc<dyn CloudProvider>, config: ClusterStateConfig) -> Self {
        let backoff = ExponentialBackoff::new(
            config.initial_backoff,
            config.max_backoff,
            config.backoff_reset_timeout,
        );
        Self {
            provider,
            config,
            state: Mutex::new(RegistryState {
                readiness: HashMap::new(),
                upcoming: BTreeMap::new(),
                scale_up_requests: HashMap::new(),
                failed_scale_ups: Vec::new(),
                backoff,
                total_ready: 0,
                total_unready: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refresh readiness from the current node list and expire scale-up
    /// requests that took longer than the provision timeout.
    pub fn update(&self, nodes: &[Node], now: Instant) -> AutoscalerResult<()> {
        let mut readiness: HashMap<String, Readiness> = HashMap::new();
        let (mut total_ready, mut total_unready) = (0, 0);
        for node in nodes {
            if node.ready {
                total_ready += 1;
            } else {
                total_unready += 1;
            }
            let group = self
                .provider
                .node_group_for_node(node)
                .map_err(|e| AutoscalerError::from(e).add_prefix("failed to get node group for node: "))?;
            if let Some(group) = group {
                let entry = readiness.entry(group.id()).or_default();
                if node.ready {
                    entry.ready += 1;
                } else {
                    entry.unready += 1;
                }
            }
        }

        let mut state = self.lock();
        state.readiness = readiness;
        state.total_ready = total_ready;
        state.total_unready = total_unready;

        let expired: Vec<ScaleUpRequest> = state
            .scale_up_requests
            .values()
            .filter(|r| r.expected_add_time <= now)
            .cloned()
            .collect();
        for request in expired {
            warn!(
                node_group = %request.node_group,
                increase = request.increase,
                "scale-up timed out: nodes did not register in time"
            );
            state.scale_up_requests.remove(&request.node_group);
            let error = AutoscalerError::new(
                ErrorKind::CloudProvider,
                format!("scale-up of node group {} timed out", request.node_group),
            );
            state.failed_scale_ups.push(FailedScaleUp {
                node_group: request.node_group.clone(),
                reason: ErrorKind::CloudProvider,
                message: error.message.clone(),
                gpu_resource_name: String::new(),
                gpu_type: String::new(),
                time: now,
            });
            state.backoff.backoff(&request.node_group, error, now);
        }
        state.backoff.remove_stale(now);
        self.recalculate_locked(&mut state);
        Ok(())
    }

    /// Recompute upcoming nodes from current target sizes, and drop
    /// requests whose nodes have all registered.
    pub fn recalculate(&self) {
        let mut state = self.lock();
        self.recalculate_locked(&mut state);
    }

    fn recalculate_locked(&self, state: &mut RegistryState) {
        let mut upcoming = BTreeMap::new();
        for group in self.provider.node_groups() {
            if !group.exist() {
                continue;
            }
            let id = group.id();
            let Ok(target) = group.target_size() else {
                continue;
            };
            let registered = state.readiness.get(&id).map(Readiness::registered).unwrap_or(0);
            let pending = target.saturating_sub(registered);
            if pending == 0 {
                state.scale_up_requests.remove(&id);
            }
            upcoming.insert(id, pending);
        }
        state.upcoming = upcoming;
    }

    pub fn register_scale_up(&self, group: &dyn NodeGroup, delta: usize, now: Instant) {
        let id = group.id();
        let mut state = self.lock();
        let expected_add_time = now + self.config.max_node_provision_time;
        let request = state
            .scale_up_requests
            .entry(id.clone())
            .or_insert_with(|| ScaleUpRequest {
                node_group: id.clone(),
                increase: 0,
                time: now,
                expected_add_time,
            });
        request.increase += delta;
        request.time = now;
        request.expected_add_time = expected_add_time;
        debug!(node_group = %id, delta, "scale-up registered");
    }

    pub fn register_failed_scale_up(
        &self,
        group: &dyn NodeGroup,
        reason: ErrorKind,
        message: &str,
        gpu_resource_name: &str,
        gpu_type: &str,
        now: Instant,
    ) {
        let id = group.id();
        let mut state = self.lock();
        state.scale_up_requests.remove(&id);
        state.failed_scale_ups.push(FailedScaleUp {
            node_group: id.clone(),
            reason,
            message: message.to_string(),
            gpu_resource_name: gpu_resource_name.to_string(),
            gpu_type: gpu_type.to_string(),
            time: now,
        });
        state
            .backoff
            .backoff(&id, AutoscalerError::new(reason, message), now);
    }

    pub fn is_node_group_healthy(&self, group_id: &str) -> bool {
        self.lock()
            .readiness
            .get(group_id)
            .is_none_or(Readiness::healthy)
    }

    pub fn backoff_status(&self, group_id: &str, now: Instant) -> BackoffStatus {
        self.lock().backoff.status(group_id, now)
    }

    pub fn node_group_scaling_safety(&self, group: &dyn NodeGroup, now: Instant) -> NodeGroupScalingSafety {
        let id = group.id();
        let healthy = self.is_node_group_healthy(&id);
        let backoff_status = self.backoff_status(&id, now);
        NodeGroupScalingSafety {
            safe_to_scale: healthy && !backoff_status.is_backed_off,
            healthy,
            backoff_status,
        }
    }

    /// Nodes requested but not yet registered, per group.
    pub fn upcoming_nodes(&self) -> BTreeMap<String, usize> {
        self.lock().upcoming.clone()
    }

    pub fn upcoming_node_count(&self) -> usize {
        self.lock().upcoming.values().sum()
    }

    pub fn scale_up_requests(&self) -> Vec<ScaleUpRequest> {
        let mut requests: Vec<ScaleUpRequest> = self.lock().scale_up_requests.values().cloned().collect();
        requests.sort_by(|a, b| a.node_group.cmp(&b.node_group));
        requests
    }

    pub fn failed_scale_ups(&self) -> Vec<FailedScaleUp> {
        self.lock().failed_scale_ups.clone()
    }

    /// `(ready, unready)` across the whole cluster at the last update.
    pub fn total_readiness(&self) -> (usize, usize) {
        let state = self.lock();
        (state.total_ready, state.total_unready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubescale_cloud::{TestCloudProvider, TestNodeGroupSpec};
    use kubescale_core::ResourceList;

    fn node(name: &str, ready: bool) -> Node {
        let mut node = Node::new(name, ResourceList::cpu_memory(1000, 1000));
        node.ready = ready;
        node
    }

    fn setup() -> (Arc<TestCloudProvider>, ClusterStateRegistry, Vec<Node>) {
        let provider = Arc::new(TestCloudProvider::new());
        provider.add_node_group(TestNodeGroupSpec::new("ng1", 0, 10, 3));
        provider.add_node_group(TestNodeGroupSpec::new("ng2", 0, 10, 1));
        let nodes = vec![node("n1", true), node("n2", true), node("m1", true)];
        provider.add_node("ng1", &nodes[0]);
        provider.add_node("ng1", &nodes[1]);
        provider.add_node("ng2", &nodes[2]);
        let registry = ClusterStateRegistry::new(provider.clone(), ClusterStateConfig::default());
        (provider, registry, nodes)
    }

    #[test]
    fn upcoming_nodes_follow_target() {
        let (provider, registry, nodes) = setup();
        registry.update(&nodes, Instant::now()).unwrap();
        assert_eq!(registry.upcoming_nodes().get("ng1"), Some(&1));
        assert_eq!(registry.upcoming_nodes().get("ng2"), Some(&0));
        assert_eq!(registry.upcoming_node_count(), 1);

        provider.group("ng2").unwrap().increase_size(2).unwrap();
        registry.recalculate();
        assert_eq!(registry.upcoming_node_count(), 3);
        assert_eq!(registry.total_readiness(), (3, 0));
    }

    #[test]
    fn failed_scale_up_backs_off() {
        let (provider, registry, nodes) = setup();
        let now = Instant::now();
        registry.update(&nodes, now).unwrap();
        let group = provider.group("ng1").unwrap();

        registry.register_failed_scale_up(group.as_ref(), ErrorKind::CloudProvider, "quota", "", "", now);
        let safety = registry.node_group_scaling_safety(group.as_ref(), now);
        assert!(!safety.safe_to_scale);
        assert!(safety.healthy);
        assert!(safety.backoff_status.is_backed_off);
        assert_eq!(registry.failed_scale_ups().len(), 1);

        let later = now + Duration::from_secs(5 * 60 + 1);
        assert!(registry.node_group_scaling_safety(group.as_ref(), later).safe_to_scale);
    }

    #[test]
    fn scale_up_request_times_out() {
        let (provider, registry, nodes) = setup();
        let now = Instant::now();
        let group = provider.group("ng1").unwrap();
        registry.register_scale_up(group.as_ref(), 2, now);
        assert_eq!(registry.scale_up_requests()[0].increase, 2);

        registry.update(&nodes, now + Duration::from_secs(16 * 60)).unwrap();
        assert!(registry.scale_up_requests().is_empty());
        assert_eq!(registry.failed_scale_ups()[0].node_group, "ng1");
        assert!(
            registry
                .backoff_status("ng1", now + Duration::from_secs(16 * 60))
                .is_backed_off
        );
    }

    #[test]
    fn many_unready_nodes_make_group_unhealthy() {
        let provider = Arc::new(TestCloudProvider::new());
        provider.add_node_group(TestNodeGroupSpec::new("ng", 0, 10, 6));
        let nodes: Vec<Node> = (0..6).map(|i| node(&format!("n{i}"), i < 2)).collect();
        for n in &nodes {
            provider.add_node("ng", n);
        }
        let registry = ClusterStateRegistry::new(provider.clone(), ClusterStateConfig::default());
        registry.update(&nodes, Instant::now()).unwrap();
        assert!(!registry.is_node_group_healthy("ng"));
        assert!(registry.is_node_group_healthy("unknown"));
    }
}
