//! In-memory cloud provider.
//!
//! Groups are declared with [`TestNodeGroupSpec`]; sizes live in memory
//! and every successful increase is recorded so callers can assert on
//! what the autoscaler asked for.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use kubescale_core::labels::ACCELERATOR;
use kubescale_core::{Node, NodeGroupAutoscalingOptions, NodeInfo};
use tracing::debug;

use crate::error::{CloudProviderError, CloudProviderResult};
use crate::limiter::ResourceLimiter;
use crate::provider::{CloudProvider, CreateNodeGroupResult, NodeGroup, NodeGroupRef};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Declarative description of a test node group.
#[derive(Debug, Clone)]
pub struct TestNodeGroupSpec {
    pub id: String,
    pub min_size: usize,
    pub max_size: usize,
    pub target_size: usize,
    pub template: Option<NodeInfo>,
    pub exist: bool,
    pub options: Option<NodeGroupAutoscalingOptions>,
    pub atomic_supported: bool,
    /// Every increase fails with this message.
    pub increase_error: Option<String>,
    pub create_error: Option<String>,
    /// Groups brought into existence alongside this one on `create`.
    pub extra_on_create: Vec<TestNodeGroupSpec>,
    /// Target sizes reported in the creation result.
    pub create_target_sizes: HashMap<String, usize>,
}

impl TestNodeGroupSpec {
    pub fn new(id: &str, min_size: usize, max_size: usize, target_size: usize) -> Self {
        Self {
            id: id.to_string(),
            min_size,
            max_size,
            target_size,
            template: None,
            exist: true,
            options: None,
            atomic_supported: false,
            increase_error: None,
            create_error: None,
            extra_on_create: Vec::new(),
            create_target_sizes: HashMap::new(),
        }
    }

    pub fn with_template(mut self, template: NodeInfo) -> Self {
        self.template = Some(template);
        self
    }

    /// An auto-provisioned group that has to be created before use.
    pub fn not_existing(mut self) -> Self {
        self.exist = false;
        self
    }

    pub fn with_options(mut self, options: NodeGroupAutoscalingOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn zero_or_max(self) -> Self {
        self.with_options(NodeGroupAutoscalingOptions {
            zero_or_max_node_scaling: true,
        })
    }

    pub fn atomic(mut self) -> Self {
        self.atomic_supported = true;
        self
    }

    pub fn failing_increase(mut self, message: &str) -> Self {
        self.increase_error = Some(message.to_string());
        self
    }
}

#[derive(Default)]
struct ProviderState {
    groups: Vec<Arc<TestNodeGroup>>,
    node_to_group: HashMap<String, String>,
    increases: Vec<(String, usize)>,
    created: Vec<String>,
    deleted: Vec<String>,
}

#[derive(Debug)]
pub struct TestNodeGroup {
    spec: TestNodeGroupSpec,
    target: Mutex<usize>,
    increase_error: Mutex<Option<String>>,
    state: Weak<Mutex<ProviderState>>,
}

impl TestNodeGroup {
    fn new(spec: TestNodeGroupSpec, state: Weak<Mutex<ProviderState>>) -> Self {
        Self {
            target: Mutex::new(spec.target_size),
            increase_error: Mutex::new(spec.increase_error.clone()),
            spec,
            state,
        }
    }

    /// Make every future increase fail with `message`, or succeed again.
    pub fn set_increase_error(&self, message: Option<&str>) {
        *lock(&self.increase_error) = message.map(str::to_string);
    }

    fn record_increase(&self, delta: usize) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).increases.push((self.spec.id.clone(), delta));
        }
    }

    fn resize(&self, delta: usize) -> CloudProviderResult<()> {
        if let Some(message) = lock(&self.increase_error).clone() {
            return Err(CloudProviderError::Provider(message));
        }
        let mut target = lock(&self.target);
        let new_size = *target + delta;
        if new_size > self.spec.max_size {
            return Err(CloudProviderError::Provider(format!(
                "size increase too large: desired {new_size}, max {}",
                self.spec.max_size
            )));
        }
        *target = new_size;
        drop(target);
        self.record_increase(delta);
        debug!(node_group = %self.spec.id, delta, new_size, "test node group resized");
        Ok(())
    }
}

impl NodeGroup for TestNodeGroup {
    fn id(&self) -> String {
        self.spec.id.clone()
    }

    fn exist(&self) -> bool {
        self.spec.exist
    }

    fn min_size(&self) -> usize {
        self.spec.min_size
    }

    fn max_size(&self) -> usize {
        self.spec.max_size
    }

    fn target_size(&self) -> CloudProviderResult<usize> {
        Ok(*lock(&self.target))
    }

    fn increase_size(&self, delta: usize) -> CloudProviderResult<()> {
        self.resize(delta)
    }

    fn atomic_increase_size(&self, delta: usize) -> CloudProviderResult<()> {
        if !self.spec.atomic_supported {
            return Err(CloudProviderError::NotImplemented);
        }
        self.resize(delta)
    }

    fn template_node_info(&self) -> CloudProviderResult<NodeInfo> {
        self.spec
            .template
            .clone()
            .ok_or(CloudProviderError::NotImplemented)
    }

    fn get_options(
        &self,
        _defaults: &NodeGroupAutoscalingOptions,
    ) -> CloudProviderResult<Option<NodeGroupAutoscalingOptions>> {
        Ok(self.spec.options.clone())
    }

    fn nodes(&self) -> CloudProviderResult<Vec<String>> {
        let Some(state) = self.state.upgrade() else {
            return Ok(Vec::new());
        };
        let state = lock(&state);
        let mut nodes: Vec<String> = state
            .node_to_group
            .iter()
            .filter(|(_, group)| **group == self.spec.id)
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    fn create(&self) -> CloudProviderResult<CreateNodeGroupResult> {
        if self.spec.exist {
            return Err(CloudProviderError::Provider(format!(
                "node group {} already exists",
                self.spec.id
            )));
        }
        if let Some(message) = &self.spec.create_error {
            return Err(CloudProviderError::Provider(message.clone()));
        }
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| CloudProviderError::Provider("provider is gone".to_string()))?;

        let materialise = |spec: &TestNodeGroupSpec| {
            let mut spec = spec.clone();
            spec.exist = true;
            spec.target_size = 0;
            Arc::new(TestNodeGroup::new(spec, self.state.clone()))
        };
        let main = materialise(&self.spec);
        let extra: Vec<Arc<TestNodeGroup>> =
            self.spec.extra_on_create.iter().map(materialise).collect();

        let mut guard = lock(&state);
        match guard.groups.iter().position(|g| g.spec.id == self.spec.id) {
            Some(idx) => guard.groups[idx] = main.clone(),
            None => guard.groups.push(main.clone()),
        }
        guard.created.push(self.spec.id.clone());
        for group in &extra {
            guard.groups.push(group.clone());
            guard.created.push(group.spec.id.clone());
        }
        drop(guard);

        debug!(node_group = %self.spec.id, extra = extra.len(), "test node group created");
        Ok(CreateNodeGroupResult {
            main_created: main,
            extra_created: extra.into_iter().map(|g| g as NodeGroupRef).collect(),
            target_sizes: self.spec.create_target_sizes.clone(),
        })
    }

    fn delete(&self) -> CloudProviderResult<()> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| CloudProviderError::Provider("provider is gone".to_string()))?;
        let mut guard = lock(&state);
        guard.groups.retain(|g| g.spec.id != self.spec.id);
        guard.deleted.push(self.spec.id.clone());
        Ok(())
    }

    fn autoprovisioned(&self) -> bool {
        !self.spec.exist
    }
}

/// In-memory provider holding test node groups.
pub struct TestCloudProvider {
    state: Arc<Mutex<ProviderState>>,
    limiter: Mutex<ResourceLimiter>,
    gpu_types: BTreeSet<String>,
}

impl Default for TestCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCloudProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState::default())),
            limiter: Mutex::new(ResourceLimiter::default()),
            gpu_types: BTreeSet::new(),
        }
    }

    pub fn with_resource_limiter(self, limiter: ResourceLimiter) -> Self {
        *lock(&self.limiter) = limiter;
        self
    }

    pub fn with_gpu_types<I: IntoIterator<Item = String>>(mut self, types: I) -> Self {
        self.gpu_types = types.into_iter().collect();
        self
    }

    pub fn set_resource_limiter(&self, limiter: ResourceLimiter) {
        *lock(&self.limiter) = limiter;
    }

    pub fn add_node_group(&self, spec: TestNodeGroupSpec) -> Arc<TestNodeGroup> {
        let group = Arc::new(TestNodeGroup::new(spec, Arc::downgrade(&self.state)));
        let mut state = lock(&self.state);
        state.groups.retain(|g| g.spec.id != group.spec.id);
        state.groups.push(group.clone());
        group
    }

    /// Register `node` as a member of `group_id`.
    pub fn add_node(&self, group_id: &str, node: &Node) {
        lock(&self.state)
            .node_to_group
            .insert(node.name.clone(), group_id.to_string());
    }

    pub fn set_increase_error(&self, group_id: &str, message: Option<&str>) {
        if let Some(group) = self.group(group_id) {
            group.set_increase_error(message);
        }
    }

    pub fn group(&self, id: &str) -> Option<Arc<TestNodeGroup>> {
        lock(&self.state)
            .groups
            .iter()
            .find(|g| g.spec.id == id)
            .cloned()
    }

    /// Every successful increase as `(group, delta)`, in call order.
    pub fn increases(&self) -> Vec<(String, usize)> {
        lock(&self.state).increases.clone()
    }

    pub fn created_groups(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn deleted_groups(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }
}

impl CloudProvider for TestCloudProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn node_groups(&self) -> Vec<NodeGroupRef> {
        lock(&self.state)
            .groups
            .iter()
            .map(|g| g.clone() as NodeGroupRef)
            .collect()
    }

    fn node_group_for_node(&self, node: &Node) -> CloudProviderResult<Option<NodeGroupRef>> {
        let state = lock(&self.state);
        let Some(group_id) = state.node_to_group.get(&node.name) else {
            return Ok(None);
        };
        Ok(state
            .groups
            .iter()
            .find(|g| &g.spec.id == group_id)
            .map(|g| g.clone() as NodeGroupRef))
    }

    fn resource_limiter(&self) -> CloudProviderResult<ResourceLimiter> {
        Ok(lock(&self.limiter).clone())
    }

    fn gpu_label(&self) -> &str {
        ACCELERATOR
    }

    fn available_gpu_types(&self) -> BTreeSet<String> {
        self.gpu_types.clone()
    }
}
