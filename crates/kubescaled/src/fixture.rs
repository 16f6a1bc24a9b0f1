//! Cluster fixtures: node groups and pending pods described in TOML.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use kubescale_cloud::{ResourceLimiter, TestCloudProvider, TestNodeGroupSpec};
use kubescale_core::{
    Container, DaemonSet, Node, NodeGroupAutoscalingOptions, NodeInfo, OwnerReference, Pod, PodRef, PodSpec,
    ResourceList, ResourceLimitsConfig,
};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("failed to read fixture: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse fixture: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid fixture: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeGroupFixture {
    pub id: String,
    #[serde(default)]
    pub min_size: usize,
    pub max_size: usize,
    #[serde(default)]
    pub target_size: usize,
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    #[serde(default)]
    pub gpus: i64,
    #[serde(default = "default_true")]
    pub exist: bool,
    #[serde(default)]
    pub zero_or_max: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// `count` identical pods owned by one controller.
#[derive(Debug, Clone, Deserialize)]
pub struct PodFixture {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub cpu_millis: i64,
    #[serde(default)]
    pub memory_bytes: i64,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterFixture {
    #[serde(default)]
    pub node_groups: Vec<NodeGroupFixture>,
    #[serde(default)]
    pub pending_pods: Vec<PodFixture>,
    #[serde(default)]
    pub daemon_sets: Vec<DaemonSet>,
}

/// What a fixture turns into: the provider, its registered nodes and the
/// pods waiting for room.
pub struct Cluster {
    pub provider: Arc<TestCloudProvider>,
    pub nodes: Vec<Node>,
    pub pending: Vec<PodRef>,
    pub daemon_sets: Vec<DaemonSet>,
}

impl ClusterFixture {
    pub fn from_file(path: &Path) -> Result<Self, FixtureError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FixtureError> {
        let fixture: Self = toml::from_str(content)?;
        fixture.validate()?;
        Ok(fixture)
    }

    fn validate(&self) -> Result<(), FixtureError> {
        let mut seen = std::collections::HashSet::new();
        for group in &self.node_groups {
            if !seen.insert(group.id.as_str()) {
                return Err(FixtureError::Invalid(format!("duplicate node group {}", group.id)));
            }
            if group.min_size > group.max_size || group.target_size > group.max_size {
                return Err(FixtureError::Invalid(format!(
                    "node group {}: sizes must satisfy min <= max and target <= max",
                    group.id
                )));
            }
        }
        Ok(())
    }

    /// Build the in-memory cluster. Existing groups start with
    /// `target_size` ready nodes.
    pub fn build(&self, limits: Option<&ResourceLimitsConfig>) -> Cluster {
        let mut provider = TestCloudProvider::new();
        if let Some(limits) = limits {
            provider = provider.with_resource_limiter(ResourceLimiter::from_config(limits));
        }
        let provider = Arc::new(provider);

        let mut nodes = Vec::new();
        for group in &self.node_groups {
            let template = group.node(&format!("{}-template", group.id));
            let mut spec = TestNodeGroupSpec::new(&group.id, group.min_size, group.max_size, group.target_size)
                .with_template(NodeInfo::new(template));
            if !group.exist {
                spec = spec.not_existing();
            }
            if group.zero_or_max {
                spec = spec.with_options(NodeGroupAutoscalingOptions {
                    zero_or_max_node_scaling: true,
                });
            }
            provider.add_node_group(spec);
            if !group.exist {
                continue;
            }
            for i in 0..group.target_size {
                let node = group.node(&format!("{}-{i}", group.id));
                provider.add_node(&group.id, &node);
                nodes.push(node);
            }
        }

        Cluster {
            provider,
            nodes,
            pending: self.pending_pods.iter().flat_map(PodFixture::pods).collect(),
            daemon_sets: self.daemon_sets.clone(),
        }
    }
}

impl NodeGroupFixture {
    fn node(&self, name: &str) -> Node {
        let mut capacity = ResourceList::cpu_memory(self.cpu_millis, self.memory_bytes);
        if self.gpus > 0 {
            capacity.set(kubescale_core::resources::NVIDIA_GPU, self.gpus);
        }
        let mut node = Node::new(name, capacity);
        for (key, value) in &self.labels {
            node = node.with_label(key, value);
        }
        node
    }
}

impl PodFixture {
    fn pods(&self) -> Vec<PodRef> {
        let owner = OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: self.name.clone(),
            uid: format!("{}/{}", self.namespace, self.name),
            controller: true,
        };
        (0..self.count)
            .map(|i| {
                Arc::new(Pod {
                    uid: format!("{}/{}-{i}", self.namespace, self.name),
                    namespace: self.namespace.clone(),
                    name: format!("{}-{i}", self.name),
                    owner_references: vec![owner.clone()],
                    spec: PodSpec {
                        containers: vec![Container {
                            name: self.name.clone(),
                            requests: ResourceList::cpu_memory(self.cpu_millis, self.memory_bytes),
                            ..Default::default()
                        }],
                        node_selector: self.node_selector.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
            })
            .collect()
    }
}
