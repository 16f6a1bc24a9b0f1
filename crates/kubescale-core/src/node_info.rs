//! A node together with the pods bound to it.

use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::pod::PodRef;
use crate::resources::{self, ResourceList};

/// A node plus its pods and their summed requests. Template node infos
/// (one per node group) carry the daemon pods every new node would run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: Node,
    #[serde(default)]
    pub pods: Vec<PodRef>,
    #[serde(default)]
    pub requested: ResourceList,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            pods: Vec::new(),
            requested: ResourceList::new(),
        }
    }

    pub fn with_pods(node: Node, pods: impl IntoIterator<Item = PodRef>) -> Self {
        let mut info = Self::new(node);
        for pod in pods {
            info.add_pod(pod);
        }
        info
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn add_pod(&mut self, pod: PodRef) {
        self.requested.add(&pod.requests());
        self.requested
            .set(resources::PODS, self.requested.get(resources::PODS) + 1);
        self.pods.push(pod);
    }

    /// Remove a pod by uid. Returns whether it was present.
    pub fn remove_pod(&mut self, uid: &str) -> bool {
        let Some(idx) = self.pods.iter().position(|p| p.uid == uid) else {
            return false;
        };
        let pod = self.pods.remove(idx);
        self.requested.sub(&pod.requests());
        self.requested
            .set(resources::PODS, self.requested.get(resources::PODS) - 1);
        true
    }

    /// Allocatable minus requested, for every allocatable resource.
    pub fn free(&self) -> ResourceList {
        self.node.allocatable.minus(&self.requested)
    }
}
