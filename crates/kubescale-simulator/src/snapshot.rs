//! Cluster snapshot with nested fork/revert.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use kubescale_core::{Node, NodeInfo, PodRef};
use thiserror::Error;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("node {0} already in snapshot")]
    NodeAlreadyExists(String),

    #[error("node {0} not found in snapshot")]
    NodeNotFound(String),

    #[error("pod {0} not found in snapshot")]
    PodNotFound(String),

    #[error("cannot commit: snapshot is not forked")]
    NotForked,
}

/// In-memory view of the cluster used for simulation.
///
/// `fork` opens a new layer; `revert` drops the newest layer and
/// `commit` folds it into the one below. Forks nest.
pub trait ClusterSnapshot: Send {
    fn add_node_info(&mut self, info: NodeInfo) -> SnapshotResult<()>;

    fn remove_node_info(&mut self, node_name: &str) -> SnapshotResult<()>;

    fn add_pod(&mut self, pod: PodRef, node_name: &str) -> SnapshotResult<()>;

    fn remove_pod(&mut self, pod_uid: &str, node_name: &str) -> SnapshotResult<()>;

    fn get_node_info(&self, node_name: &str) -> Option<&NodeInfo>;

    /// All node infos, ordered by node name.
    fn node_infos(&self) -> Vec<&NodeInfo>;

    fn fork(&mut self);

    fn revert(&mut self);

    fn commit(&mut self) -> SnapshotResult<()>;

    /// Drop every layer and every node.
    fn clear(&mut self);

    fn node_count(&self) -> usize {
        self.node_infos().len()
    }
}

/// Snapshot that deep-copies the current layer on every fork.
#[derive(Debug, Clone)]
pub struct BasicClusterSnapshot {
    layers: Vec<BTreeMap<String, NodeInfo>>,
}

impl Default for BasicClusterSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicClusterSnapshot {
    pub fn new() -> Self {
        Self {
            layers: vec![BTreeMap::new()],
        }
    }

    /// Build a snapshot of `nodes` with every scheduled pod attached to
    /// the node named in its spec. Pods bound to unknown nodes are
    /// ignored.
    pub fn from_cluster(nodes: &[Node], scheduled_pods: &[PodRef]) -> SnapshotResult<Self> {
        let mut snapshot = Self::new();
        for node in nodes {
            snapshot.add_node_info(NodeInfo::new(node.clone()))?;
        }
        for pod in scheduled_pods {
            if let Some(node_name) = &pod.spec.node_name
                && snapshot.get_node_info(node_name).is_some()
            {
                snapshot.add_pod(pod.clone(), node_name)?;
            }
        }
        Ok(snapshot)
    }

    /// Number of open forks.
    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    fn current(&self) -> &BTreeMap<String, NodeInfo> {
        &self.layers[self.layers.len() - 1]
    }

    fn current_mut(&mut self) -> &mut BTreeMap<String, NodeInfo> {
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }
}

impl ClusterSnapshot for BasicClusterSnapshot {
    fn add_node_info(&mut self, info: NodeInfo) -> SnapshotResult<()> {
        let layer = self.current_mut();
        if layer.contains_key(info.name()) {
            return Err(SnapshotError::NodeAlreadyExists(info.name().to_string()));
        }
        layer.insert(info.name().to_string(), info);
        Ok(())
    }

    fn remove_node_info(&mut self, node_name: &str) -> SnapshotResult<()> {
        self.current_mut()
            .remove(node_name)
            .map(|_| ())
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))
    }

    fn add_pod(&mut self, pod: PodRef, node_name: &str) -> SnapshotResult<()> {
        let info = self
            .current_mut()
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        info.add_pod(pod);
        Ok(())
    }

    fn remove_pod(&mut self, pod_uid: &str, node_name: &str) -> SnapshotResult<()> {
        let info = self
            .current_mut()
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound(node_name.to_string()))?;
        if info.remove_pod(pod_uid) {
            Ok(())
        } else {
            Err(SnapshotError::PodNotFound(pod_uid.to_string()))
        }
    }

    fn get_node_info(&self, node_name: &str) -> Option<&NodeInfo> {
        self.current().get(node_name)
    }

    fn node_infos(&self) -> Vec<&NodeInfo> {
        self.current().values().collect()
    }

    fn fork(&mut self) {
        let copy = self.current().clone();
        self.layers.push(copy);
    }

    fn revert(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    fn commit(&mut self) -> SnapshotResult<()> {
        if self.layers.len() < 2 {
            return Err(SnapshotError::NotForked);
        }
        if let Some(top) = self.layers.pop() {
            *self.current_mut() = top;
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.layers = vec![BTreeMap::new()];
    }
}

/// Forks a snapshot for its lifetime and reverts on drop, so no
/// simulation leaks out of the bracket on any exit path.
pub struct ForkGuard<'a> {
    snapshot: &'a mut (dyn ClusterSnapshot + 'a),
    committed: bool,
}

impl<'a> ForkGuard<'a> {
    pub fn new(snapshot: &'a mut (dyn ClusterSnapshot + 'a)) -> Self {
        snapshot.fork();
        Self {
            snapshot,
            committed: false,
        }
    }

    /// Keep the changes made under this guard.
    pub fn commit(mut self) -> SnapshotResult<()> {
        self.committed = true;
        self.snapshot.commit()
    }
}

impl<'a> Deref for ForkGuard<'a> {
    type Target = dyn ClusterSnapshot + 'a;

    fn deref(&self) -> &Self::Target {
        self.snapshot
    }
}

impl DerefMut for ForkGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.snapshot
    }
}

impl Drop for ForkGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.snapshot.revert();
        }
    }
}
