//! Tracking of node groups that are being created asynchronously.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kubescale_cloud::NodeGroup;

/// Whether a not-yet-existing group is already on its way.
pub trait AsyncNodeGroupStateChecker: Send + Sync {
    fn is_upcoming(&self, node_group: &dyn NodeGroup) -> bool;
}

/// Ids of groups whose asynchronous creation has started but whose
/// initializer has not finished yet.
#[derive(Debug, Default)]
pub struct UpcomingNodeGroups {
    ids: Mutex<BTreeSet<String>>,
}

impl UpcomingNodeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &str) {
        self.ids().insert(id.to_string());
    }

    pub fn remove(&self, id: &str) {
        self.ids().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids().contains(id)
    }

    pub fn list(&self) -> Vec<String> {
        self.ids().iter().cloned().collect()
    }
}

impl AsyncNodeGroupStateChecker for UpcomingNodeGroups {
    fn is_upcoming(&self, node_group: &dyn NodeGroup) -> bool {
        !node_group.exist() && self.contains(&node_group.id())
    }
}
