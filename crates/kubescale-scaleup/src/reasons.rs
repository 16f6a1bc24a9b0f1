//! Why a node group was not used for a pod.

use std::fmt;

use kubescale_simulator::SchedulingError;
use serde::Serialize;

/// One or more human-readable reasons a node group was skipped or
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Reasons(Vec<String>);

impl Reasons {
    pub fn new(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    pub fn reasons(&self) -> &[String] {
        &self.0
    }

    pub fn backoff() -> Self {
        Self::new("in backoff after failed scale-up")
    }

    pub fn max_limit_reached() -> Self {
        Self::new("max node group size reached")
    }

    pub fn not_ready() -> Self {
        Self::new("not ready for scale-up")
    }

    pub fn all_or_nothing() -> Self {
        Self::new("not all pods would fit and scale-up is atomic")
    }

    pub fn atomic_exceeds_node_cap() -> Self {
        Self::new("atomic scale-up exceeds cluster node count limit")
    }

    pub fn max_resource_limit_reached(resources: &[String]) -> Self {
        Self::new(format!("max cluster {} limit reached", resources.join(", ")))
    }
}

impl From<&SchedulingError> for Reasons {
    fn from(err: &SchedulingError) -> Self {
        Self(err.reasons())
    }
}

impl fmt::Display for Reasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}
