//! Nodes and taints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    /// Whether the scheduler refuses pods that do not tolerate this taint.
    pub fn blocks_scheduling(&self) -> bool {
        matches!(self.effect, TaintEffect::NoSchedule | TaintEffect::NoExecute)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub capacity: ResourceList,
    #[serde(default)]
    pub allocatable: ResourceList,
    #[serde(default)]
    pub unschedulable: bool,
    #[serde(default = "default_ready")]
    pub ready: bool,
    /// Provider-specific identifier, used to map a node back to its group.
    #[serde(default)]
    pub provider_id: String,
}

fn default_ready() -> bool {
    true
}

impl Node {
    /// A ready node whose allocatable equals its capacity.
    pub fn new(name: &str, capacity: ResourceList) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(crate::labels::HOSTNAME.to_string(), name.to_string());
        Self {
            name: name.to_string(),
            labels,
            taints: Vec::new(),
            allocatable: capacity.clone(),
            capacity,
            unschedulable: false,
            ready: true,
            provider_id: name.to_string(),
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.taints.push(taint);
        self
    }
}
