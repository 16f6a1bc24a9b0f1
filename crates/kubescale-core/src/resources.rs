//! Resource lists keyed by resource name.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";

/// A set of named quantities (cpu in millicores, memory in bytes, counts
/// for everything else).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Convenience constructor for the common cpu/memory pair.
    pub fn cpu_memory(cpu_millis: i64, memory_bytes: i64) -> Self {
        let mut list = Self::new();
        list.set(CPU, cpu_millis);
        list.set(MEMORY, memory_bytes);
        list
    }

    pub fn with(mut self, name: &str, value: i64) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), value);
    }

    /// Quantity for `name`, zero when absent.
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn cpu_millis(&self) -> i64 {
        self.get(CPU)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.get(MEMORY)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Add every quantity of `other` into `self`.
    pub fn add(&mut self, other: &ResourceList) {
        for (name, value) in other.iter() {
            *self.0.entry(name.to_string()).or_insert(0) += value;
        }
    }

    /// Subtract every quantity of `other` from `self`.
    pub fn sub(&mut self, other: &ResourceList) {
        for (name, value) in other.iter() {
            *self.0.entry(name.to_string()).or_insert(0) -= value;
        }
    }

    /// `self - other` for every name present in `self`.
    pub fn minus(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, value) in out.0.iter_mut() {
            *value -= other.get(name);
        }
        out
    }
}

impl FromIterator<(String, i64)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Whole cores for a millicore quantity, rounded up.
pub fn millis_to_cores(millis: i64) -> i64 {
    if millis <= 0 {
        return 0;
    }
    (millis + 999) / 1000
}
