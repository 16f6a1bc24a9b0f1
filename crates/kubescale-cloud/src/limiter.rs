//! Cluster-wide resource limits reported by the provider.

use std::collections::BTreeMap;

use kubescale_core::ResourceLimitsConfig;
use serde::{Deserialize, Serialize};

/// Limit key for total cluster cores.
pub const RESOURCE_CORES: &str = "cpu";
/// Limit key for total cluster memory, in bytes.
pub const RESOURCE_MEMORY: &str = "memory";

/// Minimum and maximum totals per resource. A resource without a max
/// entry is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimiter {
    min: BTreeMap<String, i64>,
    max: BTreeMap<String, i64>,
}

impl ResourceLimiter {
    pub fn new(min: BTreeMap<String, i64>, max: BTreeMap<String, i64>) -> Self {
        Self { min, max }
    }

    pub fn from_config(config: &ResourceLimitsConfig) -> Self {
        let mut min = BTreeMap::new();
        let mut max = BTreeMap::new();
        if config.max_cores_total > 0 {
            max.insert(RESOURCE_CORES.to_string(), config.max_cores_total);
        }
        if config.max_memory_total > 0 {
            max.insert(RESOURCE_MEMORY.to_string(), config.max_memory_total);
        }
        if config.min_cores_total > 0 {
            min.insert(RESOURCE_CORES.to_string(), config.min_cores_total);
        }
        if config.min_memory_total > 0 {
            min.insert(RESOURCE_MEMORY.to_string(), config.min_memory_total);
        }
        for (name, value) in &config.max_custom {
            max.insert(name.clone(), *value);
        }
        Self { min, max }
    }

    pub fn with_max(mut self, resource: &str, value: i64) -> Self {
        self.max.insert(resource.to_string(), value);
        self
    }

    /// Max for `resource`, zero when unlimited.
    pub fn get_max(&self, resource: &str) -> i64 {
        self.max.get(resource).copied().unwrap_or(0)
    }

    pub fn get_min(&self, resource: &str) -> i64 {
        self.min.get(resource).copied().unwrap_or(0)
    }

    pub fn has_max_limit_set(&self, resource: &str) -> bool {
        self.max.contains_key(resource)
    }

    /// Every resource that has a min or max, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.min.keys().chain(self.max.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    /// Whether any limited resource is neither cores nor memory.
    pub fn has_custom_resources(&self) -> bool {
        self.resources()
            .iter()
            .any(|r| r != RESOURCE_CORES && r != RESOURCE_MEMORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_skips_zero_limits() {
        let mut config = ResourceLimitsConfig {
            max_cores_total: 16,
            ..Default::default()
        };
        config.max_custom.insert("nvidia-tesla-t4".to_string(), 4);
        let limiter = ResourceLimiter::from_config(&config);

        assert_eq!(limiter.get_max(RESOURCE_CORES), 16);
        assert!(!limiter.has_max_limit_set(RESOURCE_MEMORY));
        assert_eq!(limiter.get_max(RESOURCE_MEMORY), 0);
        assert_eq!(limiter.resources(), vec!["cpu", "nvidia-tesla-t4"]);
        assert!(limiter.has_custom_resources());
    }
}
