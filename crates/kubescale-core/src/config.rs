//! Autoscaler configuration (`autoscaler.toml`).
//!
//! Every field has a default so an empty file is a valid configuration.
//! Durations are written as strings with an `s`, `m` or `h` suffix
//! (`"10s"`, `"5m"`, `"3h"`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{AutoscalerError, ErrorKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for AutoscalerError {
    fn from(err: ConfigError) -> Self {
        AutoscalerError::from_error(ErrorKind::Configuration, err)
    }
}

/// Per-node-group options. Groups may override the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupAutoscalingOptions {
    /// The group only ever has zero nodes or `max_size` nodes.
    pub zero_or_max_node_scaling: bool,
}

/// Cluster-wide resource maxima. Zero means "no limit".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    pub max_cores_total: i64,
    pub max_memory_total: i64,
    pub min_cores_total: i64,
    pub min_memory_total: i64,
    /// Custom resources (GPUs, ...) keyed by resource name.
    pub max_custom: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalingOptions {
    pub max_nodes_total: usize,
    pub balance_similar_node_groups: bool,
    pub balancing_extra_ignored_labels: Vec<String>,
    pub balancing_labels: Vec<String>,
    pub parallel_scale_up: bool,
    pub async_node_groups_enabled: bool,
    pub node_autoprovisioning_enabled: bool,
    pub max_nodes_per_scale_up: usize,
    pub max_node_group_binpacking_duration: String,
    pub max_binpacking_time: String,
    pub expander: String,
    pub node_group_defaults: NodeGroupAutoscalingOptions,
    pub initial_node_group_backoff_duration: String,
    pub max_node_group_backoff_duration: String,
    pub node_group_backoff_reset_timeout: String,
    pub max_node_provision_time: String,
    pub node_info_cache_expire_time: String,
    pub ignored_taints: Vec<String>,
    pub startup_taints: Vec<String>,
    pub status_taints: Vec<String>,
    pub resource_limits: Option<ResourceLimitsConfig>,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            max_nodes_total: 0,
            balance_similar_node_groups: false,
            balancing_extra_ignored_labels: Vec::new(),
            balancing_labels: Vec::new(),
            parallel_scale_up: false,
            async_node_groups_enabled: false,
            node_autoprovisioning_enabled: false,
            max_nodes_per_scale_up: 1000,
            max_node_group_binpacking_duration: "10s".to_string(),
            max_binpacking_time: "5m".to_string(),
            expander: "least-waste".to_string(),
            node_group_defaults: NodeGroupAutoscalingOptions::default(),
            initial_node_group_backoff_duration: "5m".to_string(),
            max_node_group_backoff_duration: "30m".to_string(),
            node_group_backoff_reset_timeout: "3h".to_string(),
            max_node_provision_time: "15m".to_string(),
            node_info_cache_expire_time: "87600h".to_string(),
            ignored_taints: Vec::new(),
            startup_taints: Vec::new(),
            status_taints: Vec::new(),
            resource_limits: None,
        }
    }
}

impl AutoscalingOptions {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: AutoscalingOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject contradictory or unparseable settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.balancing_labels.is_empty() && !self.balancing_extra_ignored_labels.is_empty() {
            return Err(ConfigError::Invalid(
                "balancing_labels and balancing_extra_ignored_labels are mutually exclusive"
                    .to_string(),
            ));
        }
        if !matches!(
            self.expander.as_str(),
            "most-pods" | "least-waste" | "least-nodes"
        ) {
            return Err(ConfigError::Invalid(format!(
                "unknown expander {:?}",
                self.expander
            )));
        }
        self.binpacking_duration_per_group()?;
        self.max_binpacking_time()?;
        self.initial_backoff()?;
        self.max_backoff()?;
        self.backoff_reset_timeout()?;
        self.max_node_provision_time()?;
        self.node_info_cache_ttl()?;
        Ok(())
    }

    pub fn binpacking_duration_per_group(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "max_node_group_binpacking_duration",
            &self.max_node_group_binpacking_duration,
        )
    }

    pub fn max_binpacking_time(&self) -> Result<Duration, ConfigError> {
        parse_duration("max_binpacking_time", &self.max_binpacking_time)
    }

    pub fn initial_backoff(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "initial_node_group_backoff_duration",
            &self.initial_node_group_backoff_duration,
        )
    }

    pub fn max_backoff(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "max_node_group_backoff_duration",
            &self.max_node_group_backoff_duration,
        )
    }

    pub fn backoff_reset_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "node_group_backoff_reset_timeout",
            &self.node_group_backoff_reset_timeout,
        )
    }

    pub fn max_node_provision_time(&self) -> Result<Duration, ConfigError> {
        parse_duration("max_node_provision_time", &self.max_node_provision_time)
    }

    pub fn node_info_cache_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration(
            "node_info_cache_expire_time",
            &self.node_info_cache_expire_time,
        )
    }

    /// Every taint key that must never appear on a template node.
    pub fn template_ignored_taints(&self) -> Vec<String> {
        self.ignored_taints
            .iter()
            .chain(&self.startup_taints)
            .chain(&self.status_taints)
            .cloned()
            .collect()
    }
}

/// Parse `"30s"`, `"5m"`, `"3h"` or a bare number of seconds.
pub fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let s = value.trim();
    let invalid = || ConfigError::Duration {
        field,
        value: value.to_string(),
    };
    let (digits, multiplier) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    n.checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}
