//! The outcome of one scale-up attempt.

use std::collections::BTreeMap;

use kubescale_cloud::NodeGroupRef;
use kubescale_core::{AutoscalerError, PodRef};
use serde::Serialize;

use crate::nodegroupset::ScaleUpInfo;
use crate::reasons::Reasons;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ScaleUpResult {
    /// At least one group was resized.
    Successful,
    /// No group could help the pending pods.
    NoOptionsAvailable,
    Error,
    /// There was nothing to do.
    NotNeeded,
    #[default]
    NotTried,
    InCooldown,
}

/// Why a pod that stays unschedulable was not helped by any group.
#[derive(Debug, Clone)]
pub struct NoScaleUpInfo {
    pub pod: PodRef,
    /// Groups whose template node could not fit the pod.
    pub rejected_node_groups: BTreeMap<String, Reasons>,
    /// Groups that were not considered at all.
    pub skipped_node_groups: BTreeMap<String, Reasons>,
}

#[derive(Debug, Clone, Default)]
pub struct ScaleUpStatus {
    pub result: ScaleUpResult,
    pub scale_up_error: Option<AutoscalerError>,
    pub scale_up_infos: Vec<ScaleUpInfo>,
    pub pods_triggered_scale_up: Vec<PodRef>,
    pub pods_remain_unschedulable: Vec<NoScaleUpInfo>,
    pub pods_await_evaluation: Vec<PodRef>,
    pub created_node_groups: Vec<NodeGroupRef>,
    pub considered_node_groups: Vec<NodeGroupRef>,
    pub failed_creation_node_groups: Vec<NodeGroupRef>,
    pub failed_resize_node_groups: Vec<NodeGroupRef>,
}

impl ScaleUpStatus {
    pub fn with_result(result: ScaleUpResult) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    /// An `Error` status carrying `err`. The rest of `self` is kept.
    pub fn into_error(mut self, err: AutoscalerError) -> Self {
        self.result = ScaleUpResult::Error;
        self.scale_up_error = Some(err);
        self
    }

    pub fn was_successful(&self) -> bool {
        self.result == ScaleUpResult::Successful
    }

    /// A serializable view with pods and groups reduced to their names.
    pub fn summary(&self) -> ScaleUpStatusSummary {
        let pod_names = |pods: &[PodRef]| pods.iter().map(|p| p.key()).collect();
        let group_ids = |groups: &[NodeGroupRef]| groups.iter().map(|g| g.id()).collect();
        ScaleUpStatusSummary {
            result: self.result,
            error: self.scale_up_error.clone(),
            scale_ups: self
                .scale_up_infos
                .iter()
                .map(|info| ScaleUpSummary {
                    node_group: info.group.id(),
                    current_size: info.current_size,
                    new_size: info.new_size,
                    max_size: info.max_size,
                })
                .collect(),
            pods_triggered_scale_up: pod_names(&self.pods_triggered_scale_up),
            pods_remain_unschedulable: self
                .pods_remain_unschedulable
                .iter()
                .map(|info| UnschedulablePodSummary {
                    pod: info.pod.key(),
                    rejected: info.rejected_node_groups.clone(),
                    skipped: info.skipped_node_groups.clone(),
                })
                .collect(),
            pods_await_evaluation: pod_names(&self.pods_await_evaluation),
            created_node_groups: group_ids(&self.created_node_groups),
            considered_node_groups: group_ids(&self.considered_node_groups),
            failed_creation_node_groups: group_ids(&self.failed_creation_node_groups),
            failed_resize_node_groups: group_ids(&self.failed_resize_node_groups),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleUpSummary {
    pub node_group: String,
    pub current_size: usize,
    pub new_size: usize,
    pub max_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnschedulablePodSummary {
    pub pod: String,
    pub rejected: BTreeMap<String, Reasons>,
    pub skipped: BTreeMap<String, Reasons>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleUpStatusSummary {
    pub result: ScaleUpResult,
    pub error: Option<AutoscalerError>,
    pub scale_ups: Vec<ScaleUpSummary>,
    pub pods_triggered_scale_up: Vec<String>,
    pub pods_remain_unschedulable: Vec<UnschedulablePodSummary>,
    pub pods_await_evaluation: Vec<String>,
    pub created_node_groups: Vec<String>,
    pub considered_node_groups: Vec<String>,
    pub failed_creation_node_groups: Vec<String>,
    pub failed_resize_node_groups: Vec<String>,
}
