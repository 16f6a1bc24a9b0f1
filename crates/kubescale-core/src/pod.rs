//! Pods, daemon sets, and the scheduling-relevant part of a pod spec.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::node::{Taint, TaintEffect};
use crate::resources::ResourceList;

/// Shared handle to a pod. Pods are referenced by handle across the
/// equivalence groups, expansion options and status of one tick.
pub type PodRef = Arc<Pod>;

const DAEMON_SET_KIND: &str = "DaemonSet";

/// Owner reference; only the controller owner matters for grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default = "default_true")]
    pub controller: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub nominated_node_name: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    /// Node the pod is bound to, if any.
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub affinity: Affinity,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub service_account_name: Option<String>,
    pub priority_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub container_port: u16,
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    EmptyDir,
    HostPath { path: String },
    ConfigMap { name: String },
    Secret { secret_name: String },
    /// Projected sources (service account token, downward API, ...).
    Projected { sources: Vec<String> },
    PersistentVolumeClaim { claim_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TolerationOperator {
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default)]
    pub key: String,
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Whether this toleration tolerates `taint`.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        if self.key.is_empty() {
            return self.operator == TolerationOperator::Exists;
        }
        if self.key != taint.key {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => true,
            TolerationOperator::Equal => self.value == taint.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            NodeSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            NodeSelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            NodeSelectorOperator::Exists => value.is_some(),
            NodeSelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Required pod anti-affinity term: no pod matching `label_selector` may
/// share the `topology_key` domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    pub label_selector: BTreeMap<String, String>,
    pub topology_key: String,
}

impl PodAffinityTerm {
    pub fn selects(&self, pod: &Pod) -> bool {
        self.label_selector
            .iter()
            .all(|(k, v)| pod.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Affinity {
    #[serde(default)]
    pub required_node_affinity: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub pod_anti_affinity: Vec<PodAffinityTerm>,
}

impl Pod {
    /// The controlling owner, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.controller)
    }

    pub fn is_daemon_set_pod(&self) -> bool {
        self.controller_ref()
            .is_some_and(|o| o.kind == DAEMON_SET_KIND)
    }

    /// Sum of container requests.
    pub fn requests(&self) -> ResourceList {
        let mut total = ResourceList::new();
        for container in &self.spec.containers {
            total.add(&container.requests);
        }
        total
    }

    /// Host ports claimed by this pod as `(protocol, port)` pairs.
    pub fn host_ports(&self) -> HashSet<(String, u16)> {
        self.spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .filter_map(|p| p.host_port.map(|hp| (p.protocol.clone(), hp)))
            .collect()
    }

    /// `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl PodSpec {
    /// Copy of the spec with fields that never influence scheduling, but
    /// differ between replicas, stripped out: projected volumes and
    /// pre-bound service account token secrets, plus their mounts.
    pub fn sanitized_for_equivalence(&self) -> PodSpec {
        let mut dropped = HashSet::new();
        let mut spec = self.clone();
        spec.volumes.retain(|volume| {
            let drop = match &volume.source {
                VolumeSource::Projected { .. } => true,
                VolumeSource::Secret { secret_name } => is_service_account_token(secret_name),
                _ => false,
            };
            if drop {
                dropped.insert(volume.name.clone());
            }
            !drop
        });
        for container in &mut spec.containers {
            container
                .volume_mounts
                .retain(|mount| !dropped.contains(&mount.name));
        }
        spec
    }

    /// Scheduling-equivalence of two specs.
    pub fn semantically_equal(&self, other: &PodSpec) -> bool {
        self.sanitized_for_equivalence() == other.sanitized_for_equivalence()
    }
}

/// Legacy service account token secrets are named `<sa>-token-<suffix>`.
fn is_service_account_token(secret_name: &str) -> bool {
    match secret_name.rsplit_once("-token-") {
        Some((sa, suffix)) => !sa.is_empty() && !suffix.is_empty() && !suffix.contains('-'),
        None => false,
    }
}

/// A daemon set as seen by template construction: its pod template runs
/// on every node that the template's selectors and tolerations admit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSet {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub template: PodSpec,
}

impl DaemonSet {
    /// Build the pod this daemon set would run on `node_name`.
    pub fn pod_for_node(&self, node_name: &str) -> Pod {
        let mut spec = self.template.clone();
        spec.node_name = Some(node_name.to_string());
        Pod {
            uid: format!("{}-{}", self.uid, node_name),
            namespace: self.namespace.clone(),
            name: format!("{}-{}", self.name, node_name),
            labels: self.labels.clone(),
            owner_references: vec![OwnerReference {
                kind: DAEMON_SET_KIND.to_string(),
                name: self.name.clone(),
                uid: self.uid.clone(),
                controller: true,
            }],
            spec,
            status: PodStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(name: &str) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: format!("/var/run/{name}"),
        }
    }

    fn spec_with_volume(volume: Volume) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                volume_mounts: vec![mount(&volume.name)],
                ..Default::default()
            }],
            volumes: vec![volume],
            ..Default::default()
        }
    }

    #[test]
    fn projected_volume_names_are_ignored() {
        let a = spec_with_volume(Volume {
            name: "kube-api-access-abcde".to_string(),
            source: VolumeSource::Projected {
                sources: vec!["serviceAccountToken".to_string()],
            },
        });
        let b = spec_with_volume(Volume {
            name: "kube-api-access-xyz12".to_string(),
            source: VolumeSource::Projected {
                sources: vec!["serviceAccountToken".to_string()],
            },
        });
        assert_ne!(a, b);
        assert!(a.semantically_equal(&b));
    }

    #[test]
    fn service_account_token_secrets_are_ignored() {
        let a = spec_with_volume(Volume {
            name: "default-token-aaaaa".to_string(),
            source: VolumeSource::Secret {
                secret_name: "default-token-aaaaa".to_string(),
            },
        });
        let b = spec_with_volume(Volume {
            name: "default-token-bbbbb".to_string(),
            source: VolumeSource::Secret {
                secret_name: "default-token-bbbbb".to_string(),
            },
        });
        assert!(a.semantically_equal(&b));
    }

    #[test]
    fn regular_secrets_still_compared() {
        let a = spec_with_volume(Volume {
            name: "creds".to_string(),
            source: VolumeSource::Secret {
                secret_name: "db-creds".to_string(),
            },
        });
        let b = spec_with_volume(Volume {
            name: "creds".to_string(),
            source: VolumeSource::Secret {
                secret_name: "api-creds".to_string(),
            },
        });
        assert!(!a.semantically_equal(&b));
    }

    #[test]
    fn toleration_matching() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "gpu".to_string(),
            effect: TaintEffect::NoSchedule,
        };
        let exact = Toleration {
            key: "dedicated".to_string(),
            operator: TolerationOperator::Equal,
            value: "gpu".to_string(),
            effect: Some(TaintEffect::NoSchedule),
        };
        let wrong_value = Toleration {
            value: "cpu".to_string(),
            ..exact.clone()
        };
        let wildcard = Toleration {
            key: String::new(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        let wrong_effect = Toleration {
            effect: Some(TaintEffect::NoExecute),
            ..exact.clone()
        };
        assert!(exact.tolerates(&taint));
        assert!(!wrong_value.tolerates(&taint));
        assert!(wildcard.tolerates(&taint));
        assert!(!wrong_effect.tolerates(&taint));
    }

    #[test]
    fn daemon_set_pod_is_recognised() {
        let ds = DaemonSet {
            namespace: "kube-system".to_string(),
            name: "fluentd".to_string(),
            uid: "ds-1".to_string(),
            labels: BTreeMap::new(),
            template: PodSpec::default(),
        };
        let pod = ds.pod_for_node("n1");
        assert!(pod.is_daemon_set_pod());
        assert_eq!(pod.spec.node_name.as_deref(), Some("n1"));
    }
}
