//! Template node infos: what a brand-new node of a group would look like.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kubescale_cloud::NodeGroup;
use kubescale_core::labels::HOSTNAME;
use kubescale_core::{AutoscalerError, AutoscalerResult, AutoscalingOptions, DaemonSet, Node, NodeInfo, Pod};

/// Taint the autoscaler itself puts on nodes it is removing.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";
/// Soft taint marking scale-down candidates.
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";
pub const STARTUP_TAINT_PREFIX: &str = "startup-taint.cluster-autoscaler.kubernetes.io/";
pub const STATUS_TAINT_PREFIX: &str = "status-taint.cluster-autoscaler.kubernetes.io/";
const UNSCHEDULABLE_TAINT: &str = "node.kubernetes.io/unschedulable";
const NOT_READY_TAINT: &str = "node.kubernetes.io/not-ready";

static TEMPLATE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Taints that never carry over to a template: startup and status taints
/// appear on live nodes only transiently.
#[derive(Debug, Clone, Default)]
pub struct TaintConfig {
    startup: HashSet<String>,
    status: HashSet<String>,
}

impl TaintConfig {
    pub fn new(startup: impl IntoIterator<Item = String>, status: impl IntoIterator<Item = String>) -> Self {
        Self {
            startup: startup.into_iter().collect(),
            status: status.into_iter().collect(),
        }
    }

    /// Ignored taints behave like startup taints.
    pub fn from_options(options: &AutoscalingOptions) -> Self {
        Self::new(
            options
                .ignored_taints
                .iter()
                .chain(&options.startup_taints)
                .cloned(),
            options.status_taints.iter().cloned(),
        )
    }

    pub fn is_startup_taint(&self, key: &str) -> bool {
        self.startup.contains(key) || key.starts_with(STARTUP_TAINT_PREFIX)
    }

    pub fn is_status_taint(&self, key: &str) -> bool {
        self.status.contains(key) || key.starts_with(STATUS_TAINT_PREFIX)
    }

    /// Whether `key` is stripped from template nodes.
    pub fn is_sanitized(&self, key: &str) -> bool {
        matches!(
            key,
            TO_BE_DELETED_TAINT | DELETION_CANDIDATE_TAINT | UNSCHEDULABLE_TAINT | NOT_READY_TAINT
        ) || self.is_startup_taint(key)
            || self.is_status_taint(key)
    }
}

/// Template node info for `group`, sanitised and populated with the
/// daemon-set pods that would run on it.
pub fn template_node_info_from_node_group(
    group: &dyn NodeGroup,
    daemon_sets: &[DaemonSet],
    taint_config: &TaintConfig,
) -> AutoscalerResult<NodeInfo> {
    let base = group.template_node_info().map_err(|e| {
        AutoscalerError::from(e)
            .add_prefix(format!("failed to obtain template for node group {}: ", group.id()))
    })?;
    Ok(sanitized_template_node_info(
        &base,
        &group.id(),
        daemon_sets,
        taint_config,
    ))
}

/// Copy `base` under a fresh template name. Pods that belong to the
/// node's lifecycle (daemon and mirror pods) are kept, every other pod
/// is dropped, and daemon sets missing from the node are added when they
/// would schedule there.
pub fn sanitized_template_node_info(
    base: &NodeInfo,
    group_id: &str,
    daemon_sets: &[DaemonSet],
    taint_config: &TaintConfig,
) -> NodeInfo {
    let id = TEMPLATE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("template-node-for-{group_id}-{id}");
    let node = sanitize_node(&base.node, &name, taint_config);

    let mut info = NodeInfo::new(node);
    let mut running_ds = HashSet::new();
    for pod in base.pods.iter().filter(|p| p.is_daemon_set_pod() || is_mirror_pod(p)) {
        if let Some(owner) = pod.controller_ref() {
            running_ds.insert(owner.uid.clone());
        }
        info.add_pod(Arc::new(renamed_pod(pod, &name)));
    }
    for ds in daemon_sets {
        if running_ds.contains(&ds.uid) || !daemon_set_runs_on(ds, &info.node) {
            continue;
        }
        info.add_pod(Arc::new(ds.pod_for_node(&name)));
    }
    info
}

/// Independent copy of a template for simulation, named `name`. Pod
/// identities are re-suffixed so copies never share a pod uid.
pub fn node_info_copy(template: &NodeInfo, name: &str) -> NodeInfo {
    let mut node = template.node.clone();
    node.name = name.to_string();
    node.provider_id = name.to_string();
    node.labels.insert(HOSTNAME.to_string(), name.to_string());
    NodeInfo::with_pods(
        node,
        template.pods.iter().map(|p| Arc::new(renamed_pod(p, name))),
    )
}

fn sanitize_node(node: &Node, name: &str, taint_config: &TaintConfig) -> Node {
    let mut node = node.clone();
    node.name = name.to_string();
    node.provider_id = name.to_string();
    node.unschedulable = false;
    node.ready = true;
    node.labels.insert(HOSTNAME.to_string(), name.to_string());
    node.taints.retain(|t| !taint_config.is_sanitized(&t.key));
    node
}

fn renamed_pod(pod: &Pod, node_name: &str) -> Pod {
    let mut pod = pod.clone();
    pod.uid = format!("{}-{node_name}", pod.uid);
    pod.name = format!("{}-{node_name}", pod.name);
    pod.spec.node_name = Some(node_name.to_string());
    pod
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.owner_references.iter().any(|o| o.kind == "Node")
}

/// Whether the daemon set's pod template admits `node`.
pub fn daemon_set_runs_on(ds: &DaemonSet, node: &Node) -> bool {
    let selector_ok = ds
        .template
        .node_selector
        .iter()
        .all(|(k, v)| node.labels.get(k) == Some(v));
    let affinity_ok = ds
        .template
        .affinity
        .required_node_affinity
        .iter()
        .all(|req| req.matches(&node.labels));
    let taints_ok = node
        .taints
        .iter()
        .filter(|t| t.blocks_scheduling())
        .all(|taint| ds.template.tolerations.iter().any(|t| t.tolerates(taint)));
    selector_ok && affinity_ok && taints_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubescale_cloud::{TestCloudProvider, TestNodeGroupSpec};
    use kubescale_core::{PodSpec, ResourceList, Taint, TaintEffect};
    use kubescale_core::resources::CPU;
    use kubescale_core::{Container, OwnerReference};

    fn daemon_set(name: &str, selector: Option<(&str, &str)>) -> DaemonSet {
        let mut template = PodSpec {
            containers: vec![Container {
                name: "agent".to_string(),
                requests: ResourceList::new().with(CPU, 50),
                ..Default::default()
            }],
            ..Default::default()
        };
        if let Some((k, v)) = selector {
            template.node_selector.insert(k.to_string(), v.to_string());
        }
        DaemonSet {
            namespace: "kube-system".to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            labels: Default::default(),
            template,
        }
    }

    fn base_node() -> Node {
        Node::new("real-node", ResourceList::cpu_memory(2000, 4096))
            .with_label("pool", "web")
            .with_taint(Taint {
                key: TO_BE_DELETED_TAINT.to_string(),
                value: String::new(),
                effect: TaintEffect::NoSchedule,
            })
            .with_taint(Taint {
                key: "startup-taint.cluster-autoscaler.kubernetes.io/cni".to_string(),
                value: String::new(),
                effect: TaintEffect::NoSchedule,
            })
            .with_taint(Taint {
                key: "custom-ignored".to_string(),
                value: String::new(),
                effect: TaintEffect::NoSchedule,
            })
            .with_taint(Taint {
                key: "dedicated".to_string(),
                value: "web".to_string(),
                effect: TaintEffect::PreferNoSchedule,
            })
    }

    fn ignoring_custom() -> TaintConfig {
        TaintConfig::new(vec!["custom-ignored".to_string()], Vec::new())
    }

    #[test]
    fn sanitises_taints_and_name() {
        let options = AutoscalingOptions {
            ignored_taints: vec!["custom-ignored".to_string()],
            ..Default::default()
        };
        let config = TaintConfig::from_options(&options);
        let info = sanitized_template_node_info(&NodeInfo::new(base_node()), "ng1", &[], &config);

        assert!(info.name().starts_with("template-node-for-ng1-"));
        assert_eq!(info.node.labels.get(HOSTNAME).map(String::as_str), Some(info.name()));
        let keys: Vec<&str> = info.node.taints.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["dedicated"]);
    }

    #[test]
    fn adds_matching_daemon_sets_once() {
        let running = daemon_set("logging", None).pod_for_node("real-node");
        let mut user_pod = Pod {
            uid: "user".to_string(),
            ..Default::default()
        };
        user_pod.owner_references.push(OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: "web".to_string(),
            uid: "rs".to_string(),
            controller: true,
        });
        let base = NodeInfo::with_pods(base_node(), [Arc::new(running), Arc::new(user_pod)]);
        let daemon_sets = vec![
            daemon_set("logging", None),
            daemon_set("web-agent", Some(("pool", "web"))),
            daemon_set("batch-agent", Some(("pool", "batch"))),
        ];

        let info = sanitized_template_node_info(&base, "ng1", &daemon_sets, &ignoring_custom());
        let owners: Vec<String> = info
            .pods
            .iter()
            .filter_map(|p| p.controller_ref().map(|o| o.name.clone()))
            .collect();
        assert_eq!(owners, vec!["logging".to_string(), "web-agent".to_string()]);
        assert_eq!(info.requested.cpu_millis(), 100);
        assert!(info.pods.iter().all(|p| p.spec.node_name.as_deref() == Some(info.name())));
    }

    #[test]
    fn copies_do_not_share_pod_uids() {
        let ds = daemon_set("logging", None);
        let template = sanitized_template_node_info(
            &NodeInfo::new(base_node()),
            "ng1",
            &[ds],
            &ignoring_custom(),
        );
        assert_eq!(template.pods.len(), 1);
        let a = node_info_copy(&template, "e-1");
        let b = node_info_copy(&template, "e-2");
        assert_eq!(a.name(), "e-1");
        assert_ne!(a.pods[0].uid, b.pods[0].uid);
        assert_eq!(a.requested, template.requested);
    }

    #[test]
    fn from_node_group() {
        let provider = TestCloudProvider::new();
        let with_template = provider.add_node_group(
            TestNodeGroupSpec::new("ng1", 0, 5, 1).with_template(NodeInfo::new(base_node())),
        );
        let without = provider.add_node_group(TestNodeGroupSpec::new("ng2", 0, 5, 1));

        let info =
            template_node_info_from_node_group(with_template.as_ref(), &[], &TaintConfig::default())
                .unwrap();
        assert_eq!(info.node.capacity.cpu_millis(), 2000);

        let err = template_node_info_from_node_group(without.as_ref(), &[], &TaintConfig::default())
            .unwrap_err();
        assert!(err.message.starts_with("failed to obtain template for node group ng2: "));
    }
}
