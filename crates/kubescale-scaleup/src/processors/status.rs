//! Consumers of scale-up statuses.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kubescale_cloud::NodeGroupRef;
use kubescale_core::EventRecorder;
use tracing::debug;

use crate::status::{NoScaleUpInfo, ScaleUpResult, ScaleUpStatus};

pub const NOT_TRIGGER_SCALE_UP: &str = "NotTriggerScaleUp";
pub const TRIGGERED_SCALE_UP: &str = "TriggeredScaleUp";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub trait ScaleUpStatusProcessor: Send + Sync {
    fn process(&self, status: &ScaleUpStatus);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpScaleUpStatusProcessor;

impl ScaleUpStatusProcessor for NoOpScaleUpStatusProcessor {
    fn process(&self, _status: &ScaleUpStatus) {}
}

/// Runs several processors in order. Calls are serialized, so the inner
/// processors never see two statuses at once even when statuses come
/// from concurrent initializers.
#[derive(Default)]
pub struct CombinedScaleUpStatusProcessor {
    processors: Vec<Arc<dyn ScaleUpStatusProcessor>>,
    serial: Mutex<()>,
}

impl CombinedScaleUpStatusProcessor {
    pub fn new(processors: Vec<Arc<dyn ScaleUpStatusProcessor>>) -> Self {
        Self {
            processors,
            serial: Mutex::new(()),
        }
    }
}

impl ScaleUpStatusProcessor for CombinedScaleUpStatusProcessor {
    fn process(&self, status: &ScaleUpStatus) {
        let _serial = lock(&self.serial);
        for processor in &self.processors {
            processor.process(status);
        }
    }
}

/// Emits per-pod `TriggeredScaleUp` and `NotTriggerScaleUp` events.
pub struct EventingScaleUpStatusProcessor {
    recorder: Arc<dyn EventRecorder>,
}

impl EventingScaleUpStatusProcessor {
    pub fn new(recorder: Arc<dyn EventRecorder>) -> Self {
        Self { recorder }
    }
}

impl ScaleUpStatusProcessor for EventingScaleUpStatusProcessor {
    fn process(&self, status: &ScaleUpStatus) {
        if matches!(status.result, ScaleUpResult::Successful | ScaleUpResult::Error) {
            debug!("skipping unschedulable pod events, a scale-up was attempted this loop");
        } else {
            let considered: HashMap<String, &NodeGroupRef> = status
                .considered_node_groups
                .iter()
                .map(|g| (g.id(), g))
                .collect();
            for info in &status.pods_remain_unschedulable {
                self.recorder.normal(
                    &info.pod.key(),
                    NOT_TRIGGER_SCALE_UP,
                    format!("pod didn't trigger scale-up: {}", reasons_message(info, &considered)),
                );
            }
        }

        if !status.scale_up_infos.is_empty() {
            let infos: Vec<String> = status.scale_up_infos.iter().map(ToString::to_string).collect();
            for pod in &status.pods_triggered_scale_up {
                self.recorder.normal(
                    &pod.key(),
                    TRIGGERED_SCALE_UP,
                    format!("pod triggered scale-up: [{}]", infos.join(" ")),
                );
            }
        }
    }
}

/// "`count` `reason`" for every reason given by an existing considered
/// group, sorted.
fn reasons_message(info: &NoScaleUpInfo, considered: &HashMap<String, &NodeGroupRef>) -> String {
    let mut aggregated: BTreeMap<&str, usize> = BTreeMap::new();
    let per_group = info
        .rejected_node_groups
        .iter()
        .chain(info.skipped_node_groups.iter());
    for (group_id, reasons) in per_group {
        if !considered.get(group_id).is_some_and(|g| g.exist()) {
            continue;
        }
        for reason in reasons.reasons() {
            *aggregated.entry(reason.as_str()).or_insert(0) += 1;
        }
    }
    let mut messages: Vec<String> = aggregated
        .into_iter()
        .map(|(reason, count)| format!("{count} {reason}"))
        .collect();
    messages.sort();
    messages.join(", ")
}

/// Keeps every processed status.
#[derive(Debug, Default)]
pub struct RecordingScaleUpStatusProcessor {
    statuses: Mutex<Vec<ScaleUpStatus>>,
}

impl RecordingScaleUpStatusProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<ScaleUpStatus> {
        lock(&self.statuses).clone()
    }

    pub fn last(&self) -> Option<ScaleUpStatus> {
        lock(&self.statuses).last().cloned()
    }
}

impl ScaleUpStatusProcessor for RecordingScaleUpStatusProcessor {
    fn process(&self, status: &ScaleUpStatus) {
        lock(&self.statuses).push(status.clone());
    }
}
