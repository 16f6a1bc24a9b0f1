//! Event recording.
//!
//! Events are the user-facing trail of autoscaler decisions
//! (`ScaledUpGroup`, `FailedToScaleUpGroup`, `TriggeredScaleUp`, ...).
//! Recorders are shared between concurrent executor workers, so
//! implementations must be `Send + Sync`.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Object events about the autoscaler itself are attached to.
pub const AUTOSCALER_OBJECT: &str = "kube-system/cluster-autoscaler-status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub kind: EventKind,
    /// `namespace/name` of the object the event is about.
    pub object: String,
    pub reason: String,
    pub message: String,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, kind: EventKind, object: &str, reason: &str, message: String);

    fn normal(&self, object: &str, reason: &str, message: String) {
        self.record(EventKind::Normal, object, reason, message);
    }

    fn warning(&self, object: &str, reason: &str, message: String) {
        self.record(EventKind::Warning, object, reason, message);
    }
}

/// Emits events as tracing records.
#[derive(Debug, Default)]
pub struct LogEventRecorder;

impl EventRecorder for LogEventRecorder {
    fn record(&self, kind: EventKind, object: &str, reason: &str, message: String) {
        match kind {
            EventKind::Normal => info!(%object, %reason, "{message}"),
            EventKind::Warning => warn!(%object, %reason, "{message}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given reason, in recording order.
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

impl EventRecorder for RecordingEventRecorder {
    fn record(&self, kind: EventKind, object: &str, reason: &str, message: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                kind,
                object: object.to_string(),
                reason: reason.to_string(),
                message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_recorder_filters_by_reason() {
        let recorder = RecordingEventRecorder::new();
        recorder.normal(AUTOSCALER_OBJECT, "ScaledUpGroup", "setting size".to_string());
        recorder.warning(AUTOSCALER_OBJECT, "FailedToScaleUpGroup", "boom".to_string());
        recorder.normal(AUTOSCALER_OBJECT, "ScaledUpGroup", "size set".to_string());

        assert_eq!(recorder.events().len(), 3);
        let scaled = recorder.with_reason("ScaledUpGroup");
        assert_eq!(scaled.len(), 2);
        assert_eq!(scaled[1].message, "size set");
        assert_eq!(recorder.with_reason("FailedToScaleUpGroup")[0].kind, EventKind::Warning);
    }
}
