//! Exponential backoff for node groups that failed to scale up.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use kubescale_core::AutoscalerError;
use tracing::debug;

/// Backoff state of one node group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackoffStatus {
    pub is_backed_off: bool,
    /// The failure that caused the backoff.
    pub error: Option<AutoscalerError>,
}

#[derive(Debug, Clone)]
struct BackoffEntry {
    duration: Duration,
    until: Instant,
    last_failed: Instant,
    error: AutoscalerError,
}

/// Doubles the backoff on every failure, up to `max`. A failure more than
/// `reset_timeout` after the previous one starts again from `initial`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    reset_timeout: Duration,
    entries: HashMap<String, BackoffEntry>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, reset_timeout: Duration) -> Self {
        Self {
            initial,
            max,
            reset_timeout,
            entries: HashMap::new(),
        }
    }

    /// Back off `group_id` after a failure at `now`; returns when the
    /// backoff ends.
    pub fn backoff(&mut self, group_id: &str, error: AutoscalerError, now: Instant) -> Instant {
        let duration = match self.entries.get(group_id) {
            Some(entry) if now.duration_since(entry.last_failed) <= self.reset_timeout => {
                (entry.duration * 2).min(self.max)
            }
            _ => self.initial,
        };
        let until = now + duration;
        debug!(node_group = group_id, backoff_secs = duration.as_secs(), "node group backed off");
        self.entries.insert(
            group_id.to_string(),
            BackoffEntry {
                duration,
                until,
                last_failed: now,
                error,
            },
        );
        until
    }

    pub fn status(&self, group_id: &str, now: Instant) -> BackoffStatus {
        match self.entries.get(group_id) {
            Some(entry) if now < entry.until => BackoffStatus {
                is_backed_off: true,
                error: Some(entry.error.clone()),
            },
            _ => BackoffStatus::default(),
        }
    }

    pub fn remove(&mut self, group_id: &str) {
        self.entries.remove(group_id);
    }

    /// Forget groups whose last failure is older than the reset timeout.
    pub fn remove_stale(&mut self, now: Instant) {
        let reset = self.reset_timeout;
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_failed) <= reset);
    }
}
