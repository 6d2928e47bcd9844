//! Deployment progress tracking.
//!
//! Every deployment gets an append-only event log keyed by a caller-supplied
//! tracking id. The status of a log is derived from the stage of the events
//! appended to it:
//!
//! | Stage              | Status      |
//! |--------------------|-------------|
//! | `generation`       | `pending`   |
//! | `sandbox_creation` | `deploying` |
//! | `deployment`       | `deploying` |
//! | `verification`     | `verifying` |
//! | `ready`            | `ready`     |
//! | `error`            | `failed`    |
//!
//! Once a log reaches `ready` or `failed`, later non-terminal events are
//! still recorded but no longer move the status.
//!
//! Listeners registered with [`DeploymentTracker::subscribe`] are called
//! synchronously for every appended event.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Stage tag carried by every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStage {
    /// Waiting on or running code generation
    Generation,
    /// Provisioning the sandbox
    SandboxCreation,
    /// Writing, starting and exposing the generator
    Deployment,
    /// Checking that the public URL answers
    Verification,
    /// Deployment finished
    Ready,
    /// Deployment failed
    Error,
}

impl DeploymentStage {
    /// Status implied by an event of this stage.
    pub fn status(self) -> DeploymentStatus {
        match self {
            Self::Generation => DeploymentStatus::Pending,
            Self::SandboxCreation | Self::Deployment => DeploymentStatus::Deploying,
            Self::Verification => DeploymentStatus::Verifying,
            Self::Ready => DeploymentStatus::Ready,
            Self::Error => DeploymentStatus::Failed,
        }
    }

    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::SandboxCreation => "sandbox_creation",
            Self::Deployment => "deployment",
            Self::Verification => "verification",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Started, nothing provisioned yet
    Pending,
    /// Sandbox being created or code being deployed
    Deploying,
    /// Reachability checks running
    Verifying,
    /// Deployment finished
    Ready,
    /// Deployment failed
    Failed,
}

impl DeploymentStatus {
    /// True for `ready` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One immutable entry in a deployment log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    /// Event ID
    pub id: Uuid,
    /// Time the event was appended
    pub timestamp: DateTime<Utc>,
    /// Stage tag
    pub stage: DeploymentStage,
    /// Human readable message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Optional error string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event log and derived state for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLog {
    /// Tracking ID
    pub id: String,
    /// Time the log was started
    pub start_time: DateTime<Utc>,
    /// Time a terminal stage was reached
    pub end_time: Option<DateTime<Utc>>,
    /// Derived status
    pub status: DeploymentStatus,
    /// Events in append order
    pub events: Vec<DeploymentEvent>,
    /// Sandbox serving this deployment
    pub sandbox_id: Option<String>,
    /// Public URL of the sandbox
    pub sandbox_url: Option<String>,
    /// Failure cause, once failed
    pub error: Option<String>,
}

impl DeploymentLog {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: DeploymentStatus::Pending,
            events: Vec::new(),
            sandbox_id: None,
            sandbox_url: None,
            error: None,
        }
    }

    /// Duration from start to end, if the deployment finished.
    pub fn duration(&self) -> Option<TimeDelta> {
        self.end_time.map(|end| end - self.start_time)
    }

    fn append(
        &mut self,
        stage: DeploymentStage,
        message: String,
        details: Option<serde_json::Value>,
        error: Option<String>,
    ) -> DeploymentEvent {
        // Keep timestamps strictly increasing within a log
        let now = Utc::now();
        let timestamp = match self.events.last() {
            Some(last) if now <= last.timestamp => last.timestamp + TimeDelta::microseconds(1),
            _ => now,
        };

        let event = DeploymentEvent {
            id: Uuid::new_v4(),
            timestamp,
            stage,
            message,
            details,
            error,
        };

        let next = stage.status();
        if self.status.is_terminal() && !next.is_terminal() {
            tracing::debug!(
                deployment_id = %self.id,
                status = %self.status,
                stage = %stage,
                "Event recorded without changing terminal status"
            );
        } else {
            self.status = next;
            match stage {
                DeploymentStage::Ready => {
                    self.end_time = Some(timestamp);
                }
                DeploymentStage::Error => {
                    self.end_time = Some(timestamp);
                    self.error = Some(
                        event
                            .error
                            .clone()
                            .unwrap_or_else(|| event.message.clone()),
                    );
                }
                _ => {}
            }
        }

        self.events.push(event.clone());
        event
    }
}

/// Aggregate counts across retained logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerStats {
    /// Number of retained logs
    pub total: usize,
    /// Logs in `pending`
    pub pending: usize,
    /// Logs in `deploying`
    pub deploying: usize,
    /// Logs in `verifying`
    pub verifying: usize,
    /// Logs in `ready`
    pub ready: usize,
    /// Logs in `failed`
    pub failed: usize,
    /// Mean start-to-end duration of ready deployments, in milliseconds
    pub avg_ready_duration_ms: Option<f64>,
}

/// Callback invoked with each appended event and the resulting status.
pub type Listener = Arc<dyn Fn(&DeploymentEvent, DeploymentStatus) + Send + Sync>;

type ListenerTable = DashMap<String, Vec<(u64, Listener)>>;

/// Handle returned by [`DeploymentTracker::subscribe`].
///
/// Dropping it keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    deployment_id: String,
    token: u64,
    listeners: Arc<ListenerTable>,
}

impl Subscription {
    /// Token identifying this listener.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Remove exactly the listener this subscription was created for.
    pub fn unsubscribe(self) {
        let now_empty = match self.listeners.get_mut(&self.deployment_id) {
            Some(mut entry) => {
                entry.retain(|(token, _)| *token != self.token);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.listeners
                .remove_if(&self.deployment_id, |_, entry| entry.is_empty());
        }
        tracing::trace!(deployment_id = %self.deployment_id, token = self.token, "Listener removed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("deployment_id", &self.deployment_id)
            .field("token", &self.token)
            .finish()
    }
}

/// In-memory deployment event logs with publish/subscribe.
///
/// Logs live for the lifetime of the process; [`cleanup`](Self::cleanup)
/// must be called periodically to evict old ones.
pub struct DeploymentTracker {
    logs: DashMap<String, DeploymentLog>,
    listeners: Arc<ListenerTable>,
    next_token: AtomicU64,
}

impl Default for DeploymentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Start a fresh log for `id`, replacing any previous one.
    pub fn start(&self, id: &str) {
        let mut log = DeploymentLog::new(id);
        log.append(
            DeploymentStage::Generation,
            "Deployment started".to_string(),
            None,
            None,
        );
        if self.logs.insert(id.to_string(), log).is_some() {
            tracing::debug!(deployment_id = %id, "Replaced existing deployment log");
        }
        tracing::info!(deployment_id = %id, "Deployment tracking started");
    }

    /// Append an event to the log for `id` and notify its listeners.
    ///
    /// Unknown ids are ignored with a warning.
    pub fn log_event(
        &self,
        id: &str,
        stage: DeploymentStage,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let message = message.into();
        tracing::info!(
            deployment_id = %id,
            stage = %stage,
            error = error.as_deref().unwrap_or(""),
            "{message}"
        );

        let (event, status) = {
            let Some(mut log) = self.logs.get_mut(id) else {
                tracing::warn!(deployment_id = %id, stage = %stage, "No deployment log for event");
                return;
            };
            let event = log.append(stage, message, details, error);
            (event, log.status)
        };

        self.notify(id, &event, status);
    }

    /// Record which sandbox serves `id`.
    pub fn set_sandbox_info(&self, id: &str, sandbox_id: &str, url: &str) {
        if let Some(mut log) = self.logs.get_mut(id) {
            log.sandbox_id = Some(sandbox_id.to_string());
            log.sandbox_url = Some(url.to_string());
        }
        self.log_event(
            id,
            DeploymentStage::SandboxCreation,
            "Sandbox created",
            Some(serde_json::json!({ "sandbox_id": sandbox_id, "url": url })),
            None,
        );
    }

    /// Mark `id` ready.
    pub fn mark_ready(&self, id: &str) {
        self.log_event(id, DeploymentStage::Ready, "Deployment ready", None, None);
    }

    /// Mark `id` failed with `error`.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>, details: Option<serde_json::Value>) {
        let error = error.into();
        self.log_event(
            id,
            DeploymentStage::Error,
            "Deployment failed",
            details,
            Some(error),
        );
    }

    /// Get a snapshot of the log for `id`.
    pub fn get_log(&self, id: &str) -> Option<DeploymentLog> {
        self.logs.get(id).map(|log| log.value().clone())
    }

    /// Register `callback` for events appended to `id`.
    pub fn subscribe<F>(&self, id: &str, callback: F) -> Subscription
    where
        F: Fn(&DeploymentEvent, DeploymentStatus) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(id.to_string())
            .or_default()
            .push((token, Arc::new(callback)));
        tracing::trace!(deployment_id = %id, token, "Listener added");

        Subscription {
            deployment_id: id.to_string(),
            token,
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Number of listeners registered for `id`.
    pub fn listener_count(&self, id: &str) -> usize {
        self.listeners.get(id).map_or(0, |entry| entry.len())
    }

    /// Counts per status plus mean duration of ready deployments.
    pub fn stats(&self) -> TrackerStats {
        let mut stats = TrackerStats::default();
        let mut ready_total_ms = 0f64;

        for log in self.logs.iter() {
            stats.total += 1;
            match log.status {
                DeploymentStatus::Pending => stats.pending += 1,
                DeploymentStatus::Deploying => stats.deploying += 1,
                DeploymentStatus::Verifying => stats.verifying += 1,
                DeploymentStatus::Ready => {
                    stats.ready += 1;
                    if let Some(duration) = log.duration() {
                        ready_total_ms += duration.num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0;
                    }
                }
                DeploymentStatus::Failed => stats.failed += 1,
            }
        }

        if stats.ready > 0 {
            stats.avg_ready_duration_ms = Some(ready_total_ms / stats.ready as f64);
        }
        stats
    }

    /// Evict logs (and their listeners) started more than `ttl` ago.
    ///
    /// Returns the number of logs evicted.
    pub fn cleanup(&self, ttl: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        // Snapshot first; a concurrent `start` may replace an entry meanwhile
        let expired: Vec<String> = self
            .logs
            .iter()
            .filter(|log| log.start_time < cutoff)
            .map(|log| log.key().clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if self
                .logs
                .remove_if(&id, |_, log| log.start_time < cutoff)
                .is_some()
            {
                self.listeners.remove(&id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, ttl_secs = ttl.as_secs(), "Evicted old deployment logs");
        }
        evicted
    }

    fn notify(&self, id: &str, event: &DeploymentEvent, status: DeploymentStatus) {
        // Clone out so callbacks never run under the table lock
        let callbacks: Vec<(u64, Listener)> = match self.listeners.get(id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        for (token, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event, status))).is_err() {
                tracing::error!(deployment_id = %id, token, "Deployment listener panicked");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, by: TimeDelta) {
        if let Some(mut log) = self.logs.get_mut(id) {
            log.start_time -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_status_derivation() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        assert_eq!(tracker.get_log("v1").unwrap().status, DeploymentStatus::Pending);

        tracker.log_event("v1", DeploymentStage::Deployment, "deploying", None, None);
        assert_eq!(tracker.get_log("v1").unwrap().status, DeploymentStatus::Deploying);

        tracker.mark_ready("v1");
        let log = tracker.get_log("v1").unwrap();
        assert_eq!(log.status, DeploymentStatus::Ready);
        assert!(log.end_time.is_some());
        assert_eq!(log.events.len(), 3);
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(DeploymentStage::Generation.status(), DeploymentStatus::Pending);
        assert_eq!(DeploymentStage::SandboxCreation.status(), DeploymentStatus::Deploying);
        assert_eq!(DeploymentStage::Deployment.status(), DeploymentStatus::Deploying);
        assert_eq!(DeploymentStage::Verification.status(), DeploymentStatus::Verifying);
        assert_eq!(DeploymentStage::Ready.status(), DeploymentStatus::Ready);
        assert_eq!(DeploymentStage::Error.status(), DeploymentStatus::Failed);
    }

    #[test]
    fn test_mark_failed_records_error() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        tracker.mark_failed("v1", "boom", Some(serde_json::json!({"step": "run"})));

        let log = tracker.get_log("v1").unwrap();
        assert_eq!(log.status, DeploymentStatus::Failed);
        assert_eq!(log.error.as_deref(), Some("boom"));
        assert!(log.end_time.is_some());
        assert_eq!(log.events.last().unwrap().details, Some(serde_json::json!({"step": "run"})));
    }

    #[test]
    fn test_terminal_status_does_not_regress() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        tracker.mark_ready("v1");
        tracker.log_event("v1", DeploymentStage::Deployment, "stray", None, None);

        let log = tracker.get_log("v1").unwrap();
        assert_eq!(log.status, DeploymentStatus::Ready);
        assert_eq!(log.events.len(), 3);

        // A later failure is still recorded
        tracker.mark_failed("v1", "generation failed", None);
        assert_eq!(tracker.get_log("v1").unwrap().status, DeploymentStatus::Failed);
    }

    #[test]
    fn test_events_are_isolated_and_ordered() {
        let tracker = DeploymentTracker::new();
        tracker.start("a");
        tracker.start("b");
        for i in 0..10 {
            tracker.log_event("a", DeploymentStage::Deployment, format!("a-{i}"), None, None);
            tracker.log_event("b", DeploymentStage::Deployment, format!("b-{i}"), None, None);
        }

        let a = tracker.get_log("a").unwrap();
        let b = tracker.get_log("b").unwrap();
        assert_eq!(a.events.len(), 11);
        assert!(a.events.iter().skip(1).all(|e| e.message.starts_with("a-")));
        assert!(b.events.iter().skip(1).all(|e| e.message.starts_with("b-")));
        assert!(a.events.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let tracker = DeploymentTracker::new();
        tracker.log_event("ghost", DeploymentStage::Deployment, "hello", None, None);
        tracker.mark_ready("ghost");
        assert!(tracker.get_log("ghost").is_none());
        assert_eq!(tracker.stats().total, 0);
    }

    #[test]
    fn test_start_replaces_existing_log() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        tracker.mark_failed("v1", "first try", None);
        tracker.start("v1");

        let log = tracker.get_log("v1").unwrap();
        assert_eq!(log.status, DeploymentStatus::Pending);
        assert_eq!(log.events.len(), 1);
        assert!(log.error.is_none());
    }

    #[test]
    fn test_set_sandbox_info() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        tracker.set_sandbox_info("v1", "sb-1", "http://example.test");

        let log = tracker.get_log("v1").unwrap();
        assert_eq!(log.sandbox_id.as_deref(), Some("sb-1"));
        assert_eq!(log.sandbox_url.as_deref(), Some("http://example.test"));
        assert_eq!(log.status, DeploymentStatus::Deploying);
        assert_eq!(log.events.last().unwrap().stage, DeploymentStage::SandboxCreation);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = tracker.subscribe("v1", move |event, status| {
            seen_clone.lock().unwrap().push((event.stage, status));
        });

        tracker.log_event("v1", DeploymentStage::Verification, "probing", None, None);
        tracker.mark_ready("v1");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (DeploymentStage::Verification, DeploymentStatus::Verifying),
                (DeploymentStage::Ready, DeploymentStatus::Ready),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_removes_only_its_listener() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");

        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&first);
        let s = Arc::clone(&second);
        let sub_first = tracker.subscribe("v1", move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_second = tracker.subscribe("v1", move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(tracker.listener_count("v1"), 2);

        sub_first.unsubscribe();
        assert_eq!(tracker.listener_count("v1"), 1);

        tracker.mark_ready("v1");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");

        let delivered = Arc::new(AtomicU64::new(0));
        let d = Arc::clone(&delivered);
        let _bad = tracker.subscribe("v1", |_, _| panic!("listener failure"));
        let _good = tracker.subscribe("v1", move |_, _| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        tracker.mark_ready("v1");
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.get_log("v1").unwrap().status, DeploymentStatus::Ready);
    }

    #[test]
    fn test_stats() {
        let tracker = DeploymentTracker::new();
        tracker.start("ok-1");
        tracker.mark_ready("ok-1");
        tracker.start("ok-2");
        tracker.mark_ready("ok-2");
        tracker.start("bad");
        tracker.mark_failed("bad", "nope", None);
        tracker.start("busy");
        tracker.log_event("busy", DeploymentStage::Verification, "probing", None, None);
        tracker.start("new");

        let stats = tracker.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.verifying, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.deploying, 0);
        assert!(stats.avg_ready_duration_ms.unwrap() >= 0.0);
    }

    #[test]
    fn test_stats_without_ready_has_no_average() {
        let tracker = DeploymentTracker::new();
        tracker.start("v1");
        assert!(tracker.stats().avg_ready_duration_ms.is_none());
    }

    #[test]
    fn test_cleanup_evicts_old_logs_and_listeners() {
        let tracker = DeploymentTracker::new();
        tracker.start("old");
        tracker.start("fresh");
        let _sub = tracker.subscribe("old", |_, _| {});
        tracker.backdate("old", TimeDelta::minutes(90));

        let evicted = tracker.cleanup(Duration::from_secs(3600));
        assert_eq!(evicted, 1);
        assert!(tracker.get_log("old").is_none());
        assert!(tracker.get_log("fresh").is_some());
        assert_eq!(tracker.listener_count("old"), 0);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(DeploymentStatus::Verifying).unwrap(),
            serde_json::json!("verifying")
        );
        assert_eq!(
            serde_json::to_value(DeploymentStage::SandboxCreation).unwrap(),
            serde_json::json!("sandbox_creation")
        );
    }
}
