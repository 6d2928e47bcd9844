//! Sandbox identity and registry entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use vizbox_runtime::{SandboxHandle, SandboxProcess};

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One unit of the orchestrator's sandbox capacity, returned on drop.
#[derive(Debug)]
pub(crate) struct Slot(Arc<AtomicUsize>);

impl Slot {
    /// Take a slot if fewer than `max` are held (`0` = unlimited).
    pub(crate) fn try_acquire(held: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        held.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (max == 0 || n < max).then_some(n + 1)
        })
        .ok()
        .map(|_| Self(Arc::clone(held)))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live, exposed sandbox owned by the orchestrator registry.
pub(crate) struct SandboxInstance {
    pub(crate) id: SandboxId,
    pub(crate) handle: Arc<dyn SandboxHandle>,
    pub(crate) process: Arc<dyn SandboxProcess>,
    pub(crate) url: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) slot: Slot,
}

impl SandboxInstance {
    pub(crate) fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id,
            url: self.url.clone(),
            pid: self.process.pid().0,
            created_at: self.created_at,
        }
    }

    /// Kill the process, dispose the handle, then return the capacity slot.
    ///
    /// Failures are logged and swallowed so teardown never masks the error
    /// that triggered it.
    pub(crate) async fn teardown(self) {
        let start = std::time::Instant::now();
        tracing::info!(sandbox_id = %self.id, "Destroying sandbox");

        if let Err(e) = self.process.kill().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to kill sandbox process");
        }
        if let Err(e) = self.handle.dispose().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to dispose sandbox");
        }

        tracing::info!(
            sandbox_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox destroyed"
        );
        drop(self.slot);
    }
}

/// Snapshot of a registered sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    /// Sandbox ID
    pub id: SandboxId,
    /// Public URL
    pub url: String,
    /// Process id of the generator
    pub pid: u32,
    /// Registration time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_id_display() {
        let id = SandboxId::new();
        let s = format!("{}", id);
        assert_eq!(s.len(), 36);
        assert!(s.contains('-'));
    }

    #[test]
    fn test_sandbox_id_parse_round_trip() {
        let id = SandboxId::new();
        let parsed: SandboxId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SandboxId>().is_err());
    }

    #[test]
    fn test_sandbox_id_serializes_as_string() {
        let uuid = Uuid::new_v4();
        let id: SandboxId = uuid.into();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(uuid.to_string()));
    }

    #[test]
    fn test_slots_respect_limit_and_return_on_drop() {
        let held = Arc::new(AtomicUsize::new(0));
        let first = Slot::try_acquire(&held, 2).unwrap();
        let _second = Slot::try_acquire(&held, 2).unwrap();
        assert!(Slot::try_acquire(&held, 2).is_none());
        assert_eq!(held.load(Ordering::SeqCst), 2);

        drop(first);
        assert!(Slot::try_acquire(&held, 2).is_some());
        assert_eq!(held.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unlimited_slots() {
        let held = Arc::new(AtomicUsize::new(0));
        let slots: Vec<_> = (0..10).filter_map(|_| Slot::try_acquire(&held, 0)).collect();
        assert_eq!(slots.len(), 10);
    }
}
