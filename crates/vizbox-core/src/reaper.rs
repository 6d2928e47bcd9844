//! Periodic cleanup of expired sandboxes and deployment logs.
//!
//! # Example
//!
//! ```ignore
//! let mut reaper = ResourceReaper::new(orchestrator, ReaperConfig::default());
//! reaper.start();
//! // ... serve requests ...
//! reaper.shutdown().await;
//! ```

use crate::config::ReaperConfig;
use crate::orchestrator::SandboxOrchestrator;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapStats {
    /// Sandboxes destroyed
    pub sandboxes: usize,
    /// Deployment logs evicted
    pub logs: usize,
}

/// Background task destroying resources past their TTL.
pub struct ResourceReaper {
    orchestrator: Arc<SandboxOrchestrator>,
    config: ReaperConfig,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceReaper {
    /// Create a reaper for `orchestrator` and its tracker. Call
    /// [`start`](Self::start) to begin sweeping.
    pub fn new(orchestrator: Arc<SandboxOrchestrator>, config: ReaperConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Get the reaper configuration.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Spawn the sweep loop.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            tracing::warn!("Reaper already started");
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let config = self.config.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);

        self.handle = Some(tokio::spawn(async move {
            Self::sweep_loop(orchestrator, config, shutdown, shutdown_notify).await;
        }));
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            sandbox_ttl_secs = self.config.sandbox_ttl.as_secs(),
            log_ttl_secs = self.config.log_ttl.as_secs(),
            "Reaper started"
        );
    }

    async fn sweep_loop(
        orchestrator: Arc<SandboxOrchestrator>,
        config: ReaperConfig,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::info!("Reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(config.interval) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    Self::sweep_once(&orchestrator, &config).await;
                }
            }
        }
        tracing::debug!("Reaper loop exited");
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> ReapStats {
        Self::sweep_once(&self.orchestrator, &self.config).await
    }

    async fn sweep_once(orchestrator: &SandboxOrchestrator, config: &ReaperConfig) -> ReapStats {
        let start = Instant::now();
        let stats = ReapStats {
            sandboxes: orchestrator.cleanup_old_sandboxes(config.sandbox_ttl).await,
            logs: orchestrator.tracker().cleanup(config.log_ttl),
        };

        if stats.sandboxes > 0 || stats.logs > 0 {
            tracing::info!(
                sandboxes = stats.sandboxes,
                logs = stats.logs,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Reaper sweep complete"
            );
        } else {
            tracing::trace!("Reaper sweep found nothing to remove");
        }
        stats
    }

    /// Check if the sweep loop is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Stop the sweep loop and wait for it to exit.
    ///
    /// Live sandboxes are left alone; use
    /// [`SandboxOrchestrator::destroy_all`] for that.
    pub async fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Reaper task panicked");
            }
            tracing::info!("Reaper stopped");
        }
    }
}

impl Drop for ResourceReaper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::tracker::DeploymentTracker;
    use chrono::{TimeDelta, Utc};
    use std::time::Duration;
    use vizbox_runtime::testing::StaticProvider;
    use vizbox_runtime::{SandboxEnv, SandboxProvider};

    fn orchestrator(provider: &StaticProvider) -> Arc<SandboxOrchestrator> {
        let config = OrchestratorConfig::builder()
            .provider_token("test-token")
            .build()
            .unwrap();
        Arc::new(
            SandboxOrchestrator::new(
                Arc::new(provider.clone()),
                Arc::new(DeploymentTracker::new()),
                config,
            )
            .unwrap(),
        )
    }

    async fn register(orchestrator: &SandboxOrchestrator, provider: &StaticProvider, age: TimeDelta) {
        let handle = provider.create(SandboxEnv::new()).await.unwrap();
        let process = handle.run("/app/generator.json").await.unwrap();
        orchestrator.insert_for_test(handle, process, Utc::now() - age);
    }

    fn hour_ttl(interval: Duration) -> ReaperConfig {
        ReaperConfig {
            interval,
            sandbox_ttl: Duration::from_secs(3600),
            log_ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_sandboxes_and_logs() {
        let provider = StaticProvider::new("http://127.0.0.1:9");
        let orchestrator = orchestrator(&provider);
        register(&orchestrator, &provider, TimeDelta::minutes(10)).await;
        register(&orchestrator, &provider, TimeDelta::minutes(61)).await;

        let tracker = orchestrator.tracker();
        tracker.start("fresh");
        tracker.start("stale");
        tracker.backdate("stale", TimeDelta::hours(2));

        let reaper = ResourceReaper::new(Arc::clone(&orchestrator), hour_ttl(Duration::from_secs(300)));
        let stats = reaper.sweep().await;

        assert_eq!(stats, ReapStats { sandboxes: 1, logs: 1 });
        assert_eq!(orchestrator.stats().active, 1);
        assert!(tracker.get_log("fresh").is_some());
        assert!(tracker.get_log("stale").is_none());

        assert_eq!(reaper.sweep().await, ReapStats::default());
    }

    #[tokio::test]
    async fn test_background_loop_sweeps_and_stops() {
        let provider = StaticProvider::new("http://127.0.0.1:9");
        let orchestrator = orchestrator(&provider);
        register(&orchestrator, &provider, TimeDelta::hours(3)).await;

        let mut reaper = ResourceReaper::new(Arc::clone(&orchestrator), hour_ttl(Duration::from_millis(20)));
        reaper.start();
        assert!(reaper.is_running());

        for _ in 0..100 {
            if orchestrator.stats().active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(orchestrator.stats().active, 0);
        assert_eq!(provider.live_handles(), 0);

        reaper.shutdown().await;
        assert!(!reaper.is_running());

        // Nothing sweeps after shutdown
        register(&orchestrator, &provider, TimeDelta::hours(3)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.stats().active, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_tick() {
        let provider = StaticProvider::new("http://127.0.0.1:9");
        let mut reaper = ResourceReaper::new(orchestrator(&provider), ReaperConfig::default());
        reaper.start();
        tokio::time::timeout(Duration::from_secs(1), reaper.shutdown())
            .await
            .expect("shutdown should not wait for the interval");
    }
}
