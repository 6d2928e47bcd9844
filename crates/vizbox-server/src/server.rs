//! VizboxServer - shared state behind the HTTP routes.

use crate::config::VizboxConfig;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use vizbox_core::{
    CoreError, DeploymentTracker, GenerationPoller, PollConfig, ResourceReaper,
    SandboxOrchestrator,
};
use vizbox_runtime::SandboxProvider;

/// Daemon state: the orchestrator, its poller and the reaper.
///
/// Cheap to clone; every clone shares the same sandboxes.
#[derive(Clone)]
pub struct VizboxServer {
    /// Owns every live sandbox
    orchestrator: Arc<SandboxOrchestrator>,

    /// Drives `wait` requests to completion
    poller: GenerationPoller,

    /// Periodic cleanup of sandboxes and logs
    reaper: Arc<TokioMutex<ResourceReaper>>,

    /// Secret injected into every sandbox
    api_key: Option<Arc<str>>,
}

impl VizboxServer {
    /// Create a new server provisioning through `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the orchestrator configuration is invalid.
    pub fn new(config: &VizboxConfig, provider: Arc<dyn SandboxProvider>) -> Result<Self, CoreError> {
        let tracker = Arc::new(DeploymentTracker::new());
        let orchestrator = Arc::new(SandboxOrchestrator::new(
            provider,
            tracker,
            config.orchestrator_config(),
        )?);
        let poller = GenerationPoller::new(Arc::clone(&orchestrator), config.poll_config());
        let reaper = ResourceReaper::new(Arc::clone(&orchestrator), config.reaper_config());

        tracing::info!(
            configured = orchestrator.is_configured(),
            has_api_key = config.api_key.is_some(),
            "Vizbox server created"
        );

        Ok(Self {
            orchestrator,
            poller,
            reaper: Arc::new(TokioMutex::new(reaper)),
            api_key: config.api_key.as_deref().map(Arc::from),
        })
    }

    /// Replace the polling settings used for `wait` requests.
    pub fn with_poll_config(mut self, config: PollConfig) -> Self {
        self.poller = GenerationPoller::new(Arc::clone(&self.orchestrator), config);
        self
    }

    /// Start the reaper loop.
    pub async fn start_reaper(&self) {
        self.reaper.lock().await.start();
        tracing::info!("Reaper started");
    }

    /// Stop the reaper loop and wait for it to exit.
    pub async fn shutdown_reaper(&self) {
        self.reaper.lock().await.shutdown().await;
    }

    pub fn orchestrator(&self) -> &Arc<SandboxOrchestrator> {
        &self.orchestrator
    }

    pub fn tracker(&self) -> &Arc<DeploymentTracker> {
        self.orchestrator.tracker()
    }

    pub fn poller(&self) -> &GenerationPoller {
        &self.poller
    }

    /// Secret for new sandboxes; empty when unset so the orchestrator
    /// rejects the request with a configuration error.
    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or("")
    }
}
