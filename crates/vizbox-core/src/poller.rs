//! Waits for a sandbox to finish generating, then collects its artifact.
//!
//! The poller reads the sandbox's own `/status` endpoint rather than the
//! reachability prober: a sandbox can be reachable long before the
//! generated chart exists.

use crate::config::PollConfig;
use crate::error::{CoreError, Result};
use crate::orchestrator::{SandboxOrchestrator, TeardownGuard};
use crate::sandbox::SandboxId;
use crate::tracker::DeploymentStage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Internal status endpoint served by every sandbox.
pub const STATUS_PATH: &str = "/status";

/// Path serving the generated artifact.
pub const ARTIFACT_PATH: &str = "/";

/// Phase reported once generation has failed.
pub const PHASE_ERROR: &str = "error";

/// Status document served at [`STATUS_PATH`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStatus {
    /// Current generator phase
    pub phase: String,
    /// Milliseconds since generation started
    #[serde(default, alias = "elapsedMs")]
    pub elapsed: u64,
    /// True once the artifact can be fetched
    #[serde(default)]
    pub ready: bool,
    /// Failure message when `phase` is `error`
    #[serde(default)]
    pub error: Option<String>,
}

/// A generated artifact and the sandbox that produced it.
///
/// The sandbox has already been destroyed when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedVisualization {
    /// Sandbox ID
    pub id: SandboxId,
    /// Generated HTML document
    pub artifact: String,
}

/// Drives a sandbox from provisioning to a fetched artifact.
#[derive(Clone)]
pub struct GenerationPoller {
    orchestrator: Arc<SandboxOrchestrator>,
    config: PollConfig,
}

impl GenerationPoller {
    /// Create a poller over `orchestrator`.
    pub fn new(orchestrator: Arc<SandboxOrchestrator>, config: PollConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Get the polling configuration.
    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Provision a sandbox for `payload`, wait for generation and return the
    /// artifact.
    ///
    /// The sandbox is destroyed once the artifact is fetched, when the budget
    /// runs out, or when this future is dropped early. A sandbox that reports
    /// a generation failure is left for the reaper.
    ///
    /// # Errors
    ///
    /// - Any error from [`SandboxOrchestrator::create_visualization`].
    /// - [`CoreError::Generation`] with the sandbox's own message when it
    ///   reports `phase == "error"`.
    /// - [`CoreError::GenerationTimeout`] when the budget elapses first.
    pub async fn create_and_fetch_visualization(
        &self,
        payload: &serde_json::Value,
        secret: &str,
        tracking_id: Option<&str>,
    ) -> Result<GeneratedVisualization> {
        let (deployment, guard) = self
            .orchestrator
            .deploy(payload, secret, tracking_id)
            .await?;
        let id = deployment.id;
        let start = Instant::now();
        let mut last_phase: Option<String> = None;

        tracing::info!(
            sandbox_id = %id,
            budget_ms = self.config.budget.as_millis() as u64,
            "Waiting for generation"
        );

        // The budget bounds the whole wait, in-flight status requests included
        let outcome = tokio::time::timeout(
            self.config.budget,
            self.wait_for_outcome(id, tracking_id, &mut last_phase),
        )
        .await;

        match outcome {
            Ok(Ok(Outcome::Ready)) => self.collect(id, guard, tracking_id, start).await,
            Ok(Ok(Outcome::Failed(message))) => {
                guard.disarm();
                tracing::warn!(sandbox_id = %id, error = %message, "Sandbox reported generation failure");
                let err = CoreError::Generation(message);
                self.fail(tracking_id, &err);
                Err(err)
            }
            Ok(Err(e)) => {
                // Destroyed out from under us
                guard.disarm();
                self.fail(tracking_id, &e);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %id,
                    budget_ms = self.config.budget.as_millis() as u64,
                    phase = last_phase.as_deref().unwrap_or("unknown"),
                    "Generation timed out"
                );
                self.orchestrator.destroy_sandbox(id).await;
                guard.disarm();

                let err = CoreError::GenerationTimeout(self.config.budget);
                self.fail(tracking_id, &err);
                Err(err)
            }
        }
    }

    /// Poll until the sandbox reports ready or failed.
    async fn wait_for_outcome(
        &self,
        id: SandboxId,
        tracking_id: Option<&str>,
        last_phase: &mut Option<String>,
    ) -> Result<Outcome> {
        loop {
            if let Some(status) = self.poll_status(id).await? {
                if last_phase.as_deref() != Some(status.phase.as_str()) {
                    tracing::debug!(sandbox_id = %id, phase = %status.phase, elapsed_ms = status.elapsed, "Generation phase changed");
                    self.track(
                        tracking_id,
                        format!("Generation phase: {}", status.phase),
                        serde_json::json!({ "phase": status.phase, "elapsed_ms": status.elapsed }),
                    );
                    *last_phase = Some(status.phase.clone());
                }

                if status.ready {
                    return Ok(Outcome::Ready);
                }
                if status.phase == PHASE_ERROR {
                    return Ok(Outcome::Failed(
                        status
                            .error
                            .unwrap_or_else(|| "generation failed".to_string()),
                    ));
                }
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Read the status document once.
    ///
    /// Transport failures, non-2xx answers and unparseable bodies all mean
    /// "not ready yet". Only a missing sandbox is an error.
    async fn poll_status(&self, id: SandboxId) -> Result<Option<GenerationStatus>> {
        let response = match self
            .bounded("status request", self.orchestrator.fetch_from_sandbox(id, STATUS_PATH))
            .await
        {
            Ok(response) => response,
            Err(e @ CoreError::NotFound(_)) => return Err(e),
            Err(e) => {
                tracing::trace!(sandbox_id = %id, error = %e, "Status not available yet");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            tracing::trace!(sandbox_id = %id, status = %response.status(), "Status not available yet");
            return Ok(None);
        }

        let body = async { response.json::<GenerationStatus>().await.map_err(CoreError::from) };
        match self.bounded("status body", body).await {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                tracing::trace!(sandbox_id = %id, error = %e, "Unreadable status document");
                Ok(None)
            }
        }
    }

    /// Fetch the artifact from a ready sandbox, then destroy it.
    async fn collect(
        &self,
        id: SandboxId,
        guard: TeardownGuard<'_>,
        tracking_id: Option<&str>,
        start: Instant,
    ) -> Result<GeneratedVisualization> {
        let fetched = self
            .bounded("artifact request", async {
                let response = self.orchestrator.fetch_from_sandbox(id, ARTIFACT_PATH).await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(CoreError::Generation(format!(
                        "artifact request returned HTTP {status}"
                    )));
                }
                Ok::<_, CoreError>(response.text().await?)
            })
            .await;

        self.orchestrator.destroy_sandbox(id).await;
        guard.disarm();

        let artifact = match fetched {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::error!(sandbox_id = %id, error = %e, "Failed to fetch artifact");
                self.fail(tracking_id, &e);
                return Err(e);
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(sandbox_id = %id, bytes = artifact.len(), elapsed_ms, "Artifact fetched");
        if let Some(tracking_id) = tracking_id {
            self.orchestrator.tracker().log_event(
                tracking_id,
                DeploymentStage::Ready,
                "Visualization generated",
                Some(serde_json::json!({
                    "sandbox_id": id.to_string(),
                    "artifact_bytes": artifact.len(),
                    "elapsed_ms": elapsed_ms,
                })),
                None,
            );
        }

        Ok(GeneratedVisualization { id, artifact })
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .unwrap_or(Err(CoreError::Timeout {
                operation,
                after: self.config.request_timeout,
            }))
    }

    fn track(&self, tracking_id: Option<&str>, message: String, details: serde_json::Value) {
        if let Some(id) = tracking_id {
            self.orchestrator.tracker().log_event(
                id,
                DeploymentStage::Generation,
                message,
                Some(details),
                None,
            );
        }
    }

    fn fail(&self, tracking_id: Option<&str>, error: &CoreError) {
        if let Some(id) = tracking_id {
            self.orchestrator
                .tracker()
                .mark_failed(id, error.to_string(), None);
        }
    }
}

enum Outcome {
    Ready,
    Failed(String),
}
