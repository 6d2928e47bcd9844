//! Sandbox orchestrator: provisions, deploys into, exposes and destroys
//! sandboxes, and owns the registry of live ones.

use crate::config::OrchestratorConfig;
use crate::error::{CoreError, Result};
use crate::program::{GeneratorProgram, ENTRYPOINT};
use crate::prober::VerificationProber;
use crate::sandbox::{SandboxId, SandboxInfo, SandboxInstance, Slot};
use crate::tracker::{DeploymentStage, DeploymentTracker};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vizbox_runtime::{SandboxEnv, SandboxHandle, SandboxProcess, SandboxProvider};

/// Environment variable carrying the AI key inside the sandbox.
pub const SECRET_ENV: &str = "ANTHROPIC_API_KEY";

/// Environment variable carrying the sandbox id inside the sandbox.
pub const SANDBOX_ID_ENV: &str = "VIZBOX_SANDBOX_ID";

/// Environment variable overriding the AI endpoint inside the sandbox.
pub const AI_BASE_URL_ENV: &str = "VIZBOX_AI_BASE_URL";

/// A deployed, publicly reachable sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    /// Sandbox ID
    pub id: SandboxId,
    /// Public URL
    pub url: String,
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Number of live sandboxes
    pub active: usize,
    /// Creation time of the oldest live sandbox
    pub oldest: Option<DateTime<Utc>>,
}

/// Owns every live sandbox.
///
/// The registry is a concurrent map; each operation only touches the key it
/// owns, and full-table sweeps snapshot keys before removing anything.
pub struct SandboxOrchestrator {
    provider: Arc<dyn SandboxProvider>,
    tracker: Arc<DeploymentTracker>,
    prober: VerificationProber,
    program: GeneratorProgram,
    http: reqwest::Client,
    sandboxes: DashMap<SandboxId, SandboxInstance>,
    /// Slots held by registered and in-flight sandboxes
    slots: Arc<AtomicUsize>,
    config: OrchestratorConfig,
}

impl SandboxOrchestrator {
    /// Create a new orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        tracker: Arc<DeploymentTracker>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        let prober = VerificationProber::new(http.clone(), Arc::clone(&tracker), config.probe.clone());

        tracing::info!(
            configured = config.has_provider_token(),
            max_sandboxes = config.max_sandboxes,
            "Creating sandbox orchestrator"
        );

        Ok(Self {
            provider,
            tracker,
            prober,
            program: GeneratorProgram::from_config(&config),
            http,
            sandboxes: DashMap::new(),
            slots: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// Get the orchestrator configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get the tracker events are reported to.
    pub fn tracker(&self) -> &Arc<DeploymentTracker> {
        &self.tracker
    }

    /// True if a provisioning credential is present.
    pub fn is_configured(&self) -> bool {
        self.config.has_provider_token()
    }

    /// Provision a sandbox running the generator for `payload` and expose it.
    ///
    /// `secret` is injected into the sandbox environment. When
    /// `tracking_id` is given, progress is reported to the tracker under it.
    ///
    /// Reachability verification runs before the deployment is marked ready,
    /// but a failed verification does not fail the call.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Configuration`] if the credential or secret is missing,
    ///   before anything is allocated.
    /// - [`CoreError::Provisioning`] if the sandbox cap is reached, or if any
    ///   provisioning step fails; resources allocated by earlier steps are
    ///   released first.
    ///
    /// Dropping the returned future part way releases whatever it allocated.
    pub async fn create_visualization(
        &self,
        payload: &serde_json::Value,
        secret: &str,
        tracking_id: Option<&str>,
    ) -> Result<Deployment> {
        let (deployment, guard) = self.deploy(payload, secret, tracking_id).await?;
        guard.disarm();
        Ok(deployment)
    }

    /// [`create_visualization`](Self::create_visualization) that leaves the
    /// new sandbox under a guard; it is destroyed unless the guard is disarmed.
    pub(crate) async fn deploy(
        &self,
        payload: &serde_json::Value,
        secret: &str,
        tracking_id: Option<&str>,
    ) -> Result<(Deployment, TeardownGuard<'_>)> {
        let id = SandboxId::new();
        let start = Instant::now();

        let slot = match self.check_preconditions(id, secret) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(sandbox_id = %id, error = %e, "Refusing to create sandbox");
                self.fail(tracking_id, &e, None);
                return Err(e);
            }
        };

        let program = match self.program.render(payload) {
            Ok(program) => program,
            Err(e) => {
                self.fail(tracking_id, &e, None);
                return Err(e);
            }
        };

        tracing::info!(sandbox_id = %id, tracking_id = tracking_id.unwrap_or(""), "Creating visualization sandbox");

        let instance = match self.provision(id, program, secret, tracking_id, slot).await {
            Ok(instance) => instance,
            Err(e) => {
                let err = CoreError::Provisioning {
                    sandbox_id: id,
                    message: e.to_string(),
                };
                tracing::error!(sandbox_id = %id, error = %e, "Sandbox provisioning failed");
                self.fail(
                    tracking_id,
                    &err,
                    Some(serde_json::json!({ "sandbox_id": id.to_string() })),
                );
                return Err(err);
            }
        };

        let url = instance.url.clone();
        self.sandboxes.insert(id, instance);
        let guard = TeardownGuard {
            orchestrator: self,
            id,
            armed: true,
        };
        tracing::info!(
            sandbox_id = %id,
            url = %url,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox registered"
        );

        if let Some(tracking_id) = tracking_id {
            self.tracker
                .set_sandbox_info(tracking_id, &id.to_string(), &url);
        }

        let verification = self.prober.verify(&url, tracking_id).await;
        if let Some(tracking_id) = tracking_id {
            let verified = match &verification {
                Ok(_) => true,
                Err(e) => {
                    self.tracker.log_event(
                        tracking_id,
                        DeploymentStage::Verification,
                        "Verification failed, continuing",
                        Some(serde_json::json!({ "url": url })),
                        Some(e.to_string()),
                    );
                    false
                }
            };
            self.tracker.log_event(
                tracking_id,
                DeploymentStage::Ready,
                "Deployment ready",
                Some(serde_json::json!({
                    "sandbox_id": id.to_string(),
                    "url": url,
                    "verified": verified,
                    "elapsed_ms": start.elapsed().as_millis() as u64,
                })),
                None,
            );
        }
        if let Err(e) = verification {
            tracing::warn!(sandbox_id = %id, error = %e, "Sandbox not verified, reporting ready anyway");
        }

        Ok((Deployment { id, url }, guard))
    }

    /// Gate checks run before anything is allocated; on success the
    /// returned slot counts against `max_sandboxes`.
    fn check_preconditions(&self, id: SandboxId, secret: &str) -> Result<Slot> {
        if !self.is_configured() {
            return Err(CoreError::Configuration(
                "sandbox provisioning credential is not configured".into(),
            ));
        }
        if secret.trim().is_empty() {
            return Err(CoreError::Configuration("API key is required".into()));
        }
        Slot::try_acquire(&self.slots, self.config.max_sandboxes).ok_or_else(|| {
            CoreError::Provisioning {
                sandbox_id: id,
                message: format!("max sandbox limit reached ({})", self.config.max_sandboxes),
            }
        })
    }

    /// Run the provisioning steps, releasing partial resources on failure.
    async fn provision(
        &self,
        id: SandboxId,
        program: bytes::Bytes,
        secret: &str,
        tracking_id: Option<&str>,
        slot: Slot,
    ) -> Result<SandboxInstance> {
        let mut env = SandboxEnv::new()
            .with(SECRET_ENV, secret)
            .with(SANDBOX_ID_ENV, id.to_string());
        if let Some(url) = &self.config.ai_base_url {
            env.set(AI_BASE_URL_ENV, url.clone());
        }

        self.track(tracking_id, DeploymentStage::SandboxCreation, "Provisioning sandbox", None);
        tracing::debug!(sandbox_id = %id, "Provisioning sandbox");
        let handle: Arc<dyn SandboxHandle> =
            Arc::from(self.step("create sandbox", self.provider.create(env)).await?);
        let mut pending = PendingSandbox {
            id,
            handle: Arc::clone(&handle),
            process: None,
            armed: true,
        };

        self.track(
            tracking_id,
            DeploymentStage::Deployment,
            "Writing generator program",
            Some(serde_json::json!({ "path": ENTRYPOINT, "size": program.len() })),
        );
        tracing::debug!(sandbox_id = %id, path = ENTRYPOINT, size = program.len(), "Writing generator program");
        if let Err(e) = self.step("write program", handle.write_file(ENTRYPOINT, program)).await {
            pending.release().await;
            return Err(e);
        }

        self.track(tracking_id, DeploymentStage::Deployment, "Starting generator process", None);
        tracing::debug!(sandbox_id = %id, "Starting generator process");
        let process: Arc<dyn SandboxProcess> =
            match self.step("start process", handle.run(ENTRYPOINT)).await {
                Ok(process) => Arc::from(process),
                Err(e) => {
                    pending.release().await;
                    return Err(e);
                }
            };
        pending.process = Some(Arc::clone(&process));

        self.track(
            tracking_id,
            DeploymentStage::Deployment,
            "Exposing HTTP endpoint",
            Some(serde_json::json!({ "pid": process.pid().0 })),
        );
        tracing::debug!(sandbox_id = %id, pid = %process.pid(), "Exposing HTTP endpoint");
        let url = match self
            .step("expose endpoint", handle.expose_http(process.as_ref()))
            .await
        {
            Ok(url) => url,
            Err(e) => {
                pending.release().await;
                return Err(e);
            }
        };

        pending.armed = false;
        Ok(SandboxInstance {
            id,
            handle,
            process,
            url,
            created_at: Utc::now(),
            slot,
        })
    }

    /// Await a provider call under the provisioning budget.
    async fn step<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = vizbox_runtime::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.provision_timeout, fut).await {
            Ok(result) => result.map_err(CoreError::from),
            Err(_) => Err(CoreError::Timeout {
                operation,
                after: self.config.provision_timeout,
            }),
        }
    }

    fn track(
        &self,
        tracking_id: Option<&str>,
        stage: DeploymentStage,
        message: &str,
        details: Option<serde_json::Value>,
    ) {
        if let Some(id) = tracking_id {
            self.tracker.log_event(id, stage, message, details, None);
        }
    }

    fn fail(&self, tracking_id: Option<&str>, error: &CoreError, details: Option<serde_json::Value>) {
        if let Some(id) = tracking_id {
            self.tracker.mark_failed(id, error.to_string(), details);
        }
    }

    /// GET `path` from the sandbox registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if `id` is not registered, or the
    /// HTTP error if the request fails or times out.
    pub async fn fetch_from_sandbox(&self, id: SandboxId, path: &str) -> Result<reqwest::Response> {
        let base = self
            .sandboxes
            .get(&id)
            .map(|sandbox| sandbox.url.clone())
            .ok_or(CoreError::NotFound(id))?;

        let url = join_url(&base, path);
        tracing::trace!(sandbox_id = %id, url = %url, "Fetching from sandbox");
        let response = self
            .http
            .get(&url)
            .timeout(self.config.fetch_timeout)
            .send()
            .await?;
        Ok(response)
    }

    /// Destroy the sandbox registered under `id`.
    ///
    /// Unknown ids are a no-op, so calling this twice is harmless.
    pub async fn destroy_sandbox(&self, id: SandboxId) {
        match self.sandboxes.remove(&id) {
            Some((_, instance)) => instance.teardown().await,
            None => tracing::debug!(sandbox_id = %id, "Sandbox already destroyed"),
        }
    }

    /// Unregister `id` now and tear it down in the background.
    fn abandon(&self, id: SandboxId) {
        let Some((_, instance)) = self.sandboxes.remove(&id) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::info!(sandbox_id = %id, "Caller went away, destroying sandbox");
                runtime.spawn(instance.teardown());
            }
            Err(_) => {
                tracing::warn!(sandbox_id = %id, "No runtime to destroy abandoned sandbox");
            }
        }
    }

    /// Destroy every sandbox created more than `ttl` ago.
    ///
    /// Returns the number of sandboxes destroyed.
    pub async fn cleanup_old_sandboxes(&self, ttl: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        // Snapshot keys so concurrent creators never see a locked shard
        let expired: Vec<SandboxId> = self
            .sandboxes
            .iter()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| *entry.key())
            .collect();

        let removed: Vec<SandboxInstance> = expired
            .into_iter()
            .filter_map(|id| {
                self.sandboxes
                    .remove_if(&id, |_, instance| instance.created_at < cutoff)
                    .map(|(_, instance)| instance)
            })
            .collect();

        let count = removed.len();
        if count > 0 {
            tracing::info!(count, ttl_secs = ttl.as_secs(), "Destroying expired sandboxes");
            futures::future::join_all(removed.into_iter().map(SandboxInstance::teardown)).await;
        }
        count
    }

    /// Destroy every registered sandbox.
    ///
    /// Returns the number of sandboxes destroyed.
    pub async fn destroy_all(&self) -> usize {
        let ids: Vec<SandboxId> = self.sandboxes.iter().map(|entry| *entry.key()).collect();
        let removed: Vec<SandboxInstance> = ids
            .into_iter()
            .filter_map(|id| self.sandboxes.remove(&id).map(|(_, instance)| instance))
            .collect();

        let count = removed.len();
        tracing::info!(count, "Destroying all sandboxes");
        futures::future::join_all(removed.into_iter().map(SandboxInstance::teardown)).await;
        count
    }

    /// Registry statistics.
    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active: self.sandboxes.len(),
            oldest: self.sandboxes.iter().map(|entry| entry.created_at).min(),
        }
    }

    /// Snapshot of every registered sandbox.
    pub fn list(&self) -> Vec<SandboxInfo> {
        self.sandboxes.iter().map(|entry| entry.info()).collect()
    }

    /// Check if a sandbox is registered.
    pub fn exists(&self, id: SandboxId) -> bool {
        self.sandboxes.contains_key(&id)
    }

    /// Register a sandbox directly, bypassing provisioning and the cap.
    #[cfg(test)]
    pub(crate) fn insert_for_test(
        &self,
        handle: Box<dyn SandboxHandle>,
        process: Box<dyn SandboxProcess>,
        created_at: DateTime<Utc>,
    ) -> SandboxId {
        let id = SandboxId::new();
        let slot = Slot::try_acquire(&self.slots, 0).unwrap();
        self.sandboxes.insert(
            id,
            SandboxInstance {
                id,
                handle: Arc::from(handle),
                process: Arc::from(process),
                url: "http://127.0.0.1:9".to_string(),
                created_at,
                slot,
            },
        );
        id
    }
}

/// A registered sandbox owned by an in-flight request.
///
/// Dropping it armed unregisters the sandbox and destroys it in the
/// background.
#[must_use]
pub(crate) struct TeardownGuard<'a> {
    orchestrator: &'a SandboxOrchestrator,
    id: SandboxId,
    armed: bool,
}

impl TeardownGuard<'_> {
    /// Hand the sandbox over to the registry for good.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.orchestrator.abandon(self.id);
        }
    }
}

/// Provider resources allocated before registration.
struct PendingSandbox {
    id: SandboxId,
    handle: Arc<dyn SandboxHandle>,
    process: Option<Arc<dyn SandboxProcess>>,
    armed: bool,
}

impl PendingSandbox {
    async fn release(mut self) {
        self.armed = false;
        release(self.id, self.handle.as_ref(), self.process.as_deref()).await;
    }
}

impl Drop for PendingSandbox {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(sandbox_id = %self.id, "No runtime to release abandoned sandbox");
            return;
        };
        tracing::info!(sandbox_id = %self.id, "Provisioning abandoned, releasing sandbox");
        let id = self.id;
        let handle = Arc::clone(&self.handle);
        let process = self.process.clone();
        runtime.spawn(async move {
            release(id, handle.as_ref(), process.as_deref()).await;
        });
    }
}

/// Best-effort release of a partially provisioned sandbox.
async fn release(id: SandboxId, handle: &dyn SandboxHandle, process: Option<&dyn SandboxProcess>) {
    tracing::debug!(sandbox_id = %id, "Releasing partially provisioned sandbox");
    if let Some(process) = process {
        if let Err(e) = process.kill().await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to kill process during release");
        }
    }
    if let Err(e) = handle.dispose().await {
        tracing::warn!(sandbox_id = %id, error = %e, "Failed to dispose sandbox during release");
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        format!("{base}/")
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
