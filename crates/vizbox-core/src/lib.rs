//! # vizbox-core
//!
//! Orchestration layer for ephemeral chart-generation sandboxes.
//!
//! Each visualization request gets a fresh sandbox running the generator
//! program. This crate provisions it, tracks its progress, checks that it is
//! reachable, waits for the chart and tears it down again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      vizbox-core (host)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────────┐      ┌───────────────────────────┐   │
//! │  │  GenerationPoller  │─────▶│   SandboxOrchestrator     │   │
//! │  │  - create_and_     │      │   - create_visualization  │   │
//! │  │    fetch           │      │   - fetch_from_sandbox    │   │
//! │  └────────────────────┘      │   - destroy_sandbox       │   │
//! │                              │   DashMap<SandboxId, ..>  │   │
//! │  ┌────────────────────┐      └───────────────────────────┘   │
//! │  │  ResourceReaper    │─────▶   │            │               │
//! │  │  - sweep()         │         ▼            ▼               │
//! │  └────────────────────┘  ┌──────────────┐ ┌──────────────┐   │
//! │                          │ Verification │ │  Deployment  │   │
//! │                          │ Prober       │ │  Tracker     │   │
//! │                          └──────────────┘ └──────────────┘   │
//! │                                 │                            │
//! └─────────────────────────────────┼────────────────────────────┘
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │        vizbox-runtime (SandboxProvider / SandboxHandle)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vizbox_core::{
//!     DeploymentTracker, GenerationPoller, OrchestratorConfig, PollConfig,
//!     SandboxOrchestrator,
//! };
//! use vizbox_runtime::{LocalProvider, LocalProviderConfig};
//!
//! # async fn example() -> vizbox_core::Result<()> {
//! let tracker = Arc::new(DeploymentTracker::new());
//! let orchestrator = Arc::new(SandboxOrchestrator::new(
//!     Arc::new(LocalProvider::new(LocalProviderConfig::default())),
//!     Arc::clone(&tracker),
//!     OrchestratorConfig::builder().provider_token("local").build()?,
//! )?);
//!
//! tracker.start("chart-1");
//! let poller = GenerationPoller::new(Arc::clone(&orchestrator), PollConfig::default());
//! let chart = poller
//!     .create_and_fetch_visualization(
//!         &serde_json::json!({"prompt": "monthly revenue as a bar chart"}),
//!         "sk-ant-...",
//!         Some("chart-1"),
//!     )
//!     .await?;
//! println!("{} bytes of HTML", chart.artifact.len());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod orchestrator;
mod poller;
mod prober;
mod program;
mod reaper;
mod sandbox;
mod tracker;

pub use config::{
    OrchestratorConfig, OrchestratorConfigBuilder, PollConfig, ProbeConfig, ReaperConfig,
    DEFAULT_MODEL,
};
pub use error::{CoreError, Result};
pub use orchestrator::{
    Deployment, OrchestratorStats, SandboxOrchestrator, AI_BASE_URL_ENV, SANDBOX_ID_ENV,
    SECRET_ENV,
};
pub use poller::{
    GeneratedVisualization, GenerationPoller, GenerationStatus, ARTIFACT_PATH, PHASE_ERROR,
    STATUS_PATH,
};
pub use prober::VerificationProber;
pub use program::{GeneratorProgram, ENTRYPOINT, JOB_VERSION};
pub use reaper::{ReapStats, ResourceReaper};
pub use sandbox::{SandboxId, SandboxInfo};
pub use tracker::{
    DeploymentEvent, DeploymentLog, DeploymentStage, DeploymentStatus, DeploymentTracker,
    Listener, Subscription, TrackerStats,
};
