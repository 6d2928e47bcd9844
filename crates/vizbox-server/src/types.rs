//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};
use vizbox_core::{OrchestratorStats, SandboxId, TrackerStats};

/// Body of `POST /visualizations`.
#[derive(Debug, Deserialize)]
pub struct CreateVisualizationRequest {
    /// Request forwarded verbatim to the generator.
    pub payload: serde_json::Value,

    /// Deployment id to report progress under (default: random UUID).
    #[serde(default)]
    pub tracking_id: Option<String>,

    /// Wait for the chart instead of returning the sandbox URL.
    #[serde(default)]
    pub wait: bool,
}

/// Result of `POST /visualizations`.
#[derive(Debug, Serialize)]
pub struct VisualizationResponse {
    /// Deployment id events were reported under.
    pub tracking_id: String,
    /// Sandbox that served the request.
    pub sandbox_id: SandboxId,
    /// Public URL, when the sandbox is still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Generated HTML, when the request waited for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sandboxes: OrchestratorStats,
    pub deployments: TrackerStats,
}

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human readable message.
    pub error: String,
    /// Machine readable kind.
    pub kind: &'static str,
}
