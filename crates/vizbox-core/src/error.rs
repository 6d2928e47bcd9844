//! Error types for vizbox-core.

use crate::SandboxId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for vizbox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while orchestrating sandboxes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing provisioning credential or secret. Raised before anything
    /// is allocated.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provisioning step (create, write, run, expose) failed
    #[error("provisioning failed for sandbox {sandbox_id}: {message}")]
    Provisioning {
        /// Sandbox the failure belongs to
        sandbox_id: SandboxId,
        /// Underlying failure
        message: String,
    },

    /// Sandbox not found
    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    /// Reachability checks exhausted every attempt
    #[error("verification failed after {attempts} attempts: {last_error}")]
    VerificationTimeout {
        /// Attempts made
        attempts: u32,
        /// Failure reported by the final attempt
        last_error: String,
    },

    /// The sandbox did not report readiness within the budget
    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    /// The sandbox reported a generation failure (message is verbatim)
    #[error("{0}")]
    Generation(String),

    /// A single operation exceeded its timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Timeout that elapsed
        after: Duration,
    },

    /// Error from the provisioning runtime
    #[error("runtime error: {0}")]
    Runtime(#[from] vizbox_runtime::RuntimeError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True for errors raised before any resource was allocated.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
