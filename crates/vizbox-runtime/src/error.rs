//! Error types for vizbox-runtime.

use thiserror::Error;

/// Result type alias for vizbox-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while provisioning or driving a sandbox.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Failed to create the sandbox
    #[error("failed to create sandbox: {0}")]
    Create(String),

    /// Failed to spawn the entrypoint process
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Failed to expose the process over HTTP
    #[error("failed to expose process: {0}")]
    Expose(String),

    /// Failed to kill a process
    #[error("failed to kill process {pid}: {message}")]
    Kill { pid: u32, message: String },

    /// Failed to dispose of the sandbox
    #[error("failed to dispose sandbox: {0}")]
    Dispose(String),

    /// Path escapes the sandbox root
    #[error("invalid sandbox path: {0}")]
    InvalidPath(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
