//! # vizbox-runtime
//!
//! Sandbox provisioning layer for vizbox.
//!
//! The orchestrator only ever talks to the traits in this crate:
//!
//! ```text
//! SandboxProvider::create(env) ──▶ SandboxHandle
//!                                    ├─ write_file(path, bytes)
//!                                    ├─ run(entrypoint) ──▶ SandboxProcess { pid, kill() }
//!                                    ├─ expose_http(&process) ──▶ public URL
//!                                    └─ dispose()
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use vizbox_runtime::{LocalProvider, LocalProviderConfig, SandboxEnv, SandboxProvider};
//!
//! # async fn example() -> vizbox_runtime::Result<()> {
//! let provider = LocalProvider::new(LocalProviderConfig::default());
//! let sandbox = provider
//!     .create(SandboxEnv::new().with("ANTHROPIC_API_KEY", "sk-..."))
//!     .await?;
//!
//! sandbox.write_file("/app/generator.json", "{}".into()).await?;
//! let process = sandbox.run("/app/generator.json").await?;
//! let url = sandbox.expose_http(process.as_ref()).await?;
//! println!("serving at {url}");
//!
//! process.kill().await?;
//! sandbox.dispose().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod local;
mod provider;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Result, RuntimeError};
pub use local::{LocalProvider, LocalProviderConfig, PORT_ENV};
pub use provider::{
    resolve_in_root, ProcessId, SandboxEnv, SandboxHandle, SandboxProcess, SandboxProvider,
};
