//! The provisioning contract consumed by the orchestrator.
//!
//! A provider hands out isolated [`SandboxHandle`]s. A handle owns a private
//! filesystem, can start processes inside it and can publish one of those
//! processes as a public HTTP endpoint.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Environment injected into a sandbox at creation time.
///
/// Secrets travel here and never on a command line.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SandboxEnv {
    vars: BTreeMap<String, String>,
}

impl SandboxEnv {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable, replacing any previous value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set a variable in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterate over all variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True if no variables are set.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

// Values are redacted: the env carries API keys.
impl fmt::Debug for SandboxEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// OS-level identifier of a process running inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates isolated sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new sandbox with `env` injected into every process it runs.
    async fn create(&self, env: SandboxEnv) -> Result<Box<dyn SandboxHandle>>;
}

/// A live sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Write `contents` to `path` inside the sandbox filesystem.
    async fn write_file(&self, path: &str, contents: Bytes) -> Result<()>;

    /// Start `entrypoint` (a path inside the sandbox) as a process.
    async fn run(&self, entrypoint: &str) -> Result<Box<dyn SandboxProcess>>;

    /// Publish `process` as a public HTTP endpoint and return its URL.
    async fn expose_http(&self, process: &dyn SandboxProcess) -> Result<String>;

    /// Release every resource held by the sandbox.
    async fn dispose(&self) -> Result<()>;
}

/// A process running inside a sandbox.
#[async_trait]
pub trait SandboxProcess: Send + Sync {
    /// The process id.
    fn pid(&self) -> ProcessId;

    /// Terminate the process. Killing an already exited process succeeds.
    async fn kill(&self) -> Result<()>;

    /// True while the process has not exited.
    async fn is_running(&self) -> bool;
}

/// Resolve a sandbox path against `root`.
///
/// Absolute paths are re-rooted under `root`. Any `..` component is
/// rejected so a caller cannot write outside the sandbox.
pub fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut pushed = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                pushed = true;
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(crate::RuntimeError::InvalidPath(path.to_string()));
            }
        }
    }
    if !pushed {
        return Err(crate::RuntimeError::InvalidPath(path.to_string()));
    }
    Ok(resolved)
}
