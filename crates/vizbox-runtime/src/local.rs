//! Process-backed provider for development and single-host deployments.
//!
//! Each sandbox is a private directory under the configured working
//! directory. The entrypoint is handed to the generator binary, which runs
//! as a child process bound to a port reserved when the sandbox is created.

use crate::error::{Result, RuntimeError};
use crate::provider::{
    resolve_in_root, ProcessId, SandboxEnv, SandboxHandle, SandboxProcess, SandboxProvider,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Environment variable carrying the port the sandboxed process must bind.
pub const PORT_ENV: &str = "PORT";

/// Configuration for [`LocalProvider`].
#[derive(Debug, Clone)]
pub struct LocalProviderConfig {
    /// Directory under which per-sandbox directories are created.
    pub workdir: PathBuf,
    /// Binary that interprets entrypoint files.
    pub generator_bin: PathBuf,
    /// Address processes bind to and URLs are published on.
    pub host: IpAddr,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/tmp/vizbox"),
            generator_bin: PathBuf::from("vizbox-generator"),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// Provider that runs sandboxes as local child processes.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    config: LocalProviderConfig,
}

impl LocalProvider {
    /// Create a new local provider.
    pub fn new(config: LocalProviderConfig) -> Self {
        tracing::info!(
            workdir = %config.workdir.display(),
            generator_bin = %config.generator_bin.display(),
            host = %config.host,
            "Creating local sandbox provider"
        );
        Self { config }
    }

    /// Get the provider configuration.
    pub fn config(&self) -> &LocalProviderConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn create(&self, mut env: SandboxEnv) -> Result<Box<dyn SandboxHandle>> {
        let id = Uuid::new_v4();
        let root = self.config.workdir.join(id.to_string());
        tracing::debug!(local_id = %id, root = %root.display(), "Creating local sandbox");

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| RuntimeError::Create(format!("failed to create {}: {e}", root.display())))?;

        let addr = match reserve_port(self.config.host).await {
            Ok(addr) => addr,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                    tracing::warn!(local_id = %id, error = %cleanup, "Failed to remove sandbox directory");
                }
                return Err(e);
            }
        };
        env.set(PORT_ENV, addr.port().to_string());

        tracing::debug!(local_id = %id, %addr, vars = env.len(), "Local sandbox created");
        Ok(Box::new(LocalSandbox {
            id,
            root,
            addr,
            generator_bin: self.config.generator_bin.clone(),
            env,
        }))
    }
}

/// Ask the OS for a free port on `host`.
///
/// The listener is dropped immediately so the sandboxed process can bind it.
async fn reserve_port(host: IpAddr) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::new(host, 0))
        .await
        .map_err(|e| RuntimeError::Create(format!("failed to reserve port: {e}")))?;
    Ok(listener.local_addr()?)
}

/// Open a log file for a child's output without blocking the runtime.
async fn create_log(path: &Path) -> Result<std::fs::File> {
    let file = tokio::fs::File::create(path).await?;
    Ok(file.into_std().await)
}

struct LocalSandbox {
    id: Uuid,
    root: PathBuf,
    addr: SocketAddr,
    generator_bin: PathBuf,
    env: SandboxEnv,
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    async fn write_file(&self, path: &str, contents: Bytes) -> Result<()> {
        let target = resolve_in_root(&self.root, path)?;
        tracing::trace!(local_id = %self.id, path = %target.display(), size = contents.len(), "Writing file");
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &contents).await?;
        Ok(())
    }

    async fn run(&self, entrypoint: &str) -> Result<Box<dyn SandboxProcess>> {
        let program = resolve_in_root(&self.root, entrypoint)?;
        if !tokio::fs::try_exists(&program).await.unwrap_or(false) {
            return Err(RuntimeError::Spawn(format!(
                "entrypoint not found: {entrypoint}"
            )));
        }

        let stdout = create_log(&self.root.join("stdout.log")).await?;
        let stderr = create_log(&self.root.join("stderr.log")).await?;

        let child = Command::new(&self.generator_bin)
            .arg(&program)
            .current_dir(&self.root)
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::Spawn(format!("{}: {e}", self.generator_bin.display()))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| RuntimeError::Spawn("process exited before reporting a pid".into()))?;
        tracing::debug!(local_id = %self.id, pid, entrypoint, "Process started");

        Ok(Box::new(LocalProcess {
            pid: ProcessId(pid),
            child: Mutex::new(child),
        }))
    }

    async fn expose_http(&self, process: &dyn SandboxProcess) -> Result<String> {
        if !process.is_running().await {
            return Err(RuntimeError::Expose(format!(
                "process {} is not running",
                process.pid()
            )));
        }
        Ok(format!("http://{}", self.addr))
    }

    async fn dispose(&self) -> Result<()> {
        tracing::debug!(local_id = %self.id, root = %self.root.display(), "Disposing local sandbox");
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::Dispose(e.to_string())),
        }
    }
}

struct LocalProcess {
    pid: ProcessId,
    child: Mutex<Child>,
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    async fn kill(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::trace!(pid = %self.pid, %status, "Process already exited");
            return Ok(());
        }
        child.kill().await.map_err(|e| RuntimeError::Kill {
            pid: self.pid.0,
            message: e.to_string(),
        })
    }

    async fn is_running(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider(workdir: PathBuf, bin: &str) -> LocalProvider {
        LocalProvider::new(LocalProviderConfig {
            workdir,
            generator_bin: PathBuf::from(bin),
            ..Default::default()
        })
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vizbox-local-{name}-{}", Uuid::new_v4()))
    }

    async fn handle_dirs(workdir: &Path) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(workdir).await else {
            return dirs;
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            dirs.push(PathBuf::from(entry.file_name()));
        }
        dirs
    }

    #[test]
    fn test_config_defaults() {
        let config = LocalProviderConfig::default();
        assert_eq!(config.workdir, PathBuf::from("/tmp/vizbox"));
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_write_file_and_dispose() {
        let workdir = scratch_dir("write");
        let provider = test_provider(workdir.clone(), "true");
        let handle = provider.create(SandboxEnv::new()).await.unwrap();

        handle
            .write_file("/app/generator.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let mut entries = tokio::fs::read_dir(&workdir).await.unwrap();
        let sandbox_dir = entries.next_entry().await.unwrap().unwrap().path();
        let written = tokio::fs::read(sandbox_dir.join("app/generator.json"))
            .await
            .unwrap();
        assert_eq!(written, b"{}");

        handle.dispose().await.unwrap();
        assert!(!sandbox_dir.exists());
        // Disposing twice is harmless
        handle.dispose().await.unwrap();

        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }

    #[tokio::test]
    async fn test_write_file_rejects_escape() {
        let workdir = scratch_dir("escape");
        let provider = test_provider(workdir.clone(), "true");
        let handle = provider.create(SandboxEnv::new()).await.unwrap();

        let result = handle
            .write_file("../outside.txt", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(RuntimeError::InvalidPath(_))));

        handle.dispose().await.unwrap();
        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }

    #[tokio::test]
    async fn test_run_missing_entrypoint() {
        let workdir = scratch_dir("missing");
        let provider = test_provider(workdir.clone(), "true");
        let handle = provider.create(SandboxEnv::new()).await.unwrap();

        let result = handle.run("/app/nope.json").await;
        assert!(matches!(result, Err(RuntimeError::Spawn(_))));

        handle.dispose().await.unwrap();
        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_expose_and_kill() {
        let workdir = scratch_dir("run");
        // `sleep <file>` fails on a non-numeric argument, so use `tail -f`
        let provider = test_provider(workdir.clone(), "tail");
        let handle = provider.create(SandboxEnv::new()).await.unwrap();
        handle
            .write_file("app/entry", Bytes::from_static(b""))
            .await
            .unwrap();

        let process = handle.run("app/entry").await.unwrap();
        assert!(process.is_running().await);
        let root = workdir.join(handle_dirs(&workdir).await.remove(0));
        assert!(tokio::fs::try_exists(root.join("stdout.log")).await.unwrap());
        assert!(tokio::fs::try_exists(root.join("stderr.log")).await.unwrap());

        let url = handle.expose_http(process.as_ref()).await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));

        process.kill().await.unwrap();
        assert!(!process.is_running().await);
        // Killing an exited process is not an error
        process.kill().await.unwrap();

        let result = handle.expose_http(process.as_ref()).await;
        assert!(matches!(result, Err(RuntimeError::Expose(_))));

        handle.dispose().await.unwrap();
        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }

    #[tokio::test]
    async fn test_failed_create_removes_directory() {
        let workdir = scratch_dir("noport");
        let provider = LocalProvider::new(LocalProviderConfig {
            workdir: workdir.clone(),
            generator_bin: PathBuf::from("true"),
            // TEST-NET-1, never assigned to a local interface
            host: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        });

        let result = provider.create(SandboxEnv::new()).await;
        assert!(matches!(result, Err(RuntimeError::Create(_))));
        assert!(handle_dirs(&workdir).await.is_empty());

        let _ = tokio::fs::remove_dir_all(&workdir).await;
    }
}
