//! In-memory provider for tests.
//!
//! [`StaticProvider`] never starts anything: every exposed process is
//! published at a fixed URL supplied by the test (usually a local axum
//! server standing in for the sandboxed program). Live handles and processes
//! are counted so tests can assert that nothing leaks.

use crate::error::{Result, RuntimeError};
use crate::provider::{ProcessId, SandboxEnv, SandboxHandle, SandboxProcess, SandboxProvider};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Step at which a [`StaticProvider`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    /// `SandboxProvider::create`
    Create,
    /// `SandboxHandle::write_file`
    Write,
    /// `SandboxHandle::run`
    Run,
    /// `SandboxHandle::expose_http`
    Expose,
}

#[derive(Default)]
struct Shared {
    url: Mutex<String>,
    fail_at: Mutex<Option<FailAt>>,
    delay: Mutex<Duration>,
    live_handles: AtomicUsize,
    live_processes: AtomicUsize,
    created: AtomicUsize,
    next_pid: AtomicU32,
    files: Mutex<HashMap<String, Bytes>>,
    envs: Mutex<Vec<SandboxEnv>>,
    entrypoints: Mutex<Vec<String>>,
}

/// Scriptable provider that publishes every sandbox at one URL.
#[derive(Clone)]
pub struct StaticProvider {
    shared: Arc<Shared>,
}

impl StaticProvider {
    /// Create a provider exposing sandboxes at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let shared = Shared {
            url: Mutex::new(url.into()),
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Change the URL returned for subsequently exposed processes.
    pub fn set_url(&self, url: impl Into<String>) {
        *lock(&self.shared.url) = url.into();
    }

    /// Make the provider fail at `step` from now on (`None` clears it).
    pub fn fail_at(&self, step: Option<FailAt>) {
        *lock(&self.shared.fail_at) = step;
    }

    /// Sleep for `delay` at the start of every provisioning step.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.shared.delay) = delay;
    }

    /// Handles created and not yet disposed.
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// Processes started and not yet killed.
    pub fn live_processes(&self) -> usize {
        self.shared.live_processes.load(Ordering::SeqCst)
    }

    /// Total number of successful `create` calls.
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    /// Contents of the most recent write to `path`, across all sandboxes.
    pub fn file(&self, path: &str) -> Option<Bytes> {
        lock(&self.shared.files).get(path).cloned()
    }

    /// Environments passed to `create`, in call order.
    pub fn envs(&self) -> Vec<SandboxEnv> {
        lock(&self.shared.envs).clone()
    }

    /// Entrypoints passed to `run`, in call order.
    pub fn entrypoints(&self) -> Vec<String> {
        lock(&self.shared.entrypoints).clone()
    }

    async fn pause(&self) {
        let delay = *lock(&self.shared.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn should_fail(&self, step: FailAt) -> bool {
        *lock(&self.shared.fail_at) == Some(step)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SandboxProvider for StaticProvider {
    async fn create(&self, env: SandboxEnv) -> Result<Box<dyn SandboxHandle>> {
        self.pause().await;
        lock(&self.shared.envs).push(env);
        if self.should_fail(FailAt::Create) {
            return Err(RuntimeError::Create("injected failure".into()));
        }
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        self.shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticHandle {
            provider: self.clone(),
            disposed: AtomicBool::new(false),
        }))
    }
}

struct StaticHandle {
    provider: StaticProvider,
    disposed: AtomicBool,
}

#[async_trait]
impl SandboxHandle for StaticHandle {
    async fn write_file(&self, path: &str, contents: Bytes) -> Result<()> {
        self.provider.pause().await;
        if self.provider.should_fail(FailAt::Write) {
            return Err(RuntimeError::Io(std::io::Error::other("injected failure")));
        }
        lock(&self.provider.shared.files).insert(path.to_string(), contents);
        Ok(())
    }

    async fn run(&self, entrypoint: &str) -> Result<Box<dyn SandboxProcess>> {
        self.provider.pause().await;
        lock(&self.provider.shared.entrypoints).push(entrypoint.to_string());
        if self.provider.should_fail(FailAt::Run) {
            return Err(RuntimeError::Spawn("injected failure".into()));
        }
        let shared = &self.provider.shared;
        shared.live_processes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticProcess {
            pid: ProcessId(shared.next_pid.fetch_add(1, Ordering::SeqCst)),
            provider: self.provider.clone(),
            running: AtomicBool::new(true),
        }))
    }

    async fn expose_http(&self, process: &dyn SandboxProcess) -> Result<String> {
        self.provider.pause().await;
        if self.provider.should_fail(FailAt::Expose) || !process.is_running().await {
            return Err(RuntimeError::Expose("injected failure".into()));
        }
        Ok(lock(&self.provider.shared.url).clone())
    }

    async fn dispose(&self) -> Result<()> {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.provider.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct StaticProcess {
    pid: ProcessId,
    provider: StaticProvider,
    running: AtomicBool,
}

#[async_trait]
impl SandboxProcess for StaticProcess {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    async fn kill(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.provider
                .shared
                .live_processes
                .fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_track_lifecycle() {
        let provider = StaticProvider::new("http://127.0.0.1:9");
        let handle = provider.create(SandboxEnv::new()).await.unwrap();
        let process = handle.run("/app/generator.json").await.unwrap();
        assert_eq!(provider.live_handles(), 1);
        assert_eq!(provider.live_processes(), 1);

        let url = handle.expose_http(process.as_ref()).await.unwrap();
        assert_eq!(url, "http://127.0.0.1:9");

        process.kill().await.unwrap();
        process.kill().await.unwrap();
        handle.dispose().await.unwrap();
        handle.dispose().await.unwrap();
        assert_eq!(provider.live_handles(), 0);
        assert_eq!(provider.live_processes(), 0);
        assert_eq!(provider.entrypoints(), vec!["/app/generator.json"]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = StaticProvider::new("http://127.0.0.1:9");
        provider.fail_at(Some(FailAt::Create));
        assert!(provider.create(SandboxEnv::new()).await.is_err());
        assert_eq!(provider.live_handles(), 0);

        provider.fail_at(None);
        assert!(provider.create(SandboxEnv::new()).await.is_ok());
    }
}
