//! Configuration for the vizbox daemon.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use vizbox_core::{OrchestratorConfig, PollConfig, ReaperConfig};
use vizbox_runtime::LocalProviderConfig;

/// Configuration for the vizbox daemon.
#[derive(Clone)]
pub struct VizboxConfig {
    /// Credential gating sandbox provisioning.
    pub sandbox_token: Option<String>,

    /// AI key injected into every sandbox.
    pub api_key: Option<String>,

    /// Parent directory for sandbox working directories.
    pub workdir: PathBuf,

    /// Generator binary launched in each sandbox.
    pub generator_bin: PathBuf,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Sandboxes older than this are reaped (default: 1 hour).
    pub sandbox_ttl: Duration,

    /// Deployment logs older than this are reaped (default: 1 hour).
    pub log_ttl: Duration,

    /// Time between reaper sweeps (default: 5 minutes).
    pub reaper_interval: Duration,

    /// Maximum live sandboxes, 0 for unlimited.
    pub max_sandboxes: usize,

    /// Override for the AI endpoint used inside sandboxes.
    pub ai_base_url: Option<String>,
}

impl Default for VizboxConfig {
    fn default() -> Self {
        Self {
            sandbox_token: None,
            api_key: None,
            workdir: PathBuf::from("/tmp/vizbox"),
            generator_bin: PathBuf::from("vizbox-generator"),
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            sandbox_ttl: Duration::from_secs(60 * 60),
            log_ttl: Duration::from_secs(60 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
            max_sandboxes: 0,
            ai_base_url: None,
        }
    }
}

impl std::fmt::Debug for VizboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("VizboxConfig")
            .field("sandbox_token", &redact(&self.sandbox_token))
            .field("api_key", &redact(&self.api_key))
            .field("workdir", &self.workdir)
            .field("generator_bin", &self.generator_bin)
            .field("http_addr", &self.http_addr)
            .field("sandbox_ttl", &self.sandbox_ttl)
            .field("log_ttl", &self.log_ttl)
            .field("reaper_interval", &self.reaper_interval)
            .field("max_sandboxes", &self.max_sandboxes)
            .field("ai_base_url", &self.ai_base_url)
            .finish()
    }
}

impl VizboxConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VIZBOX_SANDBOX_TOKEN` | unset (provisioning disabled) |
    /// | `VIZBOX_API_KEY` | unset |
    /// | `VIZBOX_WORKDIR` | `/tmp/vizbox` |
    /// | `VIZBOX_GENERATOR_BIN` | `vizbox-generator` |
    /// | `VIZBOX_HTTP_HOST` | `0.0.0.0` |
    /// | `VIZBOX_HTTP_PORT` | `8080` |
    /// | `VIZBOX_SANDBOX_TTL_SECS` | `3600` |
    /// | `VIZBOX_LOG_TTL_SECS` | `3600` |
    /// | `VIZBOX_REAPER_INTERVAL_SECS` | `300` |
    /// | `VIZBOX_MAX_SANDBOXES` | `0` (unlimited) |
    /// | `VIZBOX_AI_BASE_URL` | unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let http_host: IpAddr = lookup("VIZBOX_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = lookup("VIZBOX_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            sandbox_token: non_empty("VIZBOX_SANDBOX_TOKEN"),
            api_key: non_empty("VIZBOX_API_KEY"),
            workdir: lookup("VIZBOX_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(default.workdir),
            generator_bin: lookup("VIZBOX_GENERATOR_BIN")
                .map(PathBuf::from)
                .unwrap_or(default.generator_bin),
            http_addr: SocketAddr::new(http_host, http_port),
            sandbox_ttl: secs("VIZBOX_SANDBOX_TTL_SECS", default.sandbox_ttl),
            log_ttl: secs("VIZBOX_LOG_TTL_SECS", default.log_ttl),
            reaper_interval: secs("VIZBOX_REAPER_INTERVAL_SECS", default.reaper_interval),
            max_sandboxes: lookup("VIZBOX_MAX_SANDBOXES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_sandboxes),
            ai_base_url: non_empty("VIZBOX_AI_BASE_URL"),
        }
    }

    /// Orchestrator settings derived from this configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            provider_token: self.sandbox_token.clone(),
            max_sandboxes: self.max_sandboxes,
            ai_base_url: self.ai_base_url.clone(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn provider_config(&self) -> LocalProviderConfig {
        LocalProviderConfig {
            workdir: self.workdir.clone(),
            generator_bin: self.generator_bin.clone(),
            ..LocalProviderConfig::default()
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            sandbox_ttl: self.sandbox_ttl,
            log_ttl: self.log_ttl,
        }
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::default()
    }

    /// Log warnings for settings that will make requests fail.
    ///
    /// The daemon still starts so stats and health stay available.
    pub fn validate_warn(&self) {
        if self.sandbox_token.is_none() {
            tracing::warn!("VIZBOX_SANDBOX_TOKEN not set, sandbox creation is disabled");
        }
        if self.api_key.is_none() {
            tracing::warn!("VIZBOX_API_KEY not set, visualization requests will be rejected");
        }
        if self.reaper_interval.is_zero() {
            tracing::warn!("VIZBOX_REAPER_INTERVAL_SECS is 0, reaper will spin");
        }
    }
}
