//! Configuration types for the orchestrator and its helpers.

use crate::error::CoreError;
use std::time::Duration;

/// Default model written into generator jobs.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

/// Reachability verification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Maximum number of attempts (default: 5).
    pub attempts: u32,
    /// Timeout for a single attempt (default: 10s).
    pub attempt_timeout: Duration,
    /// Fixed delay between failed attempts (default: 3s).
    pub retry_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            attempt_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Generation status polling settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between status polls (default: 2s).
    pub interval: Duration,
    /// Total time to wait for readiness (default: 90s).
    pub budget: Duration,
    /// Timeout for each status or artifact request (default: 10s).
    pub request_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(90),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Periodic cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps (default: 5 minutes).
    pub interval: Duration,
    /// Sandboxes older than this are destroyed (default: 1 hour).
    pub sandbox_ttl: Duration,
    /// Deployment logs older than this are evicted (default: 1 hour).
    pub log_ttl: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            sandbox_ttl: Duration::from_secs(60 * 60),
            log_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for [`SandboxOrchestrator`](crate::SandboxOrchestrator).
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Credential for the provisioning runtime. Without it the
    /// orchestrator reports itself unconfigured.
    pub provider_token: Option<String>,
    /// Budget for each provisioning call (default: 30s).
    pub provision_timeout: Duration,
    /// Timeout for proxied fetches into a sandbox (default: 10s).
    pub fetch_timeout: Duration,
    /// Maximum number of live sandboxes (default: 0 = unlimited).
    pub max_sandboxes: usize,
    /// Override for the AI endpoint used inside sandboxes.
    pub ai_base_url: Option<String>,
    /// Model requested by the generator.
    pub model: String,
    /// Token limit requested by the generator (default: 8192).
    pub max_tokens: u32,
    /// Reachability verification settings.
    pub probe: ProbeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_token: None,
            provision_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            max_sandboxes: 0,
            ai_base_url: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            probe: ProbeConfig::default(),
        }
    }
}

// The provider token is a credential.
impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("provider_token", &self.provider_token.as_ref().map(|_| "<redacted>"))
            .field("provision_timeout", &self.provision_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("max_sandboxes", &self.max_sandboxes)
            .field("ai_base_url", &self.ai_base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("probe", &self.probe)
            .finish()
    }
}

impl OrchestratorConfig {
    /// Create a new config builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// True if a non-empty provisioning credential is present.
    pub fn has_provider_token(&self) -> bool {
        self.provider_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }

    /// Validate the configuration.
    ///
    /// A missing provider token is not a validation failure: it is reported
    /// per call so an unconfigured orchestrator can still serve stats.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.provision_timeout.is_zero() {
            return Err(CoreError::Configuration(
                "provision_timeout must be > 0".into(),
            ));
        }
        if self.fetch_timeout.is_zero() {
            return Err(CoreError::Configuration("fetch_timeout must be > 0".into()));
        }
        if self.probe.attempts == 0 {
            return Err(CoreError::Configuration(
                "probe.attempts must be > 0".into(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(CoreError::Configuration("model is required".into()));
        }
        if self.max_tokens == 0 {
            return Err(CoreError::Configuration("max_tokens must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for OrchestratorConfig.
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Set the provisioning credential.
    pub fn provider_token(mut self, token: impl Into<String>) -> Self {
        self.config.provider_token = Some(token.into());
        self
    }

    /// Set the per-call provisioning budget.
    pub fn provision_timeout(mut self, timeout: Duration) -> Self {
        self.config.provision_timeout = timeout;
        self
    }

    /// Set the proxied fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Cap the number of live sandboxes (0 = unlimited).
    pub fn max_sandboxes(mut self, max: usize) -> Self {
        self.config.max_sandboxes = max;
        self
    }

    /// Point sandboxes at a different AI endpoint.
    pub fn ai_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.ai_base_url = Some(url.into());
        self
    }

    /// Set the generator model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set the generator token limit.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    /// Set the verification settings.
    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.config.probe = probe;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<OrchestratorConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.provision_timeout, Duration::from_secs(30));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.max_sandboxes, 0);
        assert!(!config.has_provider_token());
    }

    #[test]
    fn test_probe_and_poll_defaults() {
        let probe = ProbeConfig::default();
        assert_eq!(probe.attempts, 5);
        assert_eq!(probe.attempt_timeout, Duration::from_secs(10));
        assert_eq!(probe.retry_delay, Duration::from_secs(3));

        let poll = PollConfig::default();
        assert_eq!(poll.interval, Duration::from_secs(2));
        assert_eq!(poll.budget, Duration::from_secs(90));

        let reaper = ReaperConfig::default();
        assert_eq!(reaper.sandbox_ttl, Duration::from_secs(3600));
        assert_eq!(reaper.log_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_blank_token_is_not_configured() {
        let config = OrchestratorConfig::builder()
            .provider_token("   ")
            .build()
            .expect("should build");
        assert!(!config.has_provider_token());
    }

    #[test]
    fn test_builder_validation_zero_attempts() {
        let result = OrchestratorConfig::builder()
            .probe(ProbeConfig {
                attempts: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_builder_success() {
        let config = OrchestratorConfig::builder()
            .provider_token("tok")
            .provision_timeout(Duration::from_secs(5))
            .max_sandboxes(4)
            .ai_base_url("http://127.0.0.1:9999")
            .build()
            .expect("should build successfully");

        assert!(config.has_provider_token());
        assert_eq!(config.provision_timeout, Duration::from_secs(5));
        assert_eq!(config.max_sandboxes, 4);
        assert_eq!(config.ai_base_url.as_deref(), Some("http://127.0.0.1:9999"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = OrchestratorConfig::builder()
            .provider_token("very-secret")
            .build()
            .unwrap();
        assert!(!format!("{:?}", config).contains("very-secret"));
    }
}
