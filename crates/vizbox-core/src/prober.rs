//! Bounded-retry reachability checks against exposed sandboxes.

use crate::config::ProbeConfig;
use crate::error::{CoreError, Result};
use crate::tracker::{DeploymentStage, DeploymentTracker};
use std::sync::Arc;
use std::time::Instant;

/// Issues GET requests against a URL until one returns 2xx.
///
/// Attempts are separated by a fixed delay; there is no backoff.
#[derive(Clone)]
pub struct VerificationProber {
    http: reqwest::Client,
    tracker: Arc<DeploymentTracker>,
    config: ProbeConfig,
}

impl VerificationProber {
    /// Create a prober reporting through `tracker`.
    pub fn new(http: reqwest::Client, tracker: Arc<DeploymentTracker>, config: ProbeConfig) -> Self {
        Self {
            http,
            tracker,
            config,
        }
    }

    /// Get the probe configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe `url` until it answers 2xx or attempts run out.
    ///
    /// Returns the number of attempts used.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VerificationTimeout`] naming the final failure
    /// once every attempt has failed.
    pub async fn verify(&self, url: &str, tracking_id: Option<&str>) -> Result<u32> {
        let attempts = self.config.attempts.max(1);
        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.track(
                tracking_id,
                format!("Verification attempt {attempt}/{attempts}"),
                Some(serde_json::json!({ "url": url, "attempt": attempt })),
                None,
            );

            let outcome = self
                .http
                .get(url)
                .timeout(self.config.attempt_timeout)
                .send()
                .await;

            match outcome {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        url,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Sandbox endpoint reachable"
                    );
                    self.track(
                        tracking_id,
                        "Sandbox endpoint reachable".to_string(),
                        Some(serde_json::json!({
                            "attempt": attempt,
                            "status": response.status().as_u16(),
                        })),
                        None,
                    );
                    return Ok(attempt);
                }
                Ok(response) => last_error = format!("HTTP {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }

            tracing::debug!(url, attempt, error = %last_error, "Verification attempt failed");
            self.track(
                tracking_id,
                format!("Verification attempt {attempt} failed"),
                None,
                Some(last_error.clone()),
            );

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        tracing::warn!(
            url,
            attempts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            error = %last_error,
            "Verification exhausted all attempts"
        );
        Err(CoreError::VerificationTimeout {
            attempts,
            last_error,
        })
    }

    fn track(
        &self,
        tracking_id: Option<&str>,
        message: String,
        details: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if let Some(id) = tracking_id {
            self.tracker
                .log_event(id, DeploymentStage::Verification, message, details, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            attempts: 5,
            attempt_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Serve `/` answering 503 for the first `failures` hits, then 200.
    async fn flaky_server(failures: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= failures {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    fn prober(tracker: Arc<DeploymentTracker>) -> VerificationProber {
        VerificationProber::new(reqwest::Client::new(), tracker, fast_config())
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let (url, hits) = flaky_server(2).await;
        let tracker = Arc::new(DeploymentTracker::new());
        tracker.start("v1");

        let attempts = prober(Arc::clone(&tracker))
            .verify(&url, Some("v1"))
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let log = tracker.get_log("v1").unwrap();
        let failures = log.events.iter().filter(|e| e.error.is_some()).count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_five_attempts() {
        let (url, hits) = flaky_server(u32::MAX).await;
        let tracker = Arc::new(DeploymentTracker::new());

        let result = prober(tracker).verify(&url, None).await;

        match result {
            Err(CoreError::VerificationTimeout {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("503"));
            }
            other => panic!("expected verification timeout, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_connection_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tracker = Arc::new(DeploymentTracker::new());
        let prober = VerificationProber::new(
            reqwest::Client::new(),
            tracker,
            ProbeConfig {
                attempts: 2,
                ..fast_config()
            },
        );

        let result = prober.verify(&format!("http://{addr}/"), None).await;
        assert!(matches!(
            result,
            Err(CoreError::VerificationTimeout { attempts: 2, .. })
        ));
    }
}
