//! Generation phase cell shared between the background task and the HTTP
//! handlers.
//!
//! The background task owns the only [`PhaseCell`]; handlers hold a
//! `watch::Receiver` and never block on generation.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Generation phases, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    ParsingRequest,
    CreatingClient,
    CallingApi,
    ParsingResponse,
    Ready,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::ParsingRequest => "parsing_request",
            Self::CreatingClient => "creating_client",
            Self::CallingApi => "calling_api",
            Self::ParsingResponse => "parsing_response",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of the one generation this process runs.
#[derive(Debug, Clone)]
pub struct GenerationState {
    pub phase: Phase,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub error: Option<String>,
    pub artifact: Option<Arc<str>>,
}

impl GenerationState {
    fn new() -> Self {
        Self {
            phase: Phase::Initializing,
            started_at: Instant::now(),
            finished_at: None,
            error: None,
            artifact: None,
        }
    }

    /// Milliseconds since start, frozen once a terminal phase is reached.
    pub fn elapsed_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_millis() as u64
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            phase: self.phase,
            elapsed: self.elapsed_ms(),
            ready: self.phase == Phase::Ready,
            error: self.error.clone(),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub phase: Phase,
    pub elapsed: u64,
    pub ready: bool,
    pub error: Option<String>,
}

/// Write side of the phase cell.
pub struct PhaseCell {
    tx: watch::Sender<GenerationState>,
}

impl PhaseCell {
    /// Create a cell in [`Phase::Initializing`] and a reader for it.
    pub fn new() -> (Self, watch::Receiver<GenerationState>) {
        let (tx, rx) = watch::channel(GenerationState::new());
        (Self { tx }, rx)
    }

    /// Enter `phase`. Ignored once terminal.
    pub fn advance(&self, phase: Phase) {
        self.tx.send_if_modified(|state| {
            if state.phase.is_terminal() {
                return false;
            }
            tracing::debug!(from = %state.phase, to = %phase, elapsed_ms = state.elapsed_ms(), "Phase change");
            state.phase = phase;
            if phase.is_terminal() {
                state.finished_at = Some(Instant::now());
            }
            true
        });
    }

    /// Publish the artifact and enter [`Phase::Ready`].
    pub fn complete(&self, artifact: String) {
        self.tx.send_if_modified(|state| {
            if state.phase.is_terminal() {
                return false;
            }
            state.artifact = Some(artifact.into());
            state.phase = Phase::Ready;
            state.finished_at = Some(Instant::now());
            true
        });
    }

    /// Record `error` and enter [`Phase::Error`].
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_if_modified(|state| {
            if state.phase.is_terminal() {
                return false;
            }
            tracing::error!(phase = %state.phase, error = %error, "Generation failed");
            state.error = Some(error);
            state.phase = Phase::Error;
            state.finished_at = Some(Instant::now());
            true
        });
    }
}
