//! HTTP surface of the sandbox.
//!
//! ## Endpoints
//!
//! - `GET /` - the generated chart once ready, otherwise a progress page
//! - `GET /status` - `{phase, elapsed, ready, error}`
//! - `GET /health` - `{status, error}`

use crate::state::{GenerationState, Phase, StatusReport};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

/// Seconds between reloads of the progress page.
const REFRESH_SECS: u32 = 2;

/// Build the sandbox router over a reader of the phase cell.
pub fn build_router(state: watch::Receiver<GenerationState>) -> Router {
    Router::new()
        .route("/", get(artifact_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn artifact_handler(State(state): State<watch::Receiver<GenerationState>>) -> Response {
    let state = state.borrow().clone();
    let elapsed_ms = state.elapsed_ms();
    match (state.phase, state.artifact) {
        (Phase::Ready, Some(artifact)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            artifact.to_string(),
        )
            .into_response(),
        (Phase::Error, _) => {
            let message = state.error.as_deref().unwrap_or("unknown error");
            (StatusCode::INTERNAL_SERVER_ERROR, Html(error_page(message))).into_response()
        }
        (phase, _) => {
            (StatusCode::ACCEPTED, Html(progress_page(phase, elapsed_ms))).into_response()
        }
    }
}

async fn status_handler(State(state): State<watch::Receiver<GenerationState>>) -> Json<StatusReport> {
    let report = state.borrow().status();
    tracing::trace!(phase = %report.phase, elapsed_ms = report.elapsed, "Status request");
    Json(report)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    error: Option<String>,
}

async fn health_handler(State(state): State<watch::Receiver<GenerationState>>) -> Json<Health> {
    let state = state.borrow();
    let health = match state.phase {
        Phase::Error => Health {
            status: "error",
            error: state.error.clone(),
        },
        _ => Health {
            status: "ok",
            error: None,
        },
    };
    Json(health)
}

fn progress_page(phase: Phase, elapsed_ms: u64) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta http-equiv="refresh" content="{REFRESH_SECS}">
    <title>Generating chart</title>
    <style>
        body {{ font-family: system-ui; max-width: 640px; margin: 80px auto; color: #333; }}
        code {{ background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }}
    </style>
</head>
<body>
    <h1>Generating your chart</h1>
    <p>Current step: <code>{phase}</code> ({seconds:.1}s elapsed)</p>
    <p>This page reloads automatically.</p>
</body>
</html>"#,
        seconds = elapsed_ms as f64 / 1000.0,
    )
}

fn error_page(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Chart generation failed</title>
    <style>
        body {{ font-family: system-ui; max-width: 640px; margin: 80px auto; color: #333; }}
        pre {{ background: #fbeaea; padding: 16px; border-radius: 6px; white-space: pre-wrap; }}
    </style>
</head>
<body>
    <h1>Chart generation failed</h1>
    <pre>{}</pre>
</body>
</html>"#,
        escape_html(message)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
