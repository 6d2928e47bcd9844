//! HTTP/SSE surface over the orchestrator.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /stats` - Sandbox registry and deployment counts
//! - `POST /visualizations` - Deploy, or with `wait` generate and fetch
//! - `GET /deployments/:id` - Deployment log
//! - `GET /deployments/:id/events` - SSE stream of deployment events
//! - `GET /sandboxes` - Active sandboxes
//! - `GET /sandboxes/:id` - The sandbox root page
//! - `GET /sandboxes/:id/*path` - Any other sandbox path
//! - `DELETE /sandboxes/:id` - Destroy a sandbox

use crate::server::VizboxServer;
use crate::types::{CreateVisualizationRequest, ErrorBody, StatsResponse, VisualizationResponse};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use vizbox_core::{CoreError, DeploymentEvent, SandboxId, Subscription};

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Unknown deployment or malformed sandbox id
    #[error("{0} not found")]
    NotFound(&'static str),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Core(e) => match e {
                CoreError::Configuration(_) => (StatusCode::SERVICE_UNAVAILABLE, "configuration"),
                CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                CoreError::GenerationTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "generation_timeout"),
                CoreError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                CoreError::Provisioning { .. } => (StatusCode::BAD_GATEWAY, "provisioning"),
                CoreError::Generation(_) => (StatusCode::BAD_GATEWAY, "generation"),
                CoreError::VerificationTimeout { .. } => (StatusCode::BAD_GATEWAY, "verification"),
                CoreError::Http(_) => (StatusCode::BAD_GATEWAY, "upstream"),
                CoreError::Runtime(_) | CoreError::Json(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), kind, error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), kind, error = %self, "Request rejected");
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP router for the daemon.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: VizboxServer) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/visualizations", post(create_visualization_handler))
        .route("/deployments/:id", get(deployment_handler))
        .route("/deployments/:id/events", get(deployment_events_handler))
        .route("/sandboxes", get(list_sandboxes_handler))
        .route(
            "/sandboxes/:id",
            get(sandbox_root_handler).delete(destroy_sandbox_handler),
        )
        .route("/sandboxes/:id/*path", get(sandbox_path_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn health_handler(State(server): State<VizboxServer>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "vizbox-server",
        "configured": server.orchestrator().is_configured(),
    }))
}

async fn stats_handler(State(server): State<VizboxServer>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sandboxes: server.orchestrator().stats(),
        deployments: server.tracker().stats(),
    })
}

async fn create_visualization_handler(
    State(server): State<VizboxServer>,
    Json(request): Json<CreateVisualizationRequest>,
) -> Result<Response, ApiError> {
    let tracking_id = request
        .tracking_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::info!(deployment_id = %tracking_id, wait = request.wait, "Visualization requested");

    server.tracker().start(&tracking_id);

    if request.wait {
        let chart = server
            .poller()
            .create_and_fetch_visualization(
                &request.payload,
                server.api_key(),
                Some(tracking_id.as_str()),
            )
            .await?;
        let body = VisualizationResponse {
            tracking_id,
            sandbox_id: chart.id,
            url: None,
            artifact: Some(chart.artifact),
        };
        Ok((StatusCode::OK, Json(body)).into_response())
    } else {
        let deployment = server
            .orchestrator()
            .create_visualization(
                &request.payload,
                server.api_key(),
                Some(tracking_id.as_str()),
            )
            .await?;
        let body = VisualizationResponse {
            tracking_id,
            sandbox_id: deployment.id,
            url: Some(deployment.url),
            artifact: None,
        };
        Ok((StatusCode::CREATED, Json(body)).into_response())
    }
}

async fn deployment_handler(
    State(server): State<VizboxServer>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let log = server
        .tracker()
        .get_log(&id)
        .ok_or(ApiError::NotFound("deployment"))?;
    Ok(Json(log).into_response())
}

/// Stream events for one deployment: the events logged so far, then live
/// ones until the client disconnects or the log is evicted.
async fn deployment_events_handler(
    State(server): State<VizboxServer>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let tracker = server.tracker();

    // Subscribe before snapshotting so nothing falls between the two
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = tracker.subscribe(&id, move |event, _status| {
        let _ = tx.send(event.clone());
    });
    let guard = SubscriptionGuard(Some(subscription));

    let log = tracker.get_log(&id).ok_or(ApiError::NotFound("deployment"))?;
    tracing::debug!(deployment_id = %id, backlog = log.events.len(), "Event stream opened");

    let feed = EventFeed {
        seen: log.events.iter().map(|event| event.id).collect(),
        backlog: log.events.into(),
        live: rx,
        _guard: guard,
    };
    let stream = stream::unfold(feed, |mut feed| async move {
        let event = feed.next().await?;
        Some((Ok::<_, Infallible>(event), feed))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Removes the tracker listener when the event stream is dropped.
struct SubscriptionGuard(Option<Subscription>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

struct EventFeed {
    backlog: VecDeque<DeploymentEvent>,
    seen: HashSet<Uuid>,
    live: mpsc::UnboundedReceiver<DeploymentEvent>,
    _guard: SubscriptionGuard,
}

impl EventFeed {
    async fn next(&mut self) -> Option<Event> {
        loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => {
                    let event = self.live.recv().await?;
                    // Appended between subscribe and snapshot
                    if self.seen.remove(&event.id) {
                        continue;
                    }
                    event
                }
            };

            match Event::default()
                .event(event.stage.as_str())
                .id(event.id.to_string())
                .json_data(&event)
            {
                Ok(sse) => return Some(sse),
                Err(e) => tracing::warn!(error = %e, "Failed to encode deployment event"),
            }
        }
    }
}

async fn list_sandboxes_handler(State(server): State<VizboxServer>) -> impl IntoResponse {
    Json(server.orchestrator().list())
}

async fn sandbox_root_handler(
    State(server): State<VizboxServer>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    proxy(&server, &id, "/").await
}

async fn sandbox_path_handler(
    State(server): State<VizboxServer>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = format!("/{}", path.trim_start_matches('/'));
    proxy(&server, &id, &path).await
}

async fn proxy(server: &VizboxServer, id: &str, path: &str) -> Result<Response, ApiError> {
    let id = parse_sandbox_id(id)?;
    let upstream = server.orchestrator().fetch_from_sandbox(id, path).await?;

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    let body = upstream.bytes().await.map_err(CoreError::from)?;

    tracing::trace!(sandbox_id = %id, path, status = status.as_u16(), bytes = body.len(), "Proxied sandbox request");
    Ok((status, [(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn destroy_sandbox_handler(
    State(server): State<VizboxServer>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_sandbox_id(&id)?;
    if !server.orchestrator().exists(id) {
        return Err(CoreError::NotFound(id).into());
    }
    server.orchestrator().destroy_sandbox(id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Malformed ids get the same answer as unknown ones.
fn parse_sandbox_id(id: &str) -> Result<SandboxId, ApiError> {
    id.parse().map_err(|_| ApiError::NotFound("sandbox"))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: VizboxServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
