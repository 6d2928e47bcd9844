//! vizbox-generator: chart generator that runs inside a sandbox.
//!
//! Reads the job file named on the command line, starts serving `/`,
//! `/status` and `/health` on `$PORT`, and only then generates the chart in
//! a background task.
//!
//! ## Environment
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PORT` | `8080` |
//! | `ANTHROPIC_API_KEY` | required |
//! | `VIZBOX_AI_BASE_URL` | `https://api.anthropic.com` |
//! | `VIZBOX_SANDBOX_ID` | unset (log context only) |

mod generate;
mod job;
mod pipeline;
mod server;
mod state;

use anyhow::Context;
use generate::{AnthropicGenerator, CodeGenerator};
use job::Job;
use pipeline::Connect;
use state::PhaseCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_PORT: u16 = 8080;

/// Upper bound on one messages API call.
const API_TIMEOUT: Duration = Duration::from_secs(80);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("vizbox_generator=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let job_path: PathBuf = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: vizbox-generator <job.json>")?;
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let sandbox_id = std::env::var("VIZBOX_SANDBOX_ID").unwrap_or_default();

    tracing::info!(sandbox_id = %sandbox_id, job = %job_path.display(), port, "vizbox-generator starting");

    let (cell, reader) = PhaseCell::new();

    // Bind before generating so /status answers from the start
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening");

    let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
    let base_url = std::env::var("VIZBOX_AI_BASE_URL").ok();
    let connect: Connect = Box::new(move |_job: &Job| {
        let generator = AnthropicGenerator::new(api_key, base_url, API_TIMEOUT)?;
        Ok(Arc::new(generator) as Arc<dyn CodeGenerator>)
    });
    tokio::spawn(
        pipeline::run(cell, job_path, connect)
            .instrument(tracing::info_span!("generation", sandbox_id = %sandbox_id)),
    );

    axum::serve(listener, server::build_router(reader))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("vizbox-generator stopped");
    Ok(())
}
