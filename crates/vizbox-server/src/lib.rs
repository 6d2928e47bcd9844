//! # vizbox-server
//!
//! HTTP daemon exposing vizbox chart-generation sandboxes.
//!
//! ## Quick Start
//!
//! ```bash
//! export VIZBOX_SANDBOX_TOKEN=local
//! export VIZBOX_API_KEY=sk-ant-...
//! export VIZBOX_GENERATOR_BIN=/usr/local/bin/vizbox-generator
//! cargo run -p vizbox-server
//! ```
//!
//! ## Endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /health` | Health check |
//! | `GET /stats` | Sandbox and deployment counts |
//! | `POST /visualizations` | Deploy a generator sandbox, or wait for its chart |
//! | `GET /deployments/:id` | Deployment event log |
//! | `GET /deployments/:id/events` | Live deployment events (SSE) |
//! | `GET /sandboxes` | Active sandboxes |
//! | `GET /sandboxes/:id/*path` | Proxy into a sandbox |
//! | `DELETE /sandboxes/:id` | Destroy a sandbox |

pub mod config;
pub mod http;
mod server;
mod types;

pub use config::VizboxConfig;
pub use server::VizboxServer;
pub use types::*;
