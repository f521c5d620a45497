//! Examroom · Assessment Coordination Backend
//!
//! - Axum HTTP + WebSocket API (lobby hub, attempt lifecycle, job polling)
//! - Optional oracle integration for question generation and open-answer
//!   grading (via environment variables)
//!
//! Important env variables:
//!   PORT          : u16 (default 3000)
//!   ORACLE_API_KEY    : enables the oracle if present
//!   ORACLE_BASE_URL    : default "https://api.openai.com/v1"
//!   ORACLE_FAST_MODEL  : default "gpt-4o-mini"
//!   ORACLE_STRONG_MODEL   : default "gpt-4o"
//!   EXAM_CONFIG_PATH  : path to TOML config (prompts + project bank)
//!   JOB_WORKERS    : background worker pool size (default 4)
//!   LOG_LEVEL    : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT      : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod config;
mod error;
mod grading;
mod store;
mod oracle;
mod lobby;
mod attempts;
mod jobs;
mod protocol;
mod state;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Build shared application state (stores, lobby registry, job tracker).
  let state = Arc::new(AppState::new());

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state.clone());

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "examroom", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!(target: "examroom", error = %e, "ctrl-c handler failed");
    return;
  }
  info!(target: "examroom", "shutdown signal received");
}
