//! Reference credential backend served as a warden plugin.
//!
//! Launched by the host, never by hand: without the host's magic cookie in
//! the environment it prints a notice and exits.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;
use warden::backend::MemDbFactory;
use warden::config::ObservabilityConfig;
use warden::observability::init_logging;
use warden::plugin::{serve, ServeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the handshake line; logs go to stderr for the host to forward
    let observability = ObservabilityConfig::from_env();
    if let Err(e) = init_logging(&observability) {
        eprintln!("Warning: {}", e);
    }

    match serve(ServeConfig::new(Arc::new(MemDbFactory))).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Plugin exited with error");
            ExitCode::FAILURE
        }
    }
}
