use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use warden::{
    config::AppConfig,
    observability::{init_observability, log_config_info},
    Core, APP_NAME, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let config = AppConfig::from_env();
    init_observability(&config.observability).await.context("initializing observability")?;
    config.validate().context("validating configuration")?;

    info!(app_name = APP_NAME, version = VERSION, "Starting warden");
    log_config_info(&config);

    let grace = config.leases.revocation_grace();
    let core = Arc::new(Core::new(config));

    let restored = core.restore().await.context("restoring leases")?;
    core.start().context("starting background tasks")?;
    info!(leases = restored, "Warden is running; press Ctrl-C to stop");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutdown signal received");
    if !core.shutdown(grace).await {
        error!("Some revocations did not finish before the grace period ended");
    }
    Ok(())
}
