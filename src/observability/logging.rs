//! # Structured Logging
//!
//! Subscriber setup and span macros built on the tracing ecosystem.
//!
//! Plugin processes log to stderr only: their stdout carries the handshake
//! line and must stay clean. The host forwards each stderr line of a plugin
//! into its own subscriber under the `warden::plugin::stderr` target.

use crate::config::ObservabilityConfig;
use crate::errors::{Result, WardenError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Create a tracing span for work done on behalf of one plugin.
///
/// ```rust,ignore
/// let span = plugin_span!("spawn", "memdb");
/// let span = plugin_span!("dispense", "memdb", mount = "database/");
/// ```
#[macro_export]
macro_rules! plugin_span {
    ($operation:expr, $plugin:expr) => {
        tracing::info_span!(
            "plugin_operation",
            operation = %$operation,
            plugin = %$plugin,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $plugin:expr, $($field:tt)*) => {
        tracing::info_span!(
            "plugin_operation",
            operation = %$operation,
            plugin = %$plugin,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for lease lifecycle operations.
///
/// ```rust,ignore
/// let span = lease_span!("revoke", lease.id);
/// let span = lease_span!("revoke", lease.id, attempt = 3);
/// ```
#[macro_export]
macro_rules! lease_span {
    ($operation:expr, $lease_id:expr) => {
        tracing::debug_span!(
            "lease_operation",
            operation = %$operation,
            lease_id = %$lease_id
        )
    };
    ($operation:expr, $lease_id:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "lease_operation",
            operation = %$operation,
            lease_id = %$lease_id,
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// Returns an error only when the filter directive is invalid; a subscriber
/// that is already installed (tests, embedding hosts) is left in place.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).map_err(|e| {
        WardenError::config(format!("Invalid log level '{}': {}", config.log_level, e))
    })?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }

    Ok(())
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        plugin_directory = %config.plugins.directory.display(),
        handshake_timeout_secs = config.plugins.handshake_timeout_seconds,
        call_timeout_secs = config.plugins.call_timeout_seconds,
        plugin_tls = config.plugins.tls,
        default_lease_ttl_secs = config.leases.default_lease_ttl_seconds,
        max_lease_ttl_secs = config.leases.max_lease_ttl_seconds,
        revocation_max_attempts = config.leases.revocation_max_attempts,
        metrics_enabled = %config.observability.enable_metrics,
        "Warden configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = plugin_span!("spawn", "memdb");
        let _span = plugin_span!("dispense", "memdb", mount = "database/");
        let _span = lease_span!("revoke", "database/creds/abc");
        let _span = lease_span!("revoke", "database/creds/abc", attempt = 2);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config =
            ObservabilityConfig { log_level: "warden=notalevel".to_string(), ..Default::default() };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_log_config_info() {
        let config = crate::config::AppConfig::default();

        // This should not panic
        log_config_info(&config);
    }
}
