//! # Configuration Settings
//!
//! Defines the configuration structure for the warden host.

use crate::errors::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Thirty-two days, the platform-wide default for lease TTLs.
const DEFAULT_LEASE_TTL_SECONDS: u64 = 32 * 24 * 60 * 60;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// Plugin runner configuration
    #[validate(nested)]
    pub plugins: PluginConfig,

    /// Lease and revocation configuration
    #[validate(nested)]
    pub leases: LeaseConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load every section from environment variables
    pub fn from_env() -> Self {
        Self {
            plugins: PluginConfig::from_env(),
            leases: LeaseConfig::from_env(),
            observability: ObservabilityConfig::from_env(),
        }
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(WardenError::from)?;
        self.validate_custom()
    }

    /// Checks that span more than one field
    fn validate_custom(&self) -> Result<()> {
        if self.leases.default_lease_ttl_seconds > self.leases.max_lease_ttl_seconds {
            return Err(WardenError::validation_field(
                "Default lease TTL cannot exceed the max lease TTL",
                "default_lease_ttl_seconds",
            ));
        }

        if self.leases.revocation_backoff_base_ms > self.leases.revocation_backoff_max_ms {
            return Err(WardenError::validation_field(
                "Revocation backoff base cannot exceed the backoff ceiling",
                "revocation_backoff_base_ms",
            ));
        }

        if !(0.0..=1.0).contains(&self.leases.revocation_jitter) {
            return Err(WardenError::validation_field(
                "Revocation jitter must be between 0.0 and 1.0",
                "revocation_jitter",
            ));
        }

        Ok(())
    }
}

/// Plugin runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PluginConfig {
    /// Directory every registered plugin executable must live in
    pub directory: PathBuf,

    /// How long a spawned plugin has to print its handshake line
    #[validate(range(
        min = 1,
        max = 300,
        message = "Handshake timeout must be between 1 and 300 seconds"
    ))]
    pub handshake_timeout_seconds: u64,

    /// Default deadline for calls crossing the plugin boundary
    #[validate(range(min = 1, max = 3600, message = "Call timeout must be between 1 and 3600 seconds"))]
    pub call_timeout_seconds: u64,

    /// Grace period between the graceful shutdown request and a forced kill
    #[validate(range(max = 300, message = "Shutdown grace must be at most 300 seconds"))]
    pub shutdown_grace_seconds: u64,

    /// Interval between plugin health checks (0 disables them)
    pub health_check_interval_seconds: u64,

    /// Version string reported to plugins through the system view
    #[validate(length(min = 1, message = "Platform version cannot be empty"))]
    pub platform_version: String,

    /// Serve plugin connections over mutual TLS with per-spawn certificates
    pub tls: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./plugins"),
            handshake_timeout_seconds: 10,
            call_timeout_seconds: 30,
            shutdown_grace_seconds: 2,
            health_check_interval_seconds: 30,
            platform_version: crate::VERSION.to_string(),
            tls: true,
        }
    }
}

impl PluginConfig {
    /// Handshake timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    /// Call timeout as Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Shutdown grace as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// Health check interval as Duration (None if disabled)
    pub fn health_check_interval(&self) -> Option<Duration> {
        if self.health_check_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.health_check_interval_seconds))
        }
    }

    /// Create PluginConfig from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            directory: std::env::var("WARDEN_PLUGIN_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or(defaults.directory),
            handshake_timeout_seconds: env_parse(
                "WARDEN_PLUGIN_HANDSHAKE_TIMEOUT_SECONDS",
                defaults.handshake_timeout_seconds,
            ),
            call_timeout_seconds: env_parse(
                "WARDEN_PLUGIN_CALL_TIMEOUT_SECONDS",
                defaults.call_timeout_seconds,
            ),
            shutdown_grace_seconds: env_parse(
                "WARDEN_PLUGIN_SHUTDOWN_GRACE_SECONDS",
                defaults.shutdown_grace_seconds,
            ),
            health_check_interval_seconds: env_parse(
                "WARDEN_PLUGIN_HEALTH_CHECK_INTERVAL_SECONDS",
                defaults.health_check_interval_seconds,
            ),
            platform_version: std::env::var("WARDEN_PLATFORM_VERSION")
                .unwrap_or(defaults.platform_version),
            tls: env_flag("WARDEN_PLUGIN_TLS", defaults.tls),
        }
    }
}

/// Lease lifecycle and revocation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LeaseConfig {
    /// Default TTL for mounts that do not override it
    #[validate(range(min = 1, message = "Default lease TTL must be at least 1 second"))]
    pub default_lease_ttl_seconds: u64,

    /// Maximum TTL for mounts that do not override it
    #[validate(range(min = 1, message = "Max lease TTL must be at least 1 second"))]
    pub max_lease_ttl_seconds: u64,

    /// Expiration scheduler tick
    #[validate(range(
        min = 10,
        max = 60000,
        message = "Tick interval must be between 10ms and 60s"
    ))]
    pub tick_interval_ms: u64,

    /// Revocation attempts before a lease is marked irrevocable
    #[validate(range(min = 1, max = 100, message = "Revocation attempts must be between 1 and 100"))]
    pub revocation_max_attempts: u32,

    /// First backoff delay after a failed revocation
    pub revocation_backoff_base_ms: u64,

    /// Ceiling for the revocation backoff delay
    pub revocation_backoff_max_ms: u64,

    /// Fraction of each backoff delay randomized (0.0 - 1.0)
    pub revocation_jitter: f64,

    /// Revocations running at the same time during one tick
    #[validate(range(min = 1, max = 1024, message = "Revocation concurrency must be between 1 and 1024"))]
    pub revocation_concurrency: usize,

    /// Deadline for a single revocation call into a backend
    #[validate(range(min = 1, max = 3600, message = "Revocation timeout must be between 1 and 3600 seconds"))]
    pub revocation_timeout_seconds: u64,

    /// Irrevocable leases listed without `force` before the listing is refused
    #[validate(range(min = 1, message = "Irrevocable list limit must be at least 1"))]
    pub max_irrevocable_leases_to_return: usize,

    /// Time in-flight revocations get to finish on shutdown
    pub revocation_grace_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl_seconds: DEFAULT_LEASE_TTL_SECONDS,
            max_lease_ttl_seconds: DEFAULT_LEASE_TTL_SECONDS,
            tick_interval_ms: 1000,
            revocation_max_attempts: 6,
            revocation_backoff_base_ms: 1000,
            revocation_backoff_max_ms: 5 * 60 * 1000,
            revocation_jitter: 0.2,
            revocation_concurrency: 16,
            revocation_timeout_seconds: 30,
            max_irrevocable_leases_to_return: 10_000,
            revocation_grace_seconds: 5,
        }
    }
}

impl LeaseConfig {
    /// Default lease TTL as Duration
    pub fn default_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lease_ttl_seconds)
    }

    /// Max lease TTL as Duration
    pub fn max_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.max_lease_ttl_seconds)
    }

    /// Scheduler tick as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Per-revocation deadline as Duration
    pub fn revocation_timeout(&self) -> Duration {
        Duration::from_secs(self.revocation_timeout_seconds)
    }

    /// Shutdown grace for in-flight revocations as Duration
    pub fn revocation_grace(&self) -> Duration {
        Duration::from_secs(self.revocation_grace_seconds)
    }

    /// Create LeaseConfig from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_lease_ttl_seconds: env_parse(
                "WARDEN_DEFAULT_LEASE_TTL_SECONDS",
                defaults.default_lease_ttl_seconds,
            ),
            max_lease_ttl_seconds: env_parse(
                "WARDEN_MAX_LEASE_TTL_SECONDS",
                defaults.max_lease_ttl_seconds,
            ),
            tick_interval_ms: env_parse("WARDEN_EXPIRATION_TICK_MS", defaults.tick_interval_ms),
            revocation_max_attempts: env_parse(
                "WARDEN_REVOCATION_MAX_ATTEMPTS",
                defaults.revocation_max_attempts,
            ),
            revocation_backoff_base_ms: env_parse(
                "WARDEN_REVOCATION_BACKOFF_BASE_MS",
                defaults.revocation_backoff_base_ms,
            ),
            revocation_backoff_max_ms: env_parse(
                "WARDEN_REVOCATION_BACKOFF_MAX_MS",
                defaults.revocation_backoff_max_ms,
            ),
            revocation_jitter: env_parse("WARDEN_REVOCATION_JITTER", defaults.revocation_jitter),
            revocation_concurrency: env_parse(
                "WARDEN_REVOCATION_CONCURRENCY",
                defaults.revocation_concurrency,
            ),
            revocation_timeout_seconds: env_parse(
                "WARDEN_REVOCATION_TIMEOUT_SECONDS",
                defaults.revocation_timeout_seconds,
            ),
            max_irrevocable_leases_to_return: env_parse(
                "WARDEN_MAX_IRREVOCABLE_LEASES_TO_RETURN",
                defaults.max_irrevocable_leases_to_return,
            ),
            revocation_grace_seconds: env_parse(
                "WARDEN_REVOCATION_GRACE_SECONDS",
                defaults.revocation_grace_seconds,
            ),
        }
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Service name attached to log output
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "warden".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9102,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if !self.enable_metrics || self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }

    /// Create ObservabilityConfig from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            service_name: std::env::var("WARDEN_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("WARDEN_LOG_LEVEL")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or(defaults.log_level),
            json_logging: env_flag("WARDEN_LOG_JSON", defaults.json_logging),
            enable_metrics: env_flag("WARDEN_ENABLE_METRICS", defaults.enable_metrics),
            metrics_port: env_parse("WARDEN_METRICS_PORT", defaults.metrics_port),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
