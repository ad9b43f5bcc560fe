//! # Error Types
//!
//! Comprehensive error types for the warden core using `thiserror`.

/// Custom result type for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Fixed message returned when a plugin process asks for a host-only capability.
pub const NOT_PERMITTED_IN_PLUGIN: &str = "not permitted from within a plugin backend";

/// Main error type for the warden core
#[derive(thiserror::Error, Debug)]
pub enum WardenError {
    /// Handshake with a plugin process failed (cookie, protocol, malformed line)
    #[error("Plugin handshake failed: {message}")]
    Handshake { message: String },

    /// No protocol version is supported by both host and plugin
    #[error("Unsupported plugin version: host offered {offered:?}, plugin supports {supported:?}")]
    UnsupportedPluginVersion { offered: Vec<u32>, supported: Vec<u32> },

    /// The RPC connection to a plugin broke or could not be established
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A plugin backend cannot be reached and has been torn down
    #[error("Backend unavailable: {plugin}: {reason}")]
    BackendUnavailable { plugin: String, reason: String },

    /// A host-only operation was attempted from within a plugin process
    #[error("{}", NOT_PERMITTED_IN_PLUGIN)]
    NotPermittedInPlugin,

    /// Backend configuration rejected during initialization
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// The live connectivity check requested during initialization failed
    #[error("Connection verification failed: {message}")]
    ConnectionVerificationFailed { message: String },

    /// A request object is malformed (e.g. mismatched credential type)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Business failure reported by a backend implementation
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Failure reported by a remote implementation with an unrecognized kind
    #[error("Remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    /// Lease does not exist or is no longer renewable/revocable
    #[error("Lease not found: {lease_id}")]
    LeaseNotFound { lease_id: String },

    /// Lease was already revoked
    #[error("Lease already revoked: {lease_id}")]
    LeaseAlreadyRevoked { lease_id: String },

    /// Lease exists but cannot be renewed
    #[error("Lease '{lease_id}' cannot be renewed: {reason}")]
    LeaseNotRenewable { lease_id: String, reason: String },

    /// Named password policy does not exist
    #[error("Password policy not found: {name}")]
    PolicyNotFound { name: String },

    /// Password policy could not produce a value
    #[error("Password generation failed: {message}")]
    GenerationFailed { message: String },

    /// Plugin is not registered in the catalog
    #[error("Plugin not found: {plugin_type} plugin '{name}'")]
    PluginNotFound { name: String, plugin_type: String },

    /// Wire encoding/decoding errors
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Errors reported by the physical storage collaborator
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// Timeout errors
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// The caller cancelled the operation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WardenError {
    /// Create a handshake error
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::Handshake { message: message.into() }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a backend-unavailable error
    pub fn backend_unavailable<P: Into<String>, R: Into<String>>(plugin: P, reason: R) -> Self {
        Self::BackendUnavailable { plugin: plugin.into(), reason: reason.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfiguration { message: message.into() }
    }

    /// Create a connection verification error
    pub fn connection_verification_failed<S: Into<String>>(message: S) -> Self {
        Self::ConnectionVerificationFailed { message: message.into() }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Create a backend business error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend { message: message.into() }
    }

    /// Create a lease-not-found error
    pub fn lease_not_found<S: Into<String>>(lease_id: S) -> Self {
        Self::LeaseNotFound { lease_id: lease_id.into() }
    }

    /// Create a lease-already-revoked error
    pub fn lease_already_revoked<S: Into<String>>(lease_id: S) -> Self {
        Self::LeaseAlreadyRevoked { lease_id: lease_id.into() }
    }

    /// Create a lease-not-renewable error
    pub fn lease_not_renewable<S: Into<String>, R: Into<String>>(lease_id: S, reason: R) -> Self {
        Self::LeaseNotRenewable { lease_id: lease_id.into(), reason: reason.into() }
    }

    /// Create a policy-not-found error
    pub fn policy_not_found<S: Into<String>>(name: S) -> Self {
        Self::PolicyNotFound { name: name.into() }
    }

    /// Create a generation-failed error
    pub fn generation_failed<S: Into<String>>(message: S) -> Self {
        Self::GenerationFailed { message: message.into() }
    }

    /// Create a plugin-not-found error
    pub fn plugin_not_found<N: Into<String>, T: ToString>(name: N, plugin_type: T) -> Self {
        Self::PluginNotFound { name: name.into(), plugin_type: plugin_type.to_string() }
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(message: S) -> Self {
        Self::Codec { message: message.into() }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration_ms: u64) -> Self {
        Self::Timeout { operation: operation.into(), duration_ms }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the failure happened in the transport rather than the remote
    /// implementation. Transport failures are fatal to the plugin client.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WardenError::Handshake { .. }
                | WardenError::UnsupportedPluginVersion { .. }
                | WardenError::Transport { .. }
                | WardenError::BackendUnavailable { .. }
                | WardenError::Timeout { .. }
                | WardenError::Cancelled { .. }
        )
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WardenError::Transport { .. }
                | WardenError::BackendUnavailable { .. }
                | WardenError::Timeout { .. }
                | WardenError::Storage { .. }
                | WardenError::Io { .. }
                | WardenError::Backend { .. }
                | WardenError::Remote { .. }
        )
    }

    /// Stable kind string used when the error crosses the plugin boundary.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            WardenError::Handshake { .. } => "handshake",
            WardenError::UnsupportedPluginVersion { .. } => "unsupported_plugin_version",
            WardenError::Transport { .. } => "transport",
            WardenError::BackendUnavailable { .. } => "backend_unavailable",
            WardenError::NotPermittedInPlugin => "not_permitted_in_plugin",
            WardenError::InvalidConfiguration { .. } => "invalid_configuration",
            WardenError::ConnectionVerificationFailed { .. } => "connection_verification_failed",
            WardenError::InvalidRequest { .. } => "invalid_request",
            WardenError::Backend { .. } => "backend",
            WardenError::Remote { .. } => "remote",
            WardenError::LeaseNotFound { .. } => "lease_not_found",
            WardenError::LeaseAlreadyRevoked { .. } => "lease_already_revoked",
            WardenError::LeaseNotRenewable { .. } => "lease_not_renewable",
            WardenError::PolicyNotFound { .. } => "policy_not_found",
            WardenError::GenerationFailed { .. } => "generation_failed",
            WardenError::PluginNotFound { .. } => "plugin_not_found",
            WardenError::Codec { .. } => "codec",
            WardenError::Storage { .. } => "storage",
            WardenError::Config { .. } => "config",
            WardenError::Validation { .. } => "validation",
            WardenError::Timeout { .. } => "timeout",
            WardenError::Cancelled { .. } => "cancelled",
            WardenError::Io { .. } => "io",
            WardenError::Serialization { .. } => "serialization",
            WardenError::Internal { .. } => "internal",
        }
    }

    /// Message carried next to [`wire_kind`](Self::wire_kind). For variants
    /// that wrap a single identifier only the identifier is sent.
    pub fn wire_message(&self) -> String {
        match self {
            WardenError::Handshake { message }
            | WardenError::Transport { message }
            | WardenError::InvalidConfiguration { message }
            | WardenError::ConnectionVerificationFailed { message }
            | WardenError::InvalidRequest { message }
            | WardenError::Backend { message }
            | WardenError::Remote { message, .. }
            | WardenError::GenerationFailed { message }
            | WardenError::Codec { message }
            | WardenError::Storage { message }
            | WardenError::Config { message }
            | WardenError::Validation { message, .. }
            | WardenError::Internal { message } => message.clone(),
            WardenError::LeaseNotFound { lease_id }
            | WardenError::LeaseAlreadyRevoked { lease_id } => lease_id.clone(),
            WardenError::PolicyNotFound { name } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild a typed error from its wire form. Business and capability
    /// errors keep their variant; anything else becomes [`WardenError::Remote`].
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "not_permitted_in_plugin" => WardenError::NotPermittedInPlugin,
            "invalid_configuration" => WardenError::InvalidConfiguration { message },
            "connection_verification_failed" => {
                WardenError::ConnectionVerificationFailed { message }
            }
            "invalid_request" => WardenError::InvalidRequest { message },
            "backend" => WardenError::Backend { message },
            "lease_not_found" => WardenError::LeaseNotFound { lease_id: message },
            "lease_already_revoked" => WardenError::LeaseAlreadyRevoked { lease_id: message },
            "policy_not_found" => WardenError::PolicyNotFound { name: message },
            "generation_failed" => WardenError::GenerationFailed { message },
            "codec" => WardenError::Codec { message },
            "validation" => WardenError::Validation { message, field: None },
            other => WardenError::Remote { kind: other.to_string(), message },
        }
    }
}

// Error conversions for common external error types
impl From<std::io::Error> for WardenError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<prost::DecodeError> for WardenError {
    fn from(error: prost::DecodeError) -> Self {
        Self::codec(format!("protobuf decode failed: {}", error))
    }
}

impl From<validator::ValidationErrors> for WardenError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = WardenError::config("Test configuration error");
        assert!(matches!(error, WardenError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_not_permitted_message_is_fixed() {
        assert_eq!(
            WardenError::NotPermittedInPlugin.to_string(),
            "not permitted from within a plugin backend"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(WardenError::transport("broken pipe").is_transport());
        assert!(WardenError::handshake("cookie mismatch").is_transport());
        assert!(WardenError::timeout("backend.new_user", 100).is_transport());
        assert!(!WardenError::backend("duplicate user").is_transport());
        assert!(!WardenError::invalid_configuration("missing url").is_transport());
        assert!(!WardenError::NotPermittedInPlugin.is_retryable());
    }

    #[test]
    fn test_wire_roundtrip_keeps_business_variants() {
        let cases = vec![
            WardenError::invalid_configuration("connection_url is required"),
            WardenError::connection_verification_failed("refused"),
            WardenError::invalid_request("credential type mismatch"),
            WardenError::lease_not_found("db/creds/abc"),
            WardenError::policy_not_found("strict"),
            WardenError::NotPermittedInPlugin,
        ];

        for error in cases {
            let rebuilt = WardenError::from_wire(error.wire_kind(), error.wire_message());
            assert_eq!(rebuilt.wire_kind(), error.wire_kind());
            assert_eq!(rebuilt.to_string(), error.to_string());
        }
    }

    #[test]
    fn test_unknown_wire_kind_becomes_remote() {
        let rebuilt = WardenError::from_wire("timeout", "slow".to_string());
        assert!(matches!(rebuilt, WardenError::Remote { .. }));
        assert!(!rebuilt.is_transport());
    }

    #[test]
    fn test_error_conversions() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let warden_error: WardenError = io_error.into();
        assert!(matches!(warden_error, WardenError::Io { .. }));

        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let warden_error: WardenError = json_error.into();
        assert!(matches!(warden_error, WardenError::Serialization { .. }));
    }
}
