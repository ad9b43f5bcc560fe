//! Request and response values for credential backends.

use crate::codec::messages as wire;
use crate::errors::{Result, WardenError};
use crate::types::SecretString;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of credential a backend mints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Password,
    /// The host keeps the private key and sends the public half
    RsaPrivateKey,
    ClientCertificate,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::Password => "password",
            CredentialType::RsaPrivateKey => "rsa_private_key",
            CredentialType::ClientCertificate => "client_certificate",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CredentialType> for wire::WireCredentialType {
    fn from(value: CredentialType) -> Self {
        match value {
            CredentialType::Password => wire::WireCredentialType::Password,
            CredentialType::RsaPrivateKey => wire::WireCredentialType::RsaPrivateKey,
            CredentialType::ClientCertificate => wire::WireCredentialType::ClientCertificate,
        }
    }
}

impl TryFrom<i32> for CredentialType {
    type Error = WardenError;

    fn try_from(value: i32) -> Result<Self> {
        match wire::WireCredentialType::try_from(value) {
            Ok(wire::WireCredentialType::Password) => Ok(CredentialType::Password),
            Ok(wire::WireCredentialType::RsaPrivateKey) => Ok(CredentialType::RsaPrivateKey),
            Ok(wire::WireCredentialType::ClientCertificate) => Ok(CredentialType::ClientCertificate),
            _ => Err(WardenError::invalid_request(format!("unknown credential type {}", value))),
        }
    }
}

/// Credential material; exactly one kind per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPayload {
    Password(SecretString),
    /// PEM or DER public key
    PublicKey(Vec<u8>),
    /// DER certificate
    ClientCertificate(Vec<u8>),
}

impl CredentialPayload {
    pub fn credential_type(&self) -> CredentialType {
        match self {
            CredentialPayload::Password(_) => CredentialType::Password,
            CredentialPayload::PublicKey(_) => CredentialType::RsaPrivateKey,
            CredentialPayload::ClientCertificate(_) => CredentialType::ClientCertificate,
        }
    }
}

/// Names that feed the username template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameMetadata {
    pub display_name: String,
    pub role_name: String,
}

/// Ordered commands in the backend's own statement language
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Statements {
    pub commands: Vec<String>,
}

impl Statements {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { commands: commands.into_iter().map(Into::into).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(|c| c.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeRequest {
    /// Backend-specific connection settings
    pub config: serde_json::Value,
    pub verify_connection: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitializeResponse {
    /// Normalized configuration for the caller to persist
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserRequest {
    pub username_config: UsernameMetadata,
    pub statements: Statements,
    pub rollback_statements: Statements,
    pub credential: CredentialPayload,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserResponse {
    pub username: String,
    /// Expiration actually applied, after capping
    pub expiration: Option<DateTime<Utc>>,
}

/// The single change an update applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Password(SecretString),
    PublicKey(Vec<u8>),
    Expiration(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateUserRequest {
    pub username: String,
    pub credential_type: CredentialType,
    pub change: UserChange,
    pub statements: Statements,
}

impl UpdateUserRequest {
    /// A credential change must match the user's credential type
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(WardenError::invalid_request("username is required"));
        }
        match (&self.change, self.credential_type) {
            (UserChange::Password(_), CredentialType::Password)
            | (UserChange::PublicKey(_), CredentialType::RsaPrivateKey)
            | (UserChange::Expiration(_), _) => Ok(()),
            (UserChange::Password(_), other) => Err(WardenError::invalid_request(format!(
                "password change is not valid for credential type {}",
                other
            ))),
            (UserChange::PublicKey(_), other) => Err(WardenError::invalid_request(format!(
                "public key change is not valid for credential type {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteUserRequest {
    pub username: String,
    pub statements: Statements,
}

// ---------------------------------------------------------------------------
// Wire conversions
// ---------------------------------------------------------------------------

fn to_unix(time: Option<DateTime<Utc>>) -> i64 {
    time.map(|t| t.timestamp()).unwrap_or(0)
}

fn from_unix(seconds: i64) -> Result<Option<DateTime<Utc>>> {
    if seconds == 0 {
        return Ok(None);
    }
    Utc.timestamp_opt(seconds, 0)
        .single()
        .map(Some)
        .ok_or_else(|| WardenError::invalid_request(format!("invalid timestamp {}", seconds)))
}

impl InitializeRequest {
    pub fn to_wire(&self) -> Result<wire::InitializeRequest> {
        Ok(wire::InitializeRequest {
            config_json: serde_json::to_string(&self.config)?,
            verify_connection: self.verify_connection,
        })
    }

    pub fn from_wire(message: wire::InitializeRequest) -> Result<Self> {
        let config = if message.config_json.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&message.config_json)
                .map_err(|e| WardenError::invalid_configuration(format!("config is not valid JSON: {}", e)))?
        };
        Ok(Self { config, verify_connection: message.verify_connection })
    }
}

impl NewUserRequest {
    pub fn to_wire(&self) -> wire::NewUserRequest {
        let credential = match &self.credential {
            CredentialPayload::Password(p) => wire::WireCredential::Password(p.expose_secret().to_string()),
            CredentialPayload::PublicKey(k) => wire::WireCredential::PublicKey(k.clone()),
            CredentialPayload::ClientCertificate(c) => wire::WireCredential::ClientCertificate(c.clone()),
        };
        wire::NewUserRequest {
            username_config: Some(wire::UsernameConfig {
                display_name: self.username_config.display_name.clone(),
                role_name: self.username_config.role_name.clone(),
            }),
            statements: self.statements.commands.clone(),
            rollback_statements: self.rollback_statements.commands.clone(),
            credential_type: wire::WireCredentialType::from(self.credential.credential_type()) as i32,
            expiration_unix: to_unix(self.expiration),
            credential: Some(credential),
        }
    }

    /// Rejects a request without credential material or whose material does
    /// not match its declared type
    pub fn from_wire(message: wire::NewUserRequest) -> Result<Self> {
        let declared = CredentialType::try_from(message.credential_type)?;
        let credential = match message.credential {
            Some(wire::WireCredential::Password(p)) => CredentialPayload::Password(SecretString::new(p)),
            Some(wire::WireCredential::PublicKey(k)) => CredentialPayload::PublicKey(k),
            Some(wire::WireCredential::ClientCertificate(c)) => CredentialPayload::ClientCertificate(c),
            None => return Err(WardenError::invalid_request("no credential supplied")),
        };
        if credential.credential_type() != declared {
            return Err(WardenError::invalid_request(format!(
                "credential does not match declared type {}",
                declared
            )));
        }

        let username_config = message
            .username_config
            .map(|c| UsernameMetadata { display_name: c.display_name, role_name: c.role_name })
            .unwrap_or_default();

        Ok(Self {
            username_config,
            statements: Statements::new(message.statements),
            rollback_statements: Statements::new(message.rollback_statements),
            credential,
            expiration: from_unix(message.expiration_unix)?,
        })
    }
}

impl NewUserResponse {
    pub fn to_wire(&self) -> wire::NewUserReply {
        wire::NewUserReply { username: self.username.clone(), expiration_unix: to_unix(self.expiration) }
    }

    pub fn from_wire(message: wire::NewUserReply) -> Result<Self> {
        Ok(Self { username: message.username, expiration: from_unix(message.expiration_unix)? })
    }
}

impl UpdateUserRequest {
    pub fn to_wire(&self) -> wire::UpdateUserRequest {
        let change = match &self.change {
            UserChange::Password(p) => wire::WireUserChange::Password(p.expose_secret().to_string()),
            UserChange::PublicKey(k) => wire::WireUserChange::PublicKey(k.clone()),
            UserChange::Expiration(t) => wire::WireUserChange::Expiration(t.timestamp()),
        };
        wire::UpdateUserRequest {
            username: self.username.clone(),
            credential_type: wire::WireCredentialType::from(self.credential_type) as i32,
            statements: self.statements.commands.clone(),
            change: Some(change),
        }
    }

    pub fn from_wire(message: wire::UpdateUserRequest) -> Result<Self> {
        let change = match message.change {
            Some(wire::WireUserChange::Password(p)) => UserChange::Password(SecretString::new(p)),
            Some(wire::WireUserChange::PublicKey(k)) => UserChange::PublicKey(k),
            Some(wire::WireUserChange::Expiration(seconds)) => UserChange::Expiration(
                from_unix(seconds)?.ok_or_else(|| WardenError::invalid_request("expiration is required"))?,
            ),
            None => return Err(WardenError::invalid_request("no change supplied")),
        };
        let request = Self {
            username: message.username,
            credential_type: CredentialType::try_from(message.credential_type)?,
            change,
            statements: Statements::new(message.statements),
        };
        request.validate()?;
        Ok(request)
    }
}

impl DeleteUserRequest {
    pub fn to_wire(&self) -> wire::DeleteUserRequest {
        wire::DeleteUserRequest {
            username: self.username.clone(),
            statements: self.statements.commands.clone(),
        }
    }

    pub fn from_wire(message: wire::DeleteUserRequest) -> Self {
        Self { username: message.username, statements: Statements::new(message.statements) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user() -> NewUserRequest {
        NewUserRequest {
            username_config: UsernameMetadata { display_name: "token".into(), role_name: "ro".into() },
            statements: Statements::new(["CREATE USER {{name}} PASSWORD {{password}}"]),
            rollback_statements: Statements::new(["DROP USER {{name}}"]),
            credential: CredentialPayload::Password("p@ss".into()),
            expiration: Some(Utc.timestamp_opt(1_900_000_000, 0).unwrap()),
        }
    }

    #[test]
    fn test_new_user_wire_conversion() {
        let request = new_user();
        let rebuilt = NewUserRequest::from_wire(request.to_wire()).unwrap();
        assert_eq!(rebuilt, request);
    }

    #[test]
    fn test_new_user_requires_matching_credential() {
        let mut message = new_user().to_wire();
        message.credential = None;
        assert!(matches!(NewUserRequest::from_wire(message), Err(WardenError::InvalidRequest { .. })));

        let mut message = new_user().to_wire();
        message.credential_type = wire::WireCredentialType::ClientCertificate as i32;
        assert!(matches!(NewUserRequest::from_wire(message), Err(WardenError::InvalidRequest { .. })));

        let mut message = new_user().to_wire();
        message.credential_type = 0;
        assert!(NewUserRequest::from_wire(message).is_err());
    }

    #[test]
    fn test_update_type_mismatch_is_invalid_request() {
        let request = UpdateUserRequest {
            username: "v-token-ro-1".into(),
            credential_type: CredentialType::ClientCertificate,
            change: UserChange::Password("new".into()),
            statements: Statements::default(),
        };
        assert!(matches!(request.validate(), Err(WardenError::InvalidRequest { .. })));

        let expiry = UpdateUserRequest {
            change: UserChange::Expiration(Utc::now()),
            ..request.clone()
        };
        assert!(expiry.validate().is_ok());

        let key = UpdateUserRequest {
            credential_type: CredentialType::RsaPrivateKey,
            change: UserChange::PublicKey(b"ssh-rsa AAAA".to_vec()),
            ..request
        };
        let rebuilt = UpdateUserRequest::from_wire(key.to_wire()).unwrap();
        assert_eq!(rebuilt, key);
    }

    #[test]
    fn test_statements_blank_is_empty() {
        assert!(Statements::new(["", "  "]).is_empty());
        assert!(!Statements::new(["DROP USER x"]).is_empty());
    }
}
