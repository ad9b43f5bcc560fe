//! Lease records.

use crate::errors::{Result, WardenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Lease identifier: the issuing path followed by a random suffix, e.g.
/// `database/creds/readonly/6b0c2e1a...`. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(String);

impl LeaseId {
    /// Fresh id under `path`
    pub fn generate(path: &str) -> Self {
        let path = path.trim_matches('/');
        Self(format!("{}/{}", path, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id lives under `prefix`, compared on path segments
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        prefix.is_empty()
            || self.0 == prefix
            || (self.0.starts_with(prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'/'))
    }
}

impl FromStr for LeaseId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || !s.contains('/') || s.starts_with('/') || s.chars().any(char::is_whitespace) {
            return Err(WardenError::validation_field(format!("invalid lease id '{}'", s), "lease_id"));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LeaseId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stored lifecycle state. A revoked lease is deleted, so it has no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Active,
    /// Revocation failed and is being retried
    PendingRevocation,
    /// Retries exhausted; kept for operators
    Irrevocable,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Active => "active",
            LeaseState::PendingRevocation => "pending_revocation",
            LeaseState::Irrevocable => "irrevocable",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub mount_accessor: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    pub issue_time: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal_time: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
    pub renewable: bool,
    /// Backend-specific data needed to revoke the credential
    #[serde(default)]
    pub secret: serde_json::Value,
    pub state: LeaseState,
    #[serde(default)]
    pub revocation_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revocation_error: Option<String>,
    /// When the next revocation attempt is due
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expire_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// When the expiration engine should next look at this lease, if ever
    pub fn wake_time(&self) -> Option<DateTime<Utc>> {
        match self.state {
            LeaseState::Active => Some(self.expire_time),
            LeaseState::PendingRevocation => Some(self.next_attempt.unwrap_or(self.expire_time)),
            LeaseState::Irrevocable => None,
        }
    }
}

/// What the caller knows when a credential has been issued
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRequest {
    pub mount_path: String,
    pub mount_accessor: String,
    /// Path the lease id is generated under; the mount path when empty
    pub path: String,
    pub client_token: Option<String>,
    pub ttl: Duration,
    pub renewable: bool,
    pub secret: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = LeaseId::generate("database/creds/ro/");
        let b = LeaseId::generate("database/creds/ro");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("database/creds/ro/"));
        assert!(a.has_prefix("database/"));
        assert!(a.has_prefix("database/creds"));
        assert!(!a.has_prefix("data"));
        assert!(a.has_prefix(""));
    }

    #[test]
    fn test_parse() {
        assert!("database/creds/abc".parse::<LeaseId>().is_ok());
        assert!("".parse::<LeaseId>().is_err());
        assert!("no-slash".parse::<LeaseId>().is_err());
        assert!("/leading".parse::<LeaseId>().is_err());
        assert!("has space/x".parse::<LeaseId>().is_err());
    }

    #[test]
    fn test_wake_time_by_state() {
        let now = Utc::now();
        let mut lease = Lease {
            id: LeaseId::generate("db"),
            mount_accessor: "acc".into(),
            mount_path: "db/".into(),
            client_token: None,
            issue_time: now,
            expire_time: now + chrono::Duration::seconds(60),
            last_renewal_time: None,
            ttl_seconds: 60,
            renewable: true,
            secret: serde_json::Value::Null,
            state: LeaseState::Active,
            revocation_attempts: 0,
            last_revocation_error: None,
            next_attempt: None,
        };
        assert_eq!(lease.wake_time(), Some(lease.expire_time));
        assert_eq!(lease.remaining(now), Duration::from_secs(60));

        lease.state = LeaseState::PendingRevocation;
        lease.next_attempt = Some(now + chrono::Duration::seconds(5));
        assert_eq!(lease.wake_time(), lease.next_attempt);

        lease.state = LeaseState::Irrevocable;
        assert_eq!(lease.wake_time(), None);
        assert_eq!(lease.remaining(now + chrono::Duration::seconds(120)), Duration::ZERO);
    }
}
