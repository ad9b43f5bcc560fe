//! Response wrapping: single-read, TTL-bounded references to data.

use super::WrapInfo;
use crate::clock::Clock;
use crate::errors::{Result, WardenError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const FORMAT_OPAQUE: &str = "opaque";
pub const FORMAT_JWT: &str = "jwt";

const TOKEN_PREFIX: &str = "wt.";

/// Claims carried by a JWT-format wrapping token
#[derive(Debug, Serialize, Deserialize, Clone)]
struct WrapClaims {
    jti: String,
    accessor: String,
    path: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
struct Wrapped {
    data: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Host-side store of wrapped responses
pub struct WrappingStore {
    entries: DashMap<String, Wrapped>,
    clock: Arc<dyn Clock>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for WrappingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingStore").field("entries", &self.entries.len()).finish()
    }
}

impl WrappingStore {
    /// Signing key is generated per process; tokens do not survive a restart
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);

        // Expiry is checked against our own clock
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        Self {
            entries: DashMap::new(),
            clock,
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
            validation,
        }
    }

    pub fn wrap(&self, data: serde_json::Value, ttl: Duration, creation_path: &str, jwt: bool) -> Result<WrapInfo> {
        if ttl.is_zero() {
            return Err(WardenError::invalid_request("wrapping TTL must be greater than zero"));
        }
        let ttl_delta = chrono::Duration::from_std(ttl)
            .map_err(|_| WardenError::invalid_request("wrapping TTL is too large"))?;

        let now = self.clock.now();
        let expires_at = now + ttl_delta;
        let id = Uuid::new_v4().simple().to_string();
        let accessor = Uuid::new_v4().to_string();

        let (token, format) = if jwt {
            let claims = WrapClaims {
                jti: id.clone(),
                accessor: accessor.clone(),
                path: creation_path.to_string(),
                iat: now.timestamp(),
                exp: expires_at.timestamp(),
            };
            let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
                .map_err(|e| WardenError::internal(format!("failed to sign wrapping token: {}", e)))?;
            (token, FORMAT_JWT)
        } else {
            (format!("{}{}", TOKEN_PREFIX, id), FORMAT_OPAQUE)
        };

        self.entries.insert(id, Wrapped { data, expires_at });
        debug!(path = %creation_path, format = format, ttl_seconds = ttl.as_secs(), "Wrapped response");

        Ok(WrapInfo {
            token,
            accessor,
            ttl_seconds: ttl.as_secs() as i64,
            creation_time: now.to_rfc3339(),
            creation_path: creation_path.to_string(),
            format: format.to_string(),
        })
    }

    /// Return the wrapped data and invalidate the token
    pub fn unwrap(&self, token: &str) -> Result<serde_json::Value> {
        let id = self.token_id(token)?;
        let invalid = || WardenError::invalid_request("wrapping token is invalid or expired");

        let (_, wrapped) = self.entries.remove(&id).ok_or_else(invalid)?;
        if wrapped.expires_at <= self.clock.now() {
            return Err(invalid());
        }
        Ok(wrapped.data)
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, wrapped| wrapped.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn token_id(&self, token: &str) -> Result<String> {
        if let Some(id) = token.strip_prefix(TOKEN_PREFIX) {
            return Ok(id.to_string());
        }
        decode::<WrapClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.jti)
            .map_err(|_| WardenError::invalid_request("wrapping token is invalid or expired"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store() -> (WrappingStore, ManualClock) {
        let clock = ManualClock::default();
        (WrappingStore::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_wrap_is_single_read() {
        let (store, _) = store();
        let info = store.wrap(json!({"password": "p"}), Duration::from_secs(60), "database/creds/ro", false).unwrap();
        assert_eq!(info.format, FORMAT_OPAQUE);
        assert_eq!(info.ttl_seconds, 60);

        assert_eq!(store.unwrap(&info.token).unwrap(), json!({"password": "p"}));
        assert!(store.unwrap(&info.token).is_err());
    }

    #[test]
    fn test_wrapped_data_expires() {
        let (store, clock) = store();
        let info = store.wrap(json!(1), Duration::from_secs(30), "kv/", false).unwrap();
        clock.advance(Duration::from_secs(31));
        assert!(store.unwrap(&info.token).is_err());
    }

    #[test]
    fn test_jwt_format() {
        let (store, _) = store();
        let info = store.wrap(json!("x"), Duration::from_secs(30), "kv/", true).unwrap();
        assert_eq!(info.format, FORMAT_JWT);
        assert_eq!(info.token.split('.').count(), 3);
        assert_eq!(store.unwrap(&info.token).unwrap(), json!("x"));
    }

    #[test]
    fn test_foreign_tokens_rejected() {
        let (store, _) = store();
        let (other, _) = self::store();
        let info = other.wrap(json!(1), Duration::from_secs(30), "kv/", true).unwrap();
        assert!(store.unwrap(&info.token).is_err());
        assert!(store.unwrap("garbage").is_err());
    }

    #[test]
    fn test_zero_ttl_and_purge() {
        let (store, clock) = store();
        assert!(store.wrap(json!(1), Duration::ZERO, "kv/", false).is_err());

        store.wrap(json!(1), Duration::from_secs(10), "kv/", false).unwrap();
        store.wrap(json!(2), Duration::from_secs(100), "kv/", false).unwrap();
        clock.advance(Duration::from_secs(20));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
