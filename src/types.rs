//! Shared value types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Credential material that must never reach a log line.
///
/// `Debug`, `Display` and `Serialize` all redact. The value is only reachable
/// through [`SecretString::expose_secret`], and the buffer is zeroed on drop.
/// Deserialization accepts the real value so secrets can arrive over the wire.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

const REDACTED: &str = "[REDACTED]";

impl SecretString {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the secret. Never log the result.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({})", REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString)
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_password_is_redacted() {
        let password = SecretString::new("A1a-generated-password");

        assert_eq!(format!("{:?}", password), "SecretString([REDACTED])");
        assert_eq!(password.to_string(), "[REDACTED]");
        assert_eq!(serde_json::to_string(&password).unwrap(), "\"[REDACTED]\"");
        assert_eq!(password.expose_secret(), "A1a-generated-password");
    }

    #[test]
    fn test_deserialize_keeps_value() {
        let password: SecretString = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(password.expose_secret(), "hunter2");
        assert_eq!(password.len(), 7);
        assert!(!password.is_empty());
        assert!(SecretString::default().is_empty());
    }

    #[test]
    fn test_redacted_inside_request_struct() {
        #[derive(Serialize)]
        struct Request {
            username: String,
            password: SecretString,
        }

        let json = serde_json::to_string(&Request {
            username: "v-app-123".into(),
            password: "s3cr3t".into(),
        })
        .unwrap();

        assert!(json.contains("v-app-123"));
        assert!(!json.contains("s3cr3t"));
    }
}
