//! Turning a lease back into a backend call.

use crate::backend::{CredentialBackend, DeleteUserRequest, Statements};
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::lease::Lease;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Undoes the credential behind a lease
#[async_trait]
pub trait Revoker: Send + Sync {
    async fn revoke(&self, ctx: &CallContext, lease: &Lease) -> Result<()>;
}

/// What a credential lease stores to be revocable later
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationPayload {
    pub username: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revocation_statements: Vec<String>,
}

impl RevocationPayload {
    pub fn from_lease(lease: &Lease) -> Result<Self> {
        serde_json::from_value(lease.secret.clone()).map_err(|e| {
            WardenError::invalid_request(format!("lease {} has no revocation data: {}", lease.id, e))
        })
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Revokes by deleting the user through the backend mounted at the lease's
/// mount path
#[derive(Default)]
pub struct BackendRevoker {
    backends: DashMap<String, Arc<dyn CredentialBackend>>,
}

impl std::fmt::Debug for BackendRevoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mounts: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("BackendRevoker").field("mounts", &mounts).finish()
    }
}

impl BackendRevoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mount_path: impl Into<String>, backend: Arc<dyn CredentialBackend>) {
        self.backends.insert(mount_path.into(), backend);
    }

    pub fn unregister(&self, mount_path: &str) -> Option<Arc<dyn CredentialBackend>> {
        self.backends.remove(mount_path).map(|(_, backend)| backend)
    }

    pub fn backend(&self, mount_path: &str) -> Option<Arc<dyn CredentialBackend>> {
        self.backends.get(mount_path).map(|b| b.clone())
    }
}

#[async_trait]
impl Revoker for BackendRevoker {
    async fn revoke(&self, ctx: &CallContext, lease: &Lease) -> Result<()> {
        let backend = self
            .backend(&lease.mount_path)
            .ok_or_else(|| WardenError::backend_unavailable(&lease.mount_path, "no backend is mounted"))?;
        let payload = RevocationPayload::from_lease(lease)?;
        debug!(lease_id = %lease.id, username = %payload.username, "Deleting user for lease");

        backend
            .delete_user(
                ctx,
                DeleteUserRequest {
                    username: payload.username,
                    statements: Statements::new(payload.revocation_statements),
                },
            )
            .await
    }
}
