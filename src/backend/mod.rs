//! # Credential Backends
//!
//! The contract every credential-minting backend fulfils, whether it runs in
//! the host process or behind a plugin connection. [`rpc::BackendClient`] and
//! [`rpc::BackendServer`] carry the same trait across the process boundary.

pub mod memdb;
pub mod registry;
pub mod rpc;
pub mod types;
pub mod username;

pub use memdb::{MemDb, MemDbFactory};
pub use registry::ConnectionRegistry;
pub use rpc::{BackendClient, BackendServer};
pub use types::{
    CredentialPayload, CredentialType, DeleteUserRequest, InitializeRequest, InitializeResponse,
    NewUserRequest, NewUserResponse, Statements, UpdateUserRequest, UserChange, UsernameMetadata,
};
pub use username::UsernameTemplate;

use crate::context::CallContext;
use crate::errors::Result;
use crate::sysview::SystemView;
use async_trait::async_trait;
use std::sync::Arc;

/// A system that mints and revokes short-lived credentials.
///
/// Errors from the business methods cross the plugin boundary verbatim.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Validate and store connection settings, optionally checking that the
    /// target is reachable. Until this succeeds the backend is unusable.
    async fn initialize(&self, ctx: &CallContext, request: InitializeRequest) -> Result<InitializeResponse>;

    /// Create a user. On partial failure the rollback statements run and the
    /// original error is returned. Each call generates a fresh username.
    async fn new_user(&self, ctx: &CallContext, request: NewUserRequest) -> Result<NewUserResponse>;

    /// Apply exactly one change to an existing user
    async fn update_user(&self, ctx: &CallContext, request: UpdateUserRequest) -> Result<()>;

    /// Remove a user. A user that does not exist is already deleted.
    async fn delete_user(&self, ctx: &CallContext, request: DeleteUserRequest) -> Result<()>;

    /// Short identifier such as `memdb`
    async fn backend_type(&self, ctx: &CallContext) -> Result<String>;

    /// Release connections. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Creates backend instances inside a plugin process, one per mount
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, mount_id: &str, system_view: Arc<dyn SystemView>) -> Result<Arc<dyn CredentialBackend>>;
}
