//! # System View
//!
//! The restricted set of host services a backend may call. The host answers
//! through [`HostSystemView`]; a backend inside a plugin process reaches the
//! same trait through [`SystemViewClient`], which [`SystemViewServer`] serves
//! on the host end of the plugin connection.
//!
//! A backend can read its mount's settings, wrap data, look up identities and
//! generate passwords. It cannot reach arbitrary host state, and from inside a
//! plugin it cannot spawn or look up further plugins.

pub mod client;
pub mod host;
pub mod identity;
pub mod password;
pub mod server;
pub mod wrapping;

pub use client::SystemViewClient;
pub use host::{HostServices, HostSystemView};
pub use identity::{IdentityStore, MemoryIdentityStore};
pub use password::{CharsetRule, PasswordPolicies, PasswordPolicy};
pub use server::{SystemViewRegistry, SystemViewServer};
pub use wrapping::WrappingStore;

pub use crate::codec::messages::{Entity, Group, PluginEnvironment, ReplicationState, WrapInfo};

use crate::config::LeaseConfig;
use crate::context::CallContext;
use crate::errors::Result;
use crate::plugin::catalog::{PluginRunner, PluginType};
use crate::plugin::client::PluginClient;
use crate::types::SecretString;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Per-mount facts exposed to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSettings {
    pub default_lease_ttl: Duration,
    pub max_lease_ttl: Duration,
    pub tainted: bool,
    pub caching_disabled: bool,
    pub replication_state: ReplicationState,
    pub local_mount: bool,
    pub mlock_enabled: bool,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self::from_config(&LeaseConfig::default())
    }
}

impl MountSettings {
    pub fn from_config(config: &LeaseConfig) -> Self {
        Self {
            default_lease_ttl: config.default_lease_ttl(),
            max_lease_ttl: config.max_lease_ttl(),
            tainted: false,
            caching_disabled: false,
            replication_state: ReplicationState::Standalone,
            local_mount: false,
            mlock_enabled: false,
        }
    }
}

/// Host services available to one mount's backend.
///
/// Every method takes the context of the operation that needs the answer;
/// remote implementations bound their round trip by it.
#[async_trait]
pub trait SystemView: Send + Sync {
    async fn default_lease_ttl(&self, ctx: &CallContext) -> Result<Duration>;

    async fn max_lease_ttl(&self, ctx: &CallContext) -> Result<Duration>;

    /// Mount is being torn down or moved
    async fn tainted(&self, ctx: &CallContext) -> Result<bool>;

    async fn caching_disabled(&self, ctx: &CallContext) -> Result<bool>;

    async fn replication_state(&self, ctx: &CallContext) -> Result<ReplicationState>;

    async fn mlock_enabled(&self, ctx: &CallContext) -> Result<bool>;

    async fn local_mount(&self, ctx: &CallContext) -> Result<bool>;

    /// Store `data` behind a single-read token valid for `ttl`
    async fn response_wrap_data(
        &self,
        ctx: &CallContext,
        data: serde_json::Value,
        ttl: Duration,
        jwt: bool,
    ) -> Result<WrapInfo>;

    /// `None` when the entity does not exist
    async fn entity_info(&self, ctx: &CallContext, entity_id: &str) -> Result<Option<Entity>>;

    /// Empty when the entity does not exist
    async fn groups_for_entity(&self, ctx: &CallContext, entity_id: &str) -> Result<Vec<Group>>;

    async fn plugin_env(&self, ctx: &CallContext) -> Result<PluginEnvironment>;

    async fn generate_password_from_policy(&self, ctx: &CallContext, policy_name: &str) -> Result<SecretString>;

    async fn lookup_plugin(
        &self,
        ctx: &CallContext,
        plugin_type: PluginType,
        name: &str,
        version: &str,
    ) -> Result<PluginRunner>;

    async fn new_plugin_client(
        &self,
        ctx: &CallContext,
        plugin_type: PluginType,
        name: &str,
        version: &str,
    ) -> Result<Arc<PluginClient>>;
}
