//! Host implementation of [`SystemView`] for one mount.

use super::identity::{IdentityStore, MemoryIdentityStore};
use super::password::PasswordPolicies;
use super::wrapping::WrappingStore;
use super::{Entity, Group, MountSettings, PluginEnvironment, ReplicationState, SystemView, WrapInfo};
use crate::clock::{Clock, SystemClock};
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::plugin::catalog::{PluginCatalog, PluginRunner, PluginType};
use crate::plugin::client::PluginClient;
use crate::plugin::process_table::ProcessTable;
use crate::types::SecretString;
use async_trait::async_trait;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::debug;

struct PluginAccess {
    catalog: Arc<PluginCatalog>,
    processes: Weak<ProcessTable>,
}

/// State shared by every mount's system view
pub struct HostServices {
    pub wrapping: Arc<WrappingStore>,
    pub passwords: Arc<PasswordPolicies>,
    pub identity: Arc<dyn IdentityStore>,
    pub platform_version: String,
    plugins: Option<PluginAccess>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("platform_version", &self.platform_version)
            .field("plugins", &self.plugins.is_some())
            .finish()
    }
}

impl HostServices {
    pub fn new(clock: Arc<dyn Clock>, platform_version: impl Into<String>) -> Self {
        Self {
            wrapping: Arc::new(WrappingStore::new(clock)),
            passwords: Arc::new(PasswordPolicies::new()),
            identity: Arc::new(MemoryIdentityStore::new()),
            platform_version: platform_version.into(),
            plugins: None,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityStore>) -> Self {
        self.identity = identity;
        self
    }

    /// Let in-process backends look up and start plugins
    pub fn with_plugins(mut self, catalog: Arc<PluginCatalog>, processes: &Arc<ProcessTable>) -> Self {
        self.plugins = Some(PluginAccess { catalog, processes: Arc::downgrade(processes) });
        self
    }
}

pub struct HostSystemView {
    mount_path: String,
    plugin_version: String,
    settings: RwLock<MountSettings>,
    services: Arc<HostServices>,
}

impl std::fmt::Debug for HostSystemView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSystemView")
            .field("mount_path", &self.mount_path)
            .field("settings", &self.settings())
            .finish()
    }
}

impl HostSystemView {
    pub fn new(mount_path: impl Into<String>, settings: MountSettings, services: Arc<HostServices>) -> Self {
        Self {
            mount_path: mount_path.into(),
            plugin_version: String::new(),
            settings: RwLock::new(settings),
            services,
        }
    }

    /// View with its own services and no plugin access
    pub fn standalone(mount_path: impl Into<String>, settings: MountSettings) -> Self {
        let services = HostServices::new(Arc::new(SystemClock), crate::VERSION);
        Self::new(mount_path, settings, Arc::new(services))
    }

    pub fn with_plugin_version(mut self, version: impl Into<String>) -> Self {
        self.plugin_version = version.into();
        self
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    /// Copy of the current settings
    pub fn settings(&self) -> MountSettings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the settings; calls already running keep their snapshot
    pub fn update_settings(&self, settings: MountSettings) {
        match self.settings.write() {
            Ok(mut current) => *current = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    fn plugin_access(&self) -> Result<&PluginAccess> {
        self.services
            .plugins
            .as_ref()
            .ok_or_else(|| WardenError::config("plugin catalog is not available to this mount"))
    }
}

#[async_trait]
impl SystemView for HostSystemView {
    async fn default_lease_ttl(&self, _ctx: &CallContext) -> Result<Duration> {
        Ok(self.settings().default_lease_ttl)
    }

    async fn max_lease_ttl(&self, _ctx: &CallContext) -> Result<Duration> {
        Ok(self.settings().max_lease_ttl)
    }

    async fn tainted(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(self.settings().tainted)
    }

    async fn caching_disabled(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(self.settings().caching_disabled)
    }

    async fn replication_state(&self, _ctx: &CallContext) -> Result<ReplicationState> {
        Ok(self.settings().replication_state)
    }

    async fn mlock_enabled(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(self.settings().mlock_enabled)
    }

    async fn local_mount(&self, _ctx: &CallContext) -> Result<bool> {
        Ok(self.settings().local_mount)
    }

    async fn response_wrap_data(
        &self,
        _ctx: &CallContext,
        data: serde_json::Value,
        ttl: Duration,
        jwt: bool,
    ) -> Result<WrapInfo> {
        self.services.wrapping.wrap(data, ttl, &self.mount_path, jwt)
    }

    async fn entity_info(&self, ctx: &CallContext, entity_id: &str) -> Result<Option<Entity>> {
        ctx.run("system_view.entity_info", self.services.identity.entity(entity_id)).await
    }

    async fn groups_for_entity(&self, ctx: &CallContext, entity_id: &str) -> Result<Vec<Group>> {
        ctx.run("system_view.groups_for_entity", self.services.identity.groups_for_entity(entity_id)).await
    }

    async fn plugin_env(&self, _ctx: &CallContext) -> Result<PluginEnvironment> {
        Ok(PluginEnvironment {
            platform_version: self.services.platform_version.clone(),
            plugin_version: self.plugin_version.clone(),
        })
    }

    async fn generate_password_from_policy(&self, _ctx: &CallContext, policy_name: &str) -> Result<SecretString> {
        self.services.passwords.generate(policy_name)
    }

    async fn lookup_plugin(
        &self,
        _ctx: &CallContext,
        plugin_type: PluginType,
        name: &str,
        version: &str,
    ) -> Result<PluginRunner> {
        self.plugin_access()?.catalog.get(plugin_type, name, version).await
    }

    async fn new_plugin_client(
        &self,
        ctx: &CallContext,
        plugin_type: PluginType,
        name: &str,
        version: &str,
    ) -> Result<Arc<PluginClient>> {
        let access = self.plugin_access()?;
        let runner = access.catalog.get(plugin_type, name, version).await?;
        let processes = access
            .processes
            .upgrade()
            .ok_or_else(|| WardenError::backend_unavailable(name, "host is shutting down"))?;
        debug!(mount = %self.mount_path, plugin = %name, "Starting plugin for in-process backend");
        ctx.run("system_view.new_plugin_client", processes.acquire(&runner, &self.mount_path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sysview::password::{CharsetRule, PasswordPolicy};
    use serde_json::json;

    #[tokio::test]
    async fn test_settings_snapshot_and_update() {
        let view = HostSystemView::standalone("database/", MountSettings::default());
        let mut settings = view.settings();
        settings.tainted = true;
        settings.max_lease_ttl = Duration::from_secs(42);
        view.update_settings(settings);

        let ctx = CallContext::default();
        assert!(view.tainted(&ctx).await.unwrap());
        assert_eq!(view.max_lease_ttl(&ctx).await.unwrap(), Duration::from_secs(42));
        assert_eq!(view.replication_state(&ctx).await.unwrap(), ReplicationState::Standalone);
    }

    #[tokio::test]
    async fn test_wrapping_uses_mount_path() {
        let services = Arc::new(HostServices::new(Arc::new(ManualClock::default()), "1.2.3"));
        let view = HostSystemView::new("kv/", MountSettings::default(), services.clone()).with_plugin_version("v0.4.0");

        let ctx = CallContext::default();
        let info = view.response_wrap_data(&ctx, json!({"k": "v"}), Duration::from_secs(60), false).await.unwrap();
        assert_eq!(info.creation_path, "kv/");
        assert_eq!(services.wrapping.unwrap(&info.token).unwrap(), json!({"k": "v"}));

        let env = view.plugin_env(&ctx).await.unwrap();
        assert_eq!(env.platform_version, "1.2.3");
        assert_eq!(env.plugin_version, "v0.4.0");
    }

    #[tokio::test]
    async fn test_passwords_and_plugins() {
        let view = HostSystemView::standalone("db/", MountSettings::default());
        view.services()
            .passwords
            .set("alnum", PasswordPolicy { length: 12, rules: vec![CharsetRule { charset: "abc123".into(), min_chars: 2 }] })
            .unwrap();

        let ctx = CallContext::default();
        assert_eq!(view.generate_password_from_policy(&ctx, "alnum").await.unwrap().len(), 12);
        assert!(matches!(
            view.generate_password_from_policy(&ctx, "missing").await,
            Err(WardenError::PolicyNotFound { .. })
        ));
        assert!(view.lookup_plugin(&ctx, PluginType::Database, "memdb", "").await.is_err());
    }
}
