//! Live plugin processes, shared across mounts.
//!
//! A multiplexed plugin runs once per runner and serves every mount; a
//! non-multiplexed one runs once per mount. Spawn and teardown for one
//! runner are serialized by a per-runner lock, so a replacement is never
//! started while the old process is still shutting down, and lookups of
//! other runners never wait behind a spawn.
//!
//! Each process only speaks for the mounts attached to it: calls it makes
//! back into the host are checked against its [`MountScope`].

use super::catalog::{PluginRunner, PluginType};
use super::client::{PluginClient, SpawnOptions};
use super::transport::{InboundCall, RpcHandler};
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RunnerKey {
    plugin_type: PluginType,
    name: String,
    version: String,
}

impl From<&PluginRunner> for RunnerKey {
    fn from(runner: &PluginRunner) -> Self {
        Self { plugin_type: runner.plugin_type, name: runner.name.clone(), version: runner.version.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProcessKey {
    runner: RunnerKey,
    /// `None` for the shared process of a multiplexed plugin
    mount: Option<String>,
}

/// Mounts one plugin process serves
#[derive(Debug, Clone, Default)]
pub struct MountScope {
    mounts: Arc<DashSet<String>>,
}

impl MountScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mount_id: impl Into<String>) {
        self.mounts.insert(mount_id.into());
    }

    pub fn remove(&self, mount_id: &str) -> bool {
        self.mounts.remove(mount_id).is_some()
    }

    pub fn contains(&self, mount_id: &str) -> bool {
        self.mounts.contains(mount_id)
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.mounts.iter().map(|m| m.key().clone()).collect()
    }
}

/// Host services as seen by one plugin process. Calls naming a mount
/// outside the scope are refused before they reach `inner`.
pub struct ScopedServices {
    scope: MountScope,
    inner: Arc<dyn RpcHandler>,
}

impl ScopedServices {
    pub fn new(scope: MountScope, inner: Arc<dyn RpcHandler>) -> Self {
        Self { scope, inner }
    }
}

#[async_trait]
impl RpcHandler for ScopedServices {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>> {
        if !self.scope.contains(&call.mount_id) {
            warn!(
                service = %call.service,
                method = %call.method,
                mount = %call.mount_id,
                "Plugin called the host for a mount it does not serve"
            );
            return Err(WardenError::invalid_request(format!(
                "plugin does not serve mount '{}'",
                call.mount_id
            )));
        }
        self.inner.handle(call).await
    }
}

#[derive(Debug)]
struct Entry {
    client: Arc<PluginClient>,
    mounts: MountScope,
}

pub struct ProcessTable {
    options: SpawnOptions,
    host_services: Arc<dyn RpcHandler>,
    entries: RwLock<HashMap<ProcessKey, Entry>>,
    spawn_locks: DashMap<RunnerKey, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTable").field("options", &self.options).finish()
    }
}

impl ProcessTable {
    /// `host_services` answers calls plugins make back into the host, limited
    /// per process to the mounts it serves
    pub fn new(options: SpawnOptions, host_services: Arc<dyn RpcHandler>) -> Self {
        Self { options, host_services, entries: RwLock::new(HashMap::new()), spawn_locks: DashMap::new() }
    }

    fn spawn_lock(&self, key: &RunnerKey) -> Arc<Mutex<()>> {
        self.spawn_locks.entry(key.clone()).or_default().clone()
    }

    /// Client serving `mount_id`, spawning the plugin if needed
    pub async fn acquire(&self, runner: &PluginRunner, mount_id: &str) -> Result<Arc<PluginClient>> {
        let runner_key = RunnerKey::from(runner);
        let lock = self.spawn_lock(&runner_key);
        let _guard = lock.lock().await;

        let shared_key = ProcessKey { runner: runner_key.clone(), mount: None };
        let mount_key = ProcessKey { runner: runner_key, mount: Some(mount_id.to_string()) };

        let mut stale = Vec::new();
        {
            let mut entries = self.entries.write().await;
            for key in [&shared_key, &mount_key] {
                let Some(entry) = entries.get_mut(key) else { continue };
                if entry.client.is_closed() {
                    if let Some(entry) = entries.remove(key) {
                        stale.push(entry.client);
                    }
                    continue;
                }
                entry.mounts.insert(mount_id);
                debug!(plugin = %runner.name, mount = %mount_id, "Reusing plugin process");
                return Ok(entry.client.clone());
            }
        }

        for client in stale {
            warn!(plugin = %client.name(), "Replacing dead plugin process");
            client.close().await;
        }

        let mounts = MountScope::new();
        mounts.insert(mount_id);
        let services = Arc::new(ScopedServices::new(mounts.clone(), self.host_services.clone()));
        let client = Arc::new(PluginClient::spawn(runner, &self.options, services).await?);
        let key = if client.multiplexed() { shared_key } else { mount_key };

        self.entries.write().await.insert(key, Entry { client: client.clone(), mounts });
        Ok(client)
    }

    /// Client currently serving `mount_id`, if any
    pub async fn client_for(&self, runner: &PluginRunner, mount_id: &str) -> Option<Arc<PluginClient>> {
        let runner_key = RunnerKey::from(runner);
        let entries = self.entries.read().await;
        [None, Some(mount_id.to_string())]
            .into_iter()
            .filter_map(|mount| entries.get(&ProcessKey { runner: runner_key.clone(), mount }))
            .find(|entry| entry.mounts.contains(mount_id))
            .map(|entry| entry.client.clone())
    }

    /// Detach `mount_id`; the process is closed once no mount uses it
    pub async fn release(&self, runner: &PluginRunner, mount_id: &str) {
        let runner_key = RunnerKey::from(runner);
        let lock = self.spawn_lock(&runner_key);
        let _guard = lock.lock().await;

        let mut unused = None;
        {
            let mut entries = self.entries.write().await;
            for mount in [None, Some(mount_id.to_string())] {
                let key = ProcessKey { runner: runner_key.clone(), mount };
                let Some(entry) = entries.get_mut(&key) else { continue };
                if !entry.mounts.remove(mount_id) {
                    continue;
                }
                if entry.mounts.is_empty() {
                    unused = entries.remove(&key).map(|e| e.client);
                }
                break;
            }
        }

        if let Some(client) = unused {
            info!(plugin = %client.name(), "Last mount released, closing plugin");
            client.close().await;
        }
    }

    /// Ping every process; those that fail are removed and closed. Returns
    /// the mounts that lost their plugin.
    pub async fn health_check(&self, timeout: Duration) -> Vec<String> {
        let snapshot: Vec<(ProcessKey, Arc<PluginClient>)> =
            self.entries.read().await.iter().map(|(k, e)| (k.clone(), e.client.clone())).collect();

        let pings = snapshot.into_iter().map(|(key, client)| async move {
            let ctx = CallContext::with_timeout(timeout);
            let result = client.ping(&ctx).await;
            (key, client, result)
        });

        let mut orphaned = Vec::new();
        for (key, client, result) in join_all(pings).await {
            let Err(error) = result else { continue };
            warn!(plugin = %client.name(), error = %error, "Plugin failed health check");

            let lock = self.spawn_lock(&key.runner);
            let _guard = lock.lock().await;
            let removed = {
                let mut entries = self.entries.write().await;
                match entries.get(&key) {
                    Some(entry) if Arc::ptr_eq(&entry.client, &client) => entries.remove(&key),
                    _ => None,
                }
            };
            if let Some(entry) = removed {
                orphaned.extend(entry.mounts.to_vec());
                entry.client.close().await;
            }
        }
        orphaned
    }

    /// Close every process
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<PluginClient>> =
            self.entries.write().await.drain().map(|(_, entry)| entry.client).collect();
        if clients.is_empty() {
            return;
        }
        info!(count = clients.len(), "Closing plugin processes");
        join_all(clients.iter().map(|client| client.close())).await;
    }

    /// Number of live processes
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::transport::{Router, RpcConnection, SERVICE_SYSTEM_VIEW};
    use crate::sysview::{HostSystemView, MountSettings, SystemView, SystemViewClient, SystemViewRegistry, SystemViewServer};

    fn view(path: &str, max_ttl: u64) -> Arc<HostSystemView> {
        let settings = MountSettings { max_lease_ttl: Duration::from_secs(max_ttl), ..MountSettings::default() };
        Arc::new(HostSystemView::standalone(path, settings))
    }

    /// Host and plugin ends of one connection whose host side is limited to `scope`
    fn connect(scope: &MountScope) -> (RpcConnection, RpcConnection) {
        let registry = SystemViewRegistry::new();
        registry.register("a/", view("a/", 100));
        registry.register("b/", view("b/", 999));
        let router = Router::new().service(SERVICE_SYSTEM_VIEW, Arc::new(SystemViewServer::new(registry)));
        let services = Arc::new(ScopedServices::new(scope.clone(), Arc::new(router)));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let host = RpcConnection::new(a, "plugin", services);
        let plugin = RpcConnection::new(b, "host", Arc::new(Router::new()));
        (host, plugin)
    }

    #[tokio::test]
    async fn test_plugin_cannot_act_for_other_mounts() {
        let scope = MountScope::new();
        scope.insert("a/");
        let (_host, plugin) = connect(&scope);
        let ctx = CallContext::with_timeout(Duration::from_secs(5));

        let own = SystemViewClient::new(plugin.clone(), "a/");
        assert_eq!(own.max_lease_ttl(&ctx).await.unwrap(), Duration::from_secs(100));

        let other = SystemViewClient::new(plugin.clone(), "b/");
        assert!(matches!(other.max_lease_ttl(&ctx).await, Err(WardenError::InvalidRequest { .. })));
        let wrap = other.response_wrap_data(&ctx, serde_json::json!({"k": "v"}), Duration::from_secs(60), false).await;
        assert!(matches!(wrap, Err(WardenError::InvalidRequest { .. })));
        assert!(other.generate_password_from_policy(&ctx, "any").await.is_err());
    }

    #[tokio::test]
    async fn test_scope_follows_attach_and_release() {
        let scope = MountScope::new();
        scope.insert("a/");
        let (_host, plugin) = connect(&scope);
        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let b = SystemViewClient::new(plugin.clone(), "b/");
        let a = SystemViewClient::new(plugin, "a/");

        scope.insert("b/");
        assert_eq!(b.max_lease_ttl(&ctx).await.unwrap(), Duration::from_secs(999));

        assert!(scope.remove("a/"));
        assert!(a.tainted(&ctx).await.is_err());
        assert_eq!(scope.to_vec(), vec!["b/".to_string()]);
    }
}
