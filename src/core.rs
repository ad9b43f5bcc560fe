//! # Host Core
//!
//! Wires the plugin runner, system view bridge, lease store and expiration
//! engine into one host and owns the mount table.
//!
//! A mount is a path such as `database/` served by one credential backend,
//! either running in a plugin process or built into the host. Credentials
//! issued through a mount are recorded as leases under the mount's path, so
//! unmounting revokes everything the mount handed out.
//!
//! # Shutdown
//!
//! [`Core::shutdown`] stops the expiration watcher first and gives in-flight
//! revocations the grace period to finish, then closes every backend and
//! finally force-closes all plugin processes.

use crate::backend::{
    BackendClient, BackendFactory, CredentialBackend, CredentialPayload, DeleteUserRequest,
    InitializeRequest, NewUserRequest, Statements, UsernameMetadata,
};
use crate::clock::{saturating_add, Clock, SystemClock};
use crate::config::AppConfig;
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::expiration::{BackendRevoker, ExpirationManager, PrefixRevocation, RevocationPayload, RevokeOutcome};
use crate::lease::{Lease, LeaseId, LeaseRequest, LeaseStore, MemoryStorage, Storage};
use crate::plugin::transport::SERVICE_SYSTEM_VIEW;
use crate::plugin::{PluginCatalog, PluginRunner, PluginType, ProcessTable, Router, SpawnOptions};
use crate::sysview::{HostServices, HostSystemView, MountSettings, SystemView, SystemViewRegistry, SystemViewServer};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// How often expired wrapped responses are dropped
const WRAPPING_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// What to mount and how to configure its backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountRequest {
    pub path: String,
    /// Defaults from the lease configuration when absent
    #[serde(default)]
    pub settings: Option<MountSettings>,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub verify_connection: bool,
}

impl MountRequest {
    pub fn new(path: impl Into<String>, config: serde_json::Value) -> Self {
        Self { path: path.into(), settings: None, config, verify_connection: false }
    }
}

/// Public view of a mount table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub path: String,
    pub accessor: String,
    pub backend_type: String,
    /// `None` for built-in backends
    pub plugin: Option<String>,
}

/// Parameters for minting one credential
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    pub mount_path: String,
    pub role_name: String,
    pub display_name: String,
    pub creation_statements: Vec<String>,
    pub revocation_statements: Vec<String>,
    pub rollback_statements: Vec<String>,
    pub credential: CredentialPayload,
    /// Mount default when absent; always capped by the mount maximum
    pub ttl: Option<Duration>,
    pub renewable: bool,
    pub client_token: Option<String>,
}

/// A minted credential and the lease tracking it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub lease_id: LeaseId,
    pub lease_duration: u64,
    pub renewable: bool,
    pub username: String,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct Mount {
    path: String,
    accessor: String,
    backend_type: String,
    backend: Arc<dyn CredentialBackend>,
    view: Arc<HostSystemView>,
    runner: Option<PluginRunner>,
    /// Configuration as normalized by the backend's `initialize`
    config: serde_json::Value,
}

impl Mount {
    fn info(&self) -> MountInfo {
        MountInfo {
            path: self.path.clone(),
            accessor: self.accessor.clone(),
            backend_type: self.backend_type.clone(),
            plugin: self.runner.as_ref().map(|r| r.name.clone()),
        }
    }
}

/// A path claimed while its backend is being set up. Dropping it without
/// installing the mount frees the path again.
struct PathReservation<'a> {
    pending: &'a DashSet<String>,
    path: String,
}

impl Drop for PathReservation<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.path);
    }
}

/// `database`, `/database/` and `database/` all become `database/`
pub fn normalize_mount_path(path: &str) -> Result<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(WardenError::validation_field(format!("invalid mount path '{}'", path), "path"));
    }
    Ok(format!("{}/", trimmed))
}

pub struct Core {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    catalog: Arc<PluginCatalog>,
    processes: Arc<ProcessTable>,
    services: Arc<HostServices>,
    views: SystemViewRegistry,
    revoker: Arc<BackendRevoker>,
    expiration: Arc<ExpirationManager>,
    mounts: RwLock<HashMap<String, Mount>>,
    /// Paths of mounts still being set up
    pending: DashSet<String>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").field("expiration", &self.expiration).finish()
    }
}

impl Core {
    /// Host with in-memory lease storage and the system clock
    pub fn new(config: AppConfig) -> Self {
        Self::with_storage(config, Arc::new(MemoryStorage::new()), Arc::new(SystemClock))
    }

    pub fn with_storage(config: AppConfig, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let views = SystemViewRegistry::new();
        let host_handler = Router::new().service(SERVICE_SYSTEM_VIEW, Arc::new(SystemViewServer::new(views.clone())));
        let processes = Arc::new(ProcessTable::new(SpawnOptions::from_config(&config.plugins), Arc::new(host_handler)));
        let catalog = Arc::new(PluginCatalog::new(Some(config.plugins.directory.clone())));
        let services = Arc::new(
            HostServices::new(clock.clone(), config.plugins.platform_version.clone())
                .with_plugins(catalog.clone(), &processes),
        );

        let store = Arc::new(LeaseStore::new(storage, clock.clone()));
        let revoker = Arc::new(BackendRevoker::new());
        let expiration = Arc::new(ExpirationManager::new(store, revoker.clone(), config.leases.clone()));

        Self {
            config,
            clock,
            catalog,
            processes,
            services,
            views,
            revoker,
            expiration,
            mounts: RwLock::new(HashMap::new()),
            pending: DashSet::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    pub fn services(&self) -> &Arc<HostServices> {
        &self.services
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    pub fn expiration(&self) -> &Arc<ExpirationManager> {
        &self.expiration
    }

    fn call_context(&self) -> CallContext {
        CallContext::with_parent(self.config.plugins.call_timeout(), &self.shutdown)
    }

    fn mount_view(&self, path: &str, settings: Option<MountSettings>, plugin_version: &str) -> Arc<HostSystemView> {
        let settings = settings.unwrap_or_else(|| MountSettings::from_config(&self.config.leases));
        Arc::new(HostSystemView::new(path, settings, self.services.clone()).with_plugin_version(plugin_version))
    }

    /// Claim `path` for a new mount. Checked and claimed under the mount
    /// table lock, so two concurrent mounts of one path cannot both proceed.
    async fn reserve(&self, path: &str) -> Result<PathReservation<'_>> {
        let mounts = self.mounts.write().await;
        if mounts.contains_key(path) || !self.pending.insert(path.to_string()) {
            return Err(WardenError::invalid_request(format!("path '{}' is already in use", path)));
        }
        drop(mounts);
        Ok(PathReservation { pending: &self.pending, path: path.to_string() })
    }

    async fn mount_for(&self, path: &str) -> Result<Mount> {
        let path = normalize_mount_path(path)?;
        self.mounts
            .read()
            .await
            .get(&path)
            .cloned()
            .ok_or_else(|| WardenError::invalid_request(format!("no mount at '{}'", path)))
    }

    /// Mount a backend served by the database plugin `name` at `version`
    pub async fn mount(&self, request: MountRequest, name: &str, version: &str) -> Result<MountInfo> {
        let path = normalize_mount_path(&request.path)?;
        let reservation = self.reserve(&path).await?;
        let runner = self.catalog.get(PluginType::Database, name, version).await?;

        // Registered before the plugin starts so it can call back during initialize
        let view = self.mount_view(&path, request.settings.clone(), version);
        self.views.register(path.clone(), view.clone());

        let span = crate::plugin_span!("mount", runner.name, mount = %path);
        let client = match self.processes.acquire(&runner, &path).instrument(span).await {
            Ok(client) => client,
            Err(e) => {
                self.views.unregister(&path);
                return Err(e);
            }
        };
        let backend: Arc<dyn CredentialBackend> = Arc::new(BackendClient::new(client.connection().clone(), &path));

        let ctx = self.call_context();
        let initialized: Result<(serde_json::Value, String)> = async {
            let response = backend
                .initialize(&ctx, InitializeRequest { config: request.config.clone(), verify_connection: request.verify_connection })
                .await?;
            Ok((response.config, backend.backend_type(&ctx).await?))
        }
        .await;

        let (config, backend_type) = match initialized {
            Ok(initialized) => initialized,
            Err(e) => {
                warn!(mount = %path, plugin = %runner.name, error = %e, "Backend initialization failed");
                if let Err(close_error) = backend.close().await {
                    warn!(mount = %path, error = %close_error, "Failed to close backend after failed mount");
                }
                self.processes.release(&runner, &path).await;
                self.views.unregister(&path);
                return Err(e);
            }
        };

        let mount = Mount {
            path: path.clone(),
            accessor: new_accessor(&backend_type),
            backend_type,
            backend,
            view,
            runner: Some(runner),
            config,
        };
        Ok(self.install(mount, reservation).await)
    }

    /// Mount a backend running inside the host process
    pub async fn mount_builtin(&self, request: MountRequest, factory: &dyn BackendFactory) -> Result<MountInfo> {
        let path = normalize_mount_path(&request.path)?;
        let reservation = self.reserve(&path).await?;

        let view = self.mount_view(&path, request.settings.clone(), "");
        let backend = factory.create(&path, view.clone() as Arc<dyn SystemView>).await?;

        let ctx = self.call_context();
        let response = backend
            .initialize(&ctx, InitializeRequest { config: request.config, verify_connection: request.verify_connection })
            .await?;
        let backend_type = backend.backend_type(&ctx).await?;

        let mount = Mount {
            path,
            accessor: new_accessor(&backend_type),
            backend_type,
            backend,
            view,
            runner: None,
            config: response.config,
        };
        Ok(self.install(mount, reservation).await)
    }

    async fn install(&self, mount: Mount, reservation: PathReservation<'_>) -> MountInfo {
        self.revoker.register(mount.path.clone(), mount.backend.clone());
        let info = mount.info();
        let mut mounts = self.mounts.write().await;
        mounts.insert(mount.path.clone(), mount);
        drop(reservation);
        drop(mounts);
        info!(mount = %info.path, accessor = %info.accessor, backend_type = %info.backend_type, "Mounted backend");
        info
    }

    /// Revoke every lease of the mount and tear it down.
    ///
    /// Fails and keeps the mount when some leases could not be revoked, since
    /// they still need its backend.
    pub async fn unmount(&self, path: &str) -> Result<PrefixRevocation> {
        let mount = self.mount_for(path).await?;
        let revoked = self.expiration.revoke_prefix(&mount.path, false).await?;
        if revoked.pending > 0 {
            return Err(WardenError::backend(format!(
                "{} leases under '{}' could not be revoked; mount kept",
                revoked.pending, mount.path
            )));
        }

        self.mounts.write().await.remove(&mount.path);
        self.revoker.unregister(&mount.path);
        if let Err(e) = mount.backend.close().await {
            warn!(mount = %mount.path, error = %e, "Backend close failed during unmount");
        }
        if let Some(runner) = &mount.runner {
            self.processes.release(runner, &mount.path).await;
        }
        self.views.unregister(&mount.path);

        info!(mount = %mount.path, revoked = revoked.revoked, "Unmounted backend");
        Ok(revoked)
    }

    /// Backend configuration of a mount, as normalized by its backend
    pub async fn mount_config(&self, path: &str) -> Result<serde_json::Value> {
        Ok(self.mount_for(path).await?.config)
    }

    pub async fn mounts(&self) -> Vec<MountInfo> {
        let mut mounts: Vec<MountInfo> = self.mounts.read().await.values().map(Mount::info).collect();
        mounts.sort_by(|a, b| a.path.cmp(&b.path));
        mounts
    }

    /// Create a user through the mount's backend and lease it
    pub async fn issue_credential(&self, request: CredentialRequest) -> Result<IssuedCredential> {
        let mount = self.mount_for(&request.mount_path).await?;
        let settings = mount.view.settings();
        let ttl = request.ttl.unwrap_or(settings.default_lease_ttl).min(settings.max_lease_ttl);
        if ttl.is_zero() {
            return Err(WardenError::validation_field("credential TTL must be greater than zero", "ttl"));
        }

        let ctx = self.call_context();
        let created = mount
            .backend
            .new_user(
                &ctx,
                NewUserRequest {
                    username_config: UsernameMetadata {
                        display_name: request.display_name.clone(),
                        role_name: request.role_name.clone(),
                    },
                    statements: Statements::new(request.creation_statements.clone()),
                    rollback_statements: Statements::new(request.rollback_statements.clone()),
                    credential: request.credential,
                    expiration: Some(saturating_add(self.clock.now(), ttl)),
                },
            )
            .await?;

        let payload = RevocationPayload {
            username: created.username.clone(),
            revocation_statements: request.revocation_statements.clone(),
        };
        let registered = match payload.to_value() {
            Ok(secret) => {
                self.expiration
                    .register(LeaseRequest {
                        mount_path: mount.path.clone(),
                        mount_accessor: mount.accessor.clone(),
                        path: format!("{}creds/{}", mount.path, request.role_name),
                        client_token: request.client_token,
                        ttl,
                        renewable: request.renewable,
                        secret,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let lease = match registered {
            Ok(lease) => lease,
            Err(e) => {
                // A credential without a lease would never be revoked
                let cleanup = DeleteUserRequest {
                    username: created.username.clone(),
                    statements: Statements::new(request.revocation_statements),
                };
                if let Err(delete_error) = mount.backend.delete_user(&ctx, cleanup).await {
                    error!(
                        mount = %mount.path,
                        username = %created.username,
                        error = %delete_error,
                        "Failed to remove user after lease registration failed"
                    );
                }
                return Err(e);
            }
        };

        Ok(IssuedCredential {
            lease_duration: lease.ttl_seconds,
            renewable: lease.renewable,
            lease_id: lease.id,
            username: created.username,
            expiration: created.expiration,
        })
    }

    /// Extend a lease within its mount's maximum TTL
    pub async fn renew(&self, id: &LeaseId, increment: Duration) -> Result<Lease> {
        let lease = self.expiration.store().lookup(id).await?;
        let max_ttl = match self.mounts.read().await.get(&lease.mount_path) {
            Some(mount) => mount.view.settings().max_lease_ttl,
            None => self.config.leases.max_lease_ttl(),
        };
        self.expiration.renew(id, increment, max_ttl).await
    }

    pub async fn revoke(&self, id: &LeaseId) -> Result<RevokeOutcome> {
        self.expiration.revoke(id).await
    }

    /// Load persisted leases and rebuild the expiration schedule
    pub async fn restore(&self) -> Result<usize> {
        self.expiration.restore().await
    }

    /// Start the expiration watcher, the wrapped response sweep and, when
    /// configured, plugin health checks
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.expiration.start()?;

        self.every(WRAPPING_PURGE_INTERVAL, |core| async move {
            let purged = core.services.wrapping.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired wrapped responses");
            }
        });

        if let Some(interval) = self.config.plugins.health_check_interval() {
            self.every(interval, |core| async move { core.check_plugins().await });
        }
        Ok(())
    }

    /// Run `task` every `interval` until shutdown
    fn every<F, Fut>(self: &Arc<Self>, interval: Duration, task: F)
    where
        F: Fn(Arc<Core>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let core = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = core.shutdown.cancelled() => break,
                    _ = ticker.tick() => task(Arc::clone(&core)).await,
                }
            }
        });
    }

    /// Ping plugin processes and reconnect the mounts of any that died
    pub async fn check_plugins(&self) {
        let timeout = self.config.plugins.call_timeout();
        for path in self.processes.health_check(timeout).await {
            match self.reconnect(&path).await {
                Ok(()) => info!(mount = %path, "Reconnected mount to a new plugin process"),
                Err(e) => error!(mount = %path, error = %e, "Mount lost its plugin and could not reconnect"),
            }
        }
    }

    async fn reconnect(&self, path: &str) -> Result<()> {
        let mount = self.mount_for(path).await?;
        let Some(runner) = mount.runner.clone() else {
            return Ok(());
        };

        let client = self.processes.acquire(&runner, &mount.path).await?;
        let backend: Arc<dyn CredentialBackend> = Arc::new(BackendClient::new(client.connection().clone(), &mount.path));
        let ctx = self.call_context();
        let response =
            backend.initialize(&ctx, InitializeRequest { config: mount.config.clone(), verify_connection: false }).await?;

        self.revoker.register(mount.path.clone(), backend.clone());
        if let Some(entry) = self.mounts.write().await.get_mut(&mount.path) {
            entry.backend = backend;
            entry.config = response.config;
        }
        Ok(())
    }

    /// Stop background work, close every backend and every plugin process.
    ///
    /// Returns false when revocations were still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(grace_ms = grace.as_millis() as u64, "Shutting down");
        let drained = self.expiration.stop(grace).await;

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let mounts: Vec<Mount> = self.mounts.write().await.drain().map(|(_, mount)| mount).collect();
        for mount in &mounts {
            if mount.runner.is_some() {
                continue;
            }
            if let Err(e) = mount.backend.close().await {
                warn!(mount = %mount.path, error = %e, "Backend close failed during shutdown");
            }
        }

        self.processes.shutdown_all().await;
        info!(drained, "Shutdown complete");
        drained
    }
}

fn new_accessor(backend_type: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", backend_type, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemDbFactory;
    use crate::clock::ManualClock;
    use crate::lease::LeaseState;
    use serde_json::json;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.plugins.health_check_interval_seconds = 0;
        config.leases.revocation_max_attempts = 1;
        config
    }

    fn core() -> (Core, ManualClock) {
        let clock = ManualClock::default();
        (Core::with_storage(config(), Arc::new(MemoryStorage::new()), Arc::new(clock.clone())), clock)
    }

    fn credential(mount: &str, ttl: Option<Duration>) -> CredentialRequest {
        CredentialRequest {
            mount_path: mount.to_string(),
            role_name: "ro".into(),
            display_name: "token".into(),
            creation_statements: vec!["CREATE USER {{name}} PASSWORD {{password}}; GRANT reader TO {{name}}".into()],
            revocation_statements: vec![],
            rollback_statements: vec!["DROP USER {{name}}".into()],
            credential: CredentialPayload::Password("Secr3t-pw".into()),
            ttl,
            renewable: true,
            client_token: Some("client".into()),
        }
    }

    async fn mounted(core: &Core, path: &str) -> MountInfo {
        core.mount_builtin(MountRequest::new(path, json!({"connection_url": "localhost:5432"})), &MemDbFactory)
            .await
            .unwrap()
    }

    #[test]
    fn test_normalize_mount_path() {
        assert_eq!(normalize_mount_path("database").unwrap(), "database/");
        assert_eq!(normalize_mount_path("/database/").unwrap(), "database/");
        assert!(normalize_mount_path("/").is_err());
        assert!(normalize_mount_path("data base").is_err());
    }

    #[tokio::test]
    async fn test_mount_builtin_and_duplicate_path() {
        let (core, _) = core();
        let info = mounted(&core, "database").await;
        assert_eq!(info.path, "database/");
        assert_eq!(info.backend_type, "memdb");
        assert!(info.accessor.starts_with("memdb_"));
        assert!(info.plugin.is_none());

        let again = core
            .mount_builtin(MountRequest::new("database/", json!({"connection_url": "localhost:5432"})), &MemDbFactory)
            .await;
        assert!(matches!(again, Err(WardenError::InvalidRequest { .. })));
    }

    struct SlowFactory;

    #[async_trait::async_trait]
    impl BackendFactory for SlowFactory {
        async fn create(&self, mount_id: &str, view: Arc<dyn SystemView>) -> Result<Arc<dyn CredentialBackend>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            MemDbFactory.create(mount_id, view).await
        }
    }

    fn memdb_request(path: &str) -> MountRequest {
        MountRequest::new(path, json!({"connection_url": "localhost:5432"}))
    }

    #[tokio::test]
    async fn test_mount_keeps_normalized_config() {
        let (core, _) = core();
        mounted(&core, "database/").await;

        let config = core.mount_config("database").await.unwrap();
        assert_eq!(config["connection_url"], json!("localhost:5432"));
        assert_eq!(config["max_username_length"], json!(crate::backend::username::DEFAULT_MAX_LENGTH));
        assert_eq!(config["username_template"], json!(crate::backend::username::DEFAULT_TEMPLATE));
        assert!(core.mount_config("nowhere/").await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_mounts_of_one_path() {
        let (core, _) = core();
        let (a, b) = tokio::join!(
            core.mount_builtin(memdb_request("database/"), &SlowFactory),
            core.mount_builtin(memdb_request("/database"), &SlowFactory),
        );

        assert_eq!(u8::from(a.is_ok()) + u8::from(b.is_ok()), 1);
        let failed = if a.is_err() { a } else { b };
        assert!(matches!(failed, Err(WardenError::InvalidRequest { .. })));
        assert_eq!(core.mounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_mount_frees_its_path() {
        let (core, _) = core();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), core.mount_builtin(memdb_request("database/"), &SlowFactory))
                .await;
        assert!(abandoned.is_err());

        mounted(&core, "database/").await;
        assert_eq!(core.mounts().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_core_purges_expired_wrapped_responses() {
        let (core, clock) = core();
        let core = Arc::new(core);
        core.start().unwrap();

        let wrapping = &core.services().wrapping;
        wrapping.wrap(json!({"k": "v"}), Duration::from_secs(10), "database/", false).unwrap();
        let kept = wrapping.wrap(json!(2), Duration::from_secs(3600), "database/", false).unwrap();

        clock.advance(Duration::from_secs(11));
        tokio::time::sleep(WRAPPING_PURGE_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(wrapping.len(), 1);
        assert_eq!(wrapping.unwrap(&kept.token).unwrap(), json!(2));

        core.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_initialize_does_not_mount() {
        let (core, _) = core();
        let result = core.mount_builtin(MountRequest::new("database/", json!({})), &MemDbFactory).await;
        assert!(matches!(result, Err(WardenError::InvalidConfiguration { .. })));
        assert!(core.mounts().await.is_empty());

        // The failed attempt does not keep the path claimed
        mounted(&core, "database/").await;
    }

    #[tokio::test]
    async fn test_issue_renew_revoke() {
        let (core, clock) = core();
        mounted(&core, "database/").await;

        let issued = core.issue_credential(credential("database", Some(Duration::from_secs(600)))).await.unwrap();
        assert!(issued.lease_id.has_prefix("database/creds/ro"));
        assert_eq!(issued.lease_duration, 600);
        assert!(issued.expiration.is_some());

        clock.advance(Duration::from_secs(60));
        let renewed = core.renew(&issued.lease_id, Duration::from_secs(600)).await.unwrap();
        assert_eq!(renewed.ttl_seconds, 600);

        assert_eq!(core.revoke(&issued.lease_id).await.unwrap(), RevokeOutcome::Revoked);
        let after = core.renew(&issued.lease_id, Duration::ZERO).await;
        assert!(matches!(after, Err(WardenError::LeaseNotFound { .. })));
    }

    #[tokio::test]
    async fn test_ttl_capped_by_mount_maximum() {
        let (core, _) = core();
        let settings = MountSettings { max_lease_ttl: Duration::from_secs(120), ..MountSettings::default() };
        core.mount_builtin(
            MountRequest {
                settings: Some(settings),
                ..MountRequest::new("database/", json!({"connection_url": "localhost:5432"}))
            },
            &MemDbFactory,
        )
        .await
        .unwrap();

        let issued = core.issue_credential(credential("database/", Some(Duration::from_secs(3600)))).await.unwrap();
        assert_eq!(issued.lease_duration, 120);
    }

    #[tokio::test]
    async fn test_unknown_mount() {
        let (core, _) = core();
        let result = core.issue_credential(credential("nowhere/", None)).await;
        assert!(matches!(result, Err(WardenError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_expired_credentials_are_revoked() {
        let (core, clock) = core();
        mounted(&core, "database/").await;
        for _ in 0..3 {
            core.issue_credential(credential("database/", Some(Duration::from_secs(30)))).await.unwrap();
        }

        clock.advance(Duration::from_secs(31));
        assert_eq!(core.expiration().process_due().await, 3);
        assert!(core.expiration().store().is_empty().await);
    }

    #[tokio::test]
    async fn test_unmount_revokes_leases() {
        let (core, _) = core();
        mounted(&core, "database/").await;
        mounted(&core, "other/").await;
        core.issue_credential(credential("database/", None)).await.unwrap();
        core.issue_credential(credential("database/", None)).await.unwrap();
        let kept = core.issue_credential(credential("other/", None)).await.unwrap();

        let revoked = core.unmount("database").await.unwrap();
        assert_eq!(revoked, PrefixRevocation { revoked: 2, pending: 0 });
        assert_eq!(core.mounts().await.len(), 1);

        let lease = core.expiration().store().lookup(&kept.lease_id).await.unwrap();
        assert_eq!(lease.state, LeaseState::Active);
        assert!(matches!(core.unmount("database/").await, Err(WardenError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (core, _) = core();
        let core = Arc::new(core);
        mounted(&core, "database/").await;
        core.start().unwrap();

        assert!(core.shutdown(Duration::from_secs(1)).await);
        assert!(core.mounts().await.is_empty());
        assert!(core.shutdown(Duration::from_secs(1)).await);
    }
}
