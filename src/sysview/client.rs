//! Plugin end of the `system_view` service.

use super::{Entity, Group, PluginEnvironment, ReplicationState, SystemView, WrapInfo};
use crate::codec::messages as wire;
use crate::codec::{decode_message, encode_message};
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::plugin::catalog::{PluginRunner, PluginType};
use crate::plugin::client::PluginClient;
use crate::plugin::transport::{RpcConnection, SERVICE_SYSTEM_VIEW};
use crate::types::SecretString;
use async_trait::async_trait;
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for one round trip, on top of the caller's deadline
const SYSTEM_VIEW_TIMEOUT: Duration = Duration::from_secs(10);

/// [`SystemView`] for a backend running inside a plugin process
#[derive(Debug, Clone)]
pub struct SystemViewClient {
    connection: RpcConnection,
    mount_id: String,
    timeout: Duration,
}

impl SystemViewClient {
    pub fn new(connection: RpcConnection, mount_id: impl Into<String>) -> Self {
        Self { connection, mount_id: mount_id.into(), timeout: SYSTEM_VIEW_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke<Req, Rep>(&self, ctx: &CallContext, method: &str, request: &Req) -> Result<Rep>
    where
        Req: Message + Serialize,
        Rep: Message + Default + DeserializeOwned,
    {
        // Bounded by the caller's deadline and cancelled with it
        let ctx = ctx.child(self.timeout);
        let payload = encode_message(request)?;
        let reply = self.connection.call(SERVICE_SYSTEM_VIEW, method, &self.mount_id, payload, &ctx).await?;
        decode_message(&reply)
    }

    async fn ttl(&self, ctx: &CallContext, method: &str) -> Result<Duration> {
        let reply: wire::TtlReply = self.invoke(ctx, method, &wire::Empty {}).await?;
        Ok(Duration::from_secs(reply.ttl_seconds.max(0) as u64))
    }

    async fn flag(&self, ctx: &CallContext, method: &str) -> Result<bool> {
        let reply: wire::BoolReply = self.invoke(ctx, method, &wire::Empty {}).await?;
        Ok(reply.value)
    }
}

#[async_trait]
impl SystemView for SystemViewClient {
    async fn default_lease_ttl(&self, ctx: &CallContext) -> Result<Duration> {
        self.ttl(ctx, "default_lease_ttl").await
    }

    async fn max_lease_ttl(&self, ctx: &CallContext) -> Result<Duration> {
        self.ttl(ctx, "max_lease_ttl").await
    }

    async fn tainted(&self, ctx: &CallContext) -> Result<bool> {
        self.flag(ctx, "tainted").await
    }

    async fn caching_disabled(&self, ctx: &CallContext) -> Result<bool> {
        self.flag(ctx, "caching_disabled").await
    }

    async fn replication_state(&self, ctx: &CallContext) -> Result<ReplicationState> {
        let reply: wire::ReplicationStateReply = self.invoke(ctx, "replication_state", &wire::Empty {}).await?;
        Ok(ReplicationState::try_from(reply.state).unwrap_or(ReplicationState::Unknown))
    }

    async fn mlock_enabled(&self, ctx: &CallContext) -> Result<bool> {
        self.flag(ctx, "mlock_enabled").await
    }

    async fn local_mount(&self, ctx: &CallContext) -> Result<bool> {
        self.flag(ctx, "local_mount").await
    }

    async fn response_wrap_data(
        &self,
        ctx: &CallContext,
        data: serde_json::Value,
        ttl: Duration,
        jwt: bool,
    ) -> Result<WrapInfo> {
        let request = wire::ResponseWrapRequest {
            data_json: serde_json::to_string(&data)?,
            ttl_seconds: ttl.as_secs() as i64,
            jwt,
        };
        self.invoke(ctx, "response_wrap_data", &request).await
    }

    async fn entity_info(&self, ctx: &CallContext, entity_id: &str) -> Result<Option<Entity>> {
        let request = wire::EntityInfoRequest { entity_id: entity_id.to_string() };
        let reply: wire::EntityInfoReply = self.invoke(ctx, "entity_info", &request).await?;
        Ok(reply.entity)
    }

    async fn groups_for_entity(&self, ctx: &CallContext, entity_id: &str) -> Result<Vec<Group>> {
        let request = wire::EntityInfoRequest { entity_id: entity_id.to_string() };
        let reply: wire::GroupsForEntityReply = self.invoke(ctx, "groups_for_entity", &request).await?;
        Ok(reply.groups)
    }

    async fn plugin_env(&self, ctx: &CallContext) -> Result<PluginEnvironment> {
        self.invoke(ctx, "plugin_env", &wire::Empty {}).await
    }

    async fn generate_password_from_policy(&self, ctx: &CallContext, policy_name: &str) -> Result<SecretString> {
        let request = wire::GeneratePasswordRequest { policy_name: policy_name.to_string() };
        let reply: wire::GeneratePasswordReply = self.invoke(ctx, "generate_password_from_policy", &request).await?;
        Ok(SecretString::new(reply.password))
    }

    async fn lookup_plugin(
        &self,
        _ctx: &CallContext,
        _plugin_type: PluginType,
        _name: &str,
        _version: &str,
    ) -> Result<PluginRunner> {
        Err(WardenError::NotPermittedInPlugin)
    }

    async fn new_plugin_client(
        &self,
        _ctx: &CallContext,
        _plugin_type: PluginType,
        _name: &str,
        _version: &str,
    ) -> Result<Arc<PluginClient>> {
        Err(WardenError::NotPermittedInPlugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::plugin::transport::{InboundCall, Router, RpcHandler};
    use crate::sysview::{
        HostServices, HostSystemView, MemoryIdentityStore, MountSettings, SystemViewRegistry, SystemViewServer,
    };
    use serde_json::json;

    struct Bridge {
        client: SystemViewClient,
        services: Arc<HostServices>,
        identity: Arc<MemoryIdentityStore>,
        _host: RpcConnection,
    }

    fn ctx() -> CallContext {
        CallContext::with_timeout(Duration::from_secs(5))
    }

    fn bridge() -> Bridge {
        let identity = Arc::new(MemoryIdentityStore::new());
        let services =
            Arc::new(HostServices::new(Arc::new(SystemClock), "1.0.0").with_identity(identity.clone()));
        let settings = MountSettings { max_lease_ttl: Duration::from_secs(7200), ..MountSettings::default() };
        let registry = SystemViewRegistry::new();
        registry.register("db/", Arc::new(HostSystemView::new("db/", settings, services.clone())));

        let (a, b) = tokio::io::duplex(64 * 1024);
        let router = Router::new().service(SERVICE_SYSTEM_VIEW, Arc::new(SystemViewServer::new(registry)));
        let host = RpcConnection::new(a, "plugin", Arc::new(router));
        let plugin = RpcConnection::new(b, "host", Arc::new(Router::new()));

        Bridge { client: SystemViewClient::new(plugin, "db/"), services, identity, _host: host }
    }

    #[tokio::test]
    async fn test_settings_cross_the_boundary() {
        let bridge = bridge();
        let ctx = ctx();
        assert_eq!(bridge.client.max_lease_ttl(&ctx).await.unwrap(), Duration::from_secs(7200));
        assert!(!bridge.client.tainted(&ctx).await.unwrap());
        assert_eq!(bridge.client.replication_state(&ctx).await.unwrap(), ReplicationState::Standalone);
        assert_eq!(bridge.client.plugin_env(&ctx).await.unwrap().platform_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_jwt_wrapping_is_forced_off() {
        let bridge = bridge();
        let info = bridge
            .client
            .response_wrap_data(&ctx(), json!({"user": "u"}), Duration::from_secs(60), true)
            .await
            .unwrap();
        assert_eq!(info.format, crate::sysview::wrapping::FORMAT_OPAQUE);
        assert_eq!(info.creation_path, "db/");
        assert_eq!(bridge.services.wrapping.unwrap(&info.token).unwrap(), json!({"user": "u"}));
    }

    #[tokio::test]
    async fn test_identity_not_found_is_empty() {
        let bridge = bridge();
        let ctx = ctx();
        assert!(bridge.client.entity_info(&ctx, "missing").await.unwrap().is_none());
        assert!(bridge.client.groups_for_entity(&ctx, "missing").await.unwrap().is_empty());

        bridge.identity.upsert_entity(Entity { id: "e1".into(), name: "alice".into(), ..Default::default() });
        assert_eq!(bridge.client.entity_info(&ctx, "e1").await.unwrap().unwrap().name, "alice");
    }

    #[tokio::test]
    async fn test_password_policy_errors_keep_their_kind() {
        let bridge = bridge();
        let result = bridge.client.generate_password_from_policy(&ctx(), "missing").await;
        assert!(matches!(result, Err(WardenError::PolicyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_mount_rejected() {
        let bridge = bridge();
        let other = SystemViewClient::new(bridge.client.connection.clone(), "kv/");
        assert!(matches!(other.tainted(&ctx()).await, Err(WardenError::InvalidRequest { .. })));
    }

    #[tokio::test]
    async fn test_plugin_operations_not_permitted() {
        let bridge = bridge();
        let lookup = bridge.client.lookup_plugin(&ctx(), PluginType::Database, "memdb", "").await;
        assert!(matches!(lookup, Err(WardenError::NotPermittedInPlugin)));
        let spawn = bridge.client.new_plugin_client(&ctx(), PluginType::Database, "memdb", "").await;
        assert!(matches!(spawn, Err(WardenError::NotPermittedInPlugin)));
    }

    struct Stall;

    #[async_trait]
    impl RpcHandler for Stall {
        async fn handle(&self, _call: InboundCall) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn stalled_client() -> (SystemViewClient, RpcConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let router = Router::new().service(SERVICE_SYSTEM_VIEW, Arc::new(Stall));
        let host = RpcConnection::new(a, "plugin", Arc::new(router));
        let plugin = RpcConnection::new(b, "host", Arc::new(Router::new()));
        (SystemViewClient::new(plugin, "db/"), host)
    }

    #[tokio::test]
    async fn test_calls_follow_the_caller_deadline() {
        let (client, _host) = stalled_client();
        let started = std::time::Instant::now();

        let result = client.max_lease_ttl(&CallContext::with_timeout(Duration::from_millis(100))).await;
        assert!(matches!(result, Err(WardenError::Timeout { .. })), "{:?}", result);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_calls_follow_the_caller_cancellation() {
        let (client, _host) = stalled_client();
        let ctx = CallContext::with_timeout(Duration::from_secs(60));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = client.tainted(&ctx).await;
        assert!(matches!(result, Err(WardenError::Cancelled { .. })), "{:?}", result);
    }
}
