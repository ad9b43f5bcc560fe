//! Host end of the `system_view` service.

use super::SystemView;
use crate::codec::messages as wire;
use crate::codec::{decode_message, encode_message};
use crate::errors::{Result, WardenError};
use crate::plugin::transport::{InboundCall, RpcHandler};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// System views of the mounts served by plugins, keyed by mount id
#[derive(Clone, Default)]
pub struct SystemViewRegistry {
    views: Arc<DashMap<String, Arc<dyn SystemView>>>,
}

impl std::fmt::Debug for SystemViewRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemViewRegistry").field("mounts", &self.views.len()).finish()
    }
}

impl SystemViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mount_id: impl Into<String>, view: Arc<dyn SystemView>) {
        self.views.insert(mount_id.into(), view);
    }

    pub fn unregister(&self, mount_id: &str) -> bool {
        self.views.remove(mount_id).is_some()
    }

    pub fn get(&self, mount_id: &str) -> Option<Arc<dyn SystemView>> {
        self.views.get(mount_id).map(|v| v.clone())
    }
}

/// Answers system view calls from plugin backends
#[derive(Debug, Clone)]
pub struct SystemViewServer {
    registry: SystemViewRegistry,
}

impl SystemViewServer {
    pub fn new(registry: SystemViewRegistry) -> Self {
        Self { registry }
    }
}

fn ttl_reply(ttl: Duration) -> Result<Vec<u8>> {
    encode_message(&wire::TtlReply { ttl_seconds: ttl.as_secs() as i64 })
}

fn bool_reply(value: bool) -> Result<Vec<u8>> {
    encode_message(&wire::BoolReply { value })
}

#[async_trait]
impl RpcHandler for SystemViewServer {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>> {
        let view = self
            .registry
            .get(&call.mount_id)
            .ok_or_else(|| WardenError::invalid_request(format!("unknown mount '{}'", call.mount_id)))?;

        let ctx = &call.context;
        match call.method.as_str() {
            "default_lease_ttl" => ttl_reply(view.default_lease_ttl(ctx).await?),
            "max_lease_ttl" => ttl_reply(view.max_lease_ttl(ctx).await?),
            "tainted" => bool_reply(view.tainted(ctx).await?),
            "caching_disabled" => bool_reply(view.caching_disabled(ctx).await?),
            "mlock_enabled" => bool_reply(view.mlock_enabled(ctx).await?),
            "local_mount" => bool_reply(view.local_mount(ctx).await?),
            "replication_state" => encode_message(&wire::ReplicationStateReply {
                state: view.replication_state(ctx).await? as i32,
            }),
            "response_wrap_data" => {
                let request: wire::ResponseWrapRequest = decode_message(&call.payload)?;
                if request.jwt {
                    warn!(mount = %call.mount_id, "Plugin requested JWT wrapping; issuing an opaque token");
                }
                let data = serde_json::from_str(&request.data_json)
                    .map_err(|e| WardenError::invalid_request(format!("wrapped data is not JSON: {}", e)))?;
                let ttl = Duration::from_secs(request.ttl_seconds.max(0) as u64);
                // Plugins never get host-signed JWTs
                encode_message(&view.response_wrap_data(ctx, data, ttl, false).await?)
            }
            "entity_info" => {
                let request: wire::EntityInfoRequest = decode_message(&call.payload)?;
                let entity = view.entity_info(ctx, &request.entity_id).await?;
                encode_message(&wire::EntityInfoReply { entity })
            }
            "groups_for_entity" => {
                let request: wire::EntityInfoRequest = decode_message(&call.payload)?;
                let groups = view.groups_for_entity(ctx, &request.entity_id).await?;
                encode_message(&wire::GroupsForEntityReply { groups })
            }
            "plugin_env" => encode_message(&view.plugin_env(ctx).await?),
            "generate_password_from_policy" => {
                let request: wire::GeneratePasswordRequest = decode_message(&call.payload)?;
                let password = view.generate_password_from_policy(ctx, &request.policy_name).await?;
                encode_message(&wire::GeneratePasswordReply { password: password.expose_secret().to_string() })
            }
            other => Err(WardenError::invalid_request(format!("unknown system view method '{}'", other))),
        }
    }
}
