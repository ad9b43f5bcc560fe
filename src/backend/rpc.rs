//! Stub and skeleton carrying [`CredentialBackend`] over a plugin connection.

use super::types::{
    DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse,
    UpdateUserRequest,
};
use super::{BackendFactory, CredentialBackend};
use crate::codec::messages as wire;
use crate::codec::{decode_message, encode_message};
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::plugin::transport::{InboundCall, RpcConnection, RpcHandler, SERVICE_BACKEND};
use crate::sysview::SystemViewClient;
use async_trait::async_trait;
use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Host-side stub for one mount's backend inside a plugin
#[derive(Debug, Clone)]
pub struct BackendClient {
    connection: RpcConnection,
    mount_id: String,
    closed: Arc<AtomicBool>,
}

impl BackendClient {
    pub fn new(connection: RpcConnection, mount_id: impl Into<String>) -> Self {
        Self { connection, mount_id: mount_id.into(), closed: Arc::new(AtomicBool::new(false)) }
    }

    pub fn mount_id(&self) -> &str {
        &self.mount_id
    }

    async fn invoke<Req, Rep>(&self, ctx: &CallContext, method: &str, request: &Req) -> Result<Rep>
    where
        Req: Message + Serialize,
        Rep: Message + Default + DeserializeOwned,
    {
        let payload = encode_message(request)?;
        let reply = self.connection.call(SERVICE_BACKEND, method, &self.mount_id, payload, ctx).await?;
        decode_message(&reply)
    }
}

#[async_trait]
impl CredentialBackend for BackendClient {
    async fn initialize(&self, ctx: &CallContext, request: InitializeRequest) -> Result<InitializeResponse> {
        let reply: wire::InitializeReply = self.invoke(ctx, "initialize", &request.to_wire()?).await?;
        let config = if reply.config_json.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&reply.config_json)?
        };
        Ok(InitializeResponse { config })
    }

    async fn new_user(&self, ctx: &CallContext, request: NewUserRequest) -> Result<NewUserResponse> {
        let reply: wire::NewUserReply = self.invoke(ctx, "new_user", &request.to_wire()).await?;
        NewUserResponse::from_wire(reply)
    }

    async fn update_user(&self, ctx: &CallContext, request: UpdateUserRequest) -> Result<()> {
        request.validate()?;
        let _: wire::Empty = self.invoke(ctx, "update_user", &request.to_wire()).await?;
        Ok(())
    }

    async fn delete_user(&self, ctx: &CallContext, request: DeleteUserRequest) -> Result<()> {
        let _: wire::Empty = self.invoke(ctx, "delete_user", &request.to_wire()).await?;
        Ok(())
    }

    async fn backend_type(&self, ctx: &CallContext) -> Result<String> {
        let reply: wire::TypeReply = self.invoke(ctx, "type", &wire::Empty {}).await?;
        Ok(reply.backend_type)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || self.connection.is_closed() {
            return Ok(());
        }
        let ctx = CallContext::with_timeout(CLOSE_TIMEOUT);
        match self.invoke::<_, wire::Empty>(&ctx, "close", &wire::Empty {}).await {
            Ok(_) => Ok(()),
            // The plugin going away also releases its connections
            Err(e) if e.is_transport() => {
                debug!(mount = %self.mount_id, error = %e, "Backend close over a dead connection");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Plugin-side skeleton: decodes calls and dispatches them to the backend
/// instance of the addressed mount, creating it on first use
pub struct BackendServer {
    factory: Arc<dyn BackendFactory>,
    connection: RpcConnection,
    multiplexed: bool,
    instances: Mutex<HashMap<String, Arc<dyn CredentialBackend>>>,
}

impl std::fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendServer")
            .field("connection", &self.connection)
            .field("multiplexed", &self.multiplexed)
            .finish()
    }
}

impl BackendServer {
    pub fn new(factory: Arc<dyn BackendFactory>, connection: RpcConnection, multiplexed: bool) -> Self {
        Self { factory, connection, multiplexed, instances: Mutex::new(HashMap::new()) }
    }

    fn instance_key<'a>(&self, mount_id: &'a str) -> &'a str {
        if self.multiplexed {
            mount_id
        } else {
            ""
        }
    }

    async fn instance(&self, mount_id: &str) -> Result<Arc<dyn CredentialBackend>> {
        let key = self.instance_key(mount_id);
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(key) {
            return Ok(existing.clone());
        }

        let system_view = Arc::new(SystemViewClient::new(self.connection.clone(), mount_id));
        let backend = self.factory.create(mount_id, system_view).await?;
        info!(mount = %mount_id, multiplexed = self.multiplexed, "Created backend instance");
        instances.insert(key.to_string(), backend.clone());
        Ok(backend)
    }

    /// Close every instance
    pub async fn close_all(&self) {
        let instances: Vec<_> = self.instances.lock().await.drain().collect();
        for (mount, backend) in instances {
            if let Err(e) = backend.close().await {
                debug!(mount = %mount, error = %e, "Backend close failed during shutdown");
            }
        }
    }

    /// Number of live backend instances
    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }
}

#[async_trait]
impl RpcHandler for BackendServer {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>> {
        let ctx = &call.context;

        if call.method == "close" {
            let removed = self.instances.lock().await.remove(self.instance_key(&call.mount_id));
            if let Some(backend) = removed {
                backend.close().await?;
            }
            return encode_message(&wire::Empty {});
        }

        let backend = self.instance(&call.mount_id).await?;
        match call.method.as_str() {
            "initialize" => {
                let request = InitializeRequest::from_wire(decode_message(&call.payload)?)?;
                let response = backend.initialize(ctx, request).await?;
                encode_message(&wire::InitializeReply {
                    config_json: serde_json::to_string(&response.config)?,
                })
            }
            "new_user" => {
                let request = NewUserRequest::from_wire(decode_message(&call.payload)?)?;
                let response = backend.new_user(ctx, request).await?;
                encode_message(&response.to_wire())
            }
            "update_user" => {
                let request = UpdateUserRequest::from_wire(decode_message(&call.payload)?)?;
                backend.update_user(ctx, request).await?;
                encode_message(&wire::Empty {})
            }
            "delete_user" => {
                let request = DeleteUserRequest::from_wire(decode_message(&call.payload)?);
                backend.delete_user(ctx, request).await?;
                encode_message(&wire::Empty {})
            }
            "type" => encode_message(&wire::TypeReply { backend_type: backend.backend_type(ctx).await? }),
            other => Err(WardenError::invalid_request(format!("unknown backend method '{}'", other))),
        }
    }
}
