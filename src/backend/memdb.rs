//! In-memory reference backend.
//!
//! Simulates a credential system with a tiny statement language so the whole
//! plugin path can run without an external database:
//!
//! ```text
//! CREATE USER <name> [PASSWORD <pw> | KEY <base64> | CERT <base64>]
//! GRANT <role> TO <name>
//! ALTER USER <name> PASSWORD <pw> | KEY <base64> | VALID UNTIL <rfc3339>
//! DROP USER <name>
//! FAIL <message>
//! ```
//!
//! Several statements may share one string, separated by `;`. Templates
//! `{{name}}`, `{{password}}`, `{{public_key}}`, `{{client_certificate}}`
//! and `{{expiration}}` are substituted token by token after the statement
//! is split and tokenized, so a bound value is always one operand even when
//! it contains whitespace or `;`.

use super::registry::ConnectionRegistry;
use super::types::{
    CredentialPayload, DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest,
    NewUserResponse, Statements, UpdateUserRequest, UserChange,
};
use super::username::{UsernameTemplate, DEFAULT_MAX_LENGTH, DEFAULT_TEMPLATE};
use super::{BackendFactory, CredentialBackend};
use crate::clock::saturating_add;
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::retry::{retry, Attempt, RetryPolicy, Sleeper, TokioSleeper};
use crate::sysview::SystemView;
use crate::types::SecretString;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use validator::Validate;

pub const MEMDB_TYPE: &str = "memdb";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn default_username_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_max_username_length() -> usize {
    DEFAULT_MAX_LENGTH
}

/// Connection settings accepted by `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MemDbConfig {
    /// `host:port` of the simulated server
    #[validate(length(min = 1, message = "connection_url is required"))]
    pub connection_url: String,

    #[serde(default = "default_username_template")]
    pub username_template: String,

    #[validate(range(min = 8, max = 255, message = "max_username_length must be between 8 and 255"))]
    #[serde(default = "default_max_username_length")]
    pub max_username_length: usize,
}

impl MemDbConfig {
    fn address(&self) -> Result<String> {
        let (host, port) = self.connection_url.rsplit_once(':').ok_or_else(|| {
            WardenError::invalid_configuration(format!(
                "connection_url '{}' must be host:port",
                self.connection_url
            ))
        })?;
        if host.is_empty() {
            return Err(WardenError::invalid_configuration("connection_url host is empty"));
        }
        let port: u16 = port.parse().map_err(|_| {
            WardenError::invalid_configuration(format!("invalid port in connection_url '{}'", self.connection_url))
        })?;
        Ok(format!("{}:{}", host, port))
    }
}

/// Credential held by a simulated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCredential {
    None,
    Password(SecretString),
    PublicKey(Vec<u8>),
    Certificate(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemUser {
    pub username: String,
    pub credential: StoredCredential,
    pub roles: Vec<String>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// The simulated server one backend instance talks to
#[derive(Debug)]
pub struct MemDbConnection {
    address: String,
    users: Mutex<BTreeMap<String, MemUser>>,
}

impl MemDbConnection {
    fn new(address: String) -> Self {
        Self { address, users: Mutex::new(BTreeMap::new()) }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn users(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemUser>>> {
        self.users.lock().map_err(|_| WardenError::internal("memdb user table lock poisoned"))
    }
}

struct Bindings<'a> {
    name: &'a str,
    password: Option<&'a SecretString>,
    public_key: Option<&'a [u8]>,
    certificate: Option<&'a [u8]>,
    expiration: Option<DateTime<Utc>>,
}

impl<'a> Bindings<'a> {
    fn for_user(name: &'a str) -> Self {
        Self { name, password: None, public_key: None, certificate: None, expiration: None }
    }

    fn render(&self, statement: &str) -> String {
        let mut out = statement.replace("{{name}}", self.name).replace("{{username}}", self.name);
        if let Some(password) = self.password {
            out = out.replace("{{password}}", password.expose_secret());
        }
        if let Some(key) = self.public_key {
            out = out.replace("{{public_key}}", &STANDARD.encode(key));
        }
        if let Some(cert) = self.certificate {
            out = out.replace("{{client_certificate}}", &STANDARD.encode(cert));
        }
        if let Some(expiration) = self.expiration {
            out = out.replace("{{expiration}}", &expiration.to_rfc3339());
        }
        out
    }
}

fn decode_blob(value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|e| WardenError::invalid_request(format!("invalid base64 value: {}", e)))
}

/// Run one statement template against the user table
fn execute(users: &mut BTreeMap<String, MemUser>, statement: &str, bindings: &Bindings<'_>) -> Result<()> {
    let raw: Vec<&str> = statement.split_whitespace().collect();
    let upper: Vec<String> = raw.iter().map(|t| t.to_ascii_uppercase()).collect();
    let keywords: Vec<&str> = upper.iter().map(String::as_str).collect();
    let tokens: Vec<String> = raw.iter().map(|t| bindings.render(t)).collect();

    match keywords.as_slice() {
        ["CREATE", "USER", _, rest @ ..] => {
            let name = tokens[2].as_str();
            if users.contains_key(name) {
                return Err(WardenError::backend(format!("user {} already exists", name)));
            }
            let credential = match rest {
                [] => StoredCredential::None,
                ["PASSWORD", _] => StoredCredential::Password(SecretString::new(tokens[4].as_str())),
                ["KEY", _] => StoredCredential::PublicKey(decode_blob(&tokens[4])?),
                ["CERT", _] => StoredCredential::Certificate(decode_blob(&tokens[4])?),
                _ => return Err(WardenError::invalid_request(format!("malformed CREATE: {}", redact(statement)))),
            };
            users.insert(
                name.to_string(),
                MemUser { username: name.to_string(), credential, roles: Vec::new(), valid_until: None },
            );
            Ok(())
        }
        ["GRANT", _, "TO", _] => {
            let user = users
                .get_mut(&tokens[3])
                .ok_or_else(|| WardenError::backend(format!("user {} does not exist", tokens[3])))?;
            user.roles.push(tokens[1].to_string());
            Ok(())
        }
        ["ALTER", "USER", _, rest @ ..] => {
            let user = users
                .get_mut(&tokens[2])
                .ok_or_else(|| WardenError::backend(format!("user {} does not exist", tokens[2])))?;
            match rest {
                ["PASSWORD", _] => {
                    user.credential = StoredCredential::Password(SecretString::new(tokens[4].as_str()))
                }
                ["KEY", _] => user.credential = StoredCredential::PublicKey(decode_blob(&tokens[4])?),
                ["VALID", "UNTIL", _] => {
                    let until = DateTime::parse_from_rfc3339(&tokens[5])
                        .map_err(|e| WardenError::invalid_request(format!("invalid VALID UNTIL: {}", e)))?;
                    user.valid_until = Some(until.with_timezone(&Utc));
                }
                _ => return Err(WardenError::invalid_request(format!("malformed ALTER: {}", redact(statement)))),
            }
            Ok(())
        }
        ["DROP", "USER", _] => {
            users.remove(&tokens[2]);
            Ok(())
        }
        ["FAIL", ..] => Err(WardenError::backend(tokens[1..].join(" "))),
        _ => Err(WardenError::invalid_request(format!("unrecognized statement: {}", redact(statement)))),
    }
}

/// Statement text for error messages. Callers pass the unrendered template,
/// so bound credentials never reach the message.
fn redact(statement: &str) -> String {
    statement.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

fn run_all(users: &mut BTreeMap<String, MemUser>, statements: &Statements, bindings: &Bindings<'_>) -> Result<()> {
    for command in &statements.commands {
        for statement in command.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            execute(users, statement, bindings)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Initialized {
    template: UsernameTemplate,
    connection: Arc<MemDbConnection>,
}

/// Reference credential backend
pub struct MemDb {
    system_view: Arc<dyn SystemView>,
    state: RwLock<Option<Initialized>>,
    connections: ConnectionRegistry<MemDbConnection>,
    verify_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDb").field("connections", &self.connections.len()).finish()
    }
}

impl MemDb {
    pub fn new(system_view: Arc<dyn SystemView>) -> Self {
        Self {
            system_view,
            state: RwLock::new(None),
            connections: ConnectionRegistry::new(),
            verify_policy: RetryPolicy {
                max_attempts: 3,
                max_elapsed: Some(Duration::from_secs(5)),
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                jitter: 0.2,
            },
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override how connection verification retries
    pub fn with_verify_policy(mut self, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.verify_policy = policy;
        self.sleeper = sleeper;
        self
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Snapshot of a simulated user
    pub async fn user(&self, username: &str) -> Option<MemUser> {
        let state = self.state.read().await;
        let connection = &state.as_ref()?.connection;
        let user = connection.users().ok()?.get(username).cloned();
        user
    }

    pub async fn user_count(&self) -> usize {
        let state = self.state.read().await;
        state.as_ref().and_then(|s| s.connection.users().ok().map(|u| u.len())).unwrap_or(0)
    }

    async fn initialized(&self) -> Result<Initialized> {
        self.state
            .read()
            .await
            .clone()
            .ok_or_else(|| WardenError::backend("memdb backend is not initialized"))
    }

    async fn verify(&self, ctx: &CallContext, address: &str) -> Result<()> {
        let attempt = |n: u32| async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
                Ok(Ok(_)) => Attempt::Done(()),
                Ok(Err(e)) => {
                    debug!(address = %address, attempt = n, error = %e, "Connection check failed");
                    Attempt::Retry(WardenError::connection_verification_failed(format!(
                        "cannot reach {}: {}",
                        address, e
                    )))
                }
                Err(_) => Attempt::Retry(WardenError::connection_verification_failed(format!(
                    "timed out connecting to {}",
                    address
                ))),
            }
        };

        ctx.run("memdb.verify_connection", retry(&self.verify_policy, self.sleeper.as_ref(), attempt))
            .await
    }
}

#[async_trait]
impl CredentialBackend for MemDb {
    async fn initialize(&self, ctx: &CallContext, request: InitializeRequest) -> Result<InitializeResponse> {
        let config: MemDbConfig = serde_json::from_value(request.config)
            .map_err(|e| WardenError::invalid_configuration(format!("invalid memdb config: {}", e)))?;
        config
            .validate()
            .map_err(|e| WardenError::invalid_configuration(WardenError::from(e).wire_message()))?;
        let address = config.address()?;
        let template = UsernameTemplate::parse(&config.username_template, config.max_username_length)?;

        if request.verify_connection {
            if let Err(e) = self.verify(ctx, &address).await {
                warn!(address = %address, error = %e, "Connection verification failed");
                return Err(match e {
                    WardenError::ConnectionVerificationFailed { .. } => e,
                    other => WardenError::connection_verification_failed(other.to_string()),
                });
            }
        }

        let connection = self.connections.create(&address, || Ok(MemDbConnection::new(address.clone())))?;
        *self.state.write().await = Some(Initialized { template, connection });
        info!(address = %address, "memdb backend initialized");

        Ok(InitializeResponse { config: serde_json::to_value(&config)? })
    }

    async fn new_user(&self, ctx: &CallContext, request: NewUserRequest) -> Result<NewUserResponse> {
        let state = self.initialized().await?;
        let now = Utc::now();

        let expiration = match request.expiration {
            Some(requested) => {
                let max_ttl = self.system_view.max_lease_ttl(ctx).await?;
                let ceiling = saturating_add(now, max_ttl);
                Some(requested.min(ceiling))
            }
            None => None,
        };

        let username = state.template.render(&request.username_config, now);
        let mut bindings = Bindings::for_user(&username);
        bindings.expiration = expiration;

        let statements = if request.statements.is_empty() {
            let mut defaults = vec![match &request.credential {
                CredentialPayload::Password(_) => "CREATE USER {{name}} PASSWORD {{password}}",
                CredentialPayload::PublicKey(_) => "CREATE USER {{name}} KEY {{public_key}}",
                CredentialPayload::ClientCertificate(_) => "CREATE USER {{name}} CERT {{client_certificate}}",
            }];
            if expiration.is_some() {
                defaults.push("ALTER USER {{name}} VALID UNTIL {{expiration}}");
            }
            Statements::new(defaults)
        } else {
            request.statements.clone()
        };

        match &request.credential {
            CredentialPayload::Password(p) => bindings.password = Some(p),
            CredentialPayload::PublicKey(k) => bindings.public_key = Some(k),
            CredentialPayload::ClientCertificate(c) => bindings.certificate = Some(c),
        }

        let mut users = state.connection.users()?;
        if let Err(error) = run_all(&mut users, &statements, &bindings) {
            if !request.rollback_statements.is_empty() {
                if let Err(rollback_error) = run_all(&mut users, &request.rollback_statements, &bindings) {
                    warn!(username = %username, error = %rollback_error, "Rollback failed");
                }
            }
            return Err(error);
        }

        debug!(username = %username, "Created memdb user");
        Ok(NewUserResponse { username, expiration })
    }

    async fn update_user(&self, _ctx: &CallContext, request: UpdateUserRequest) -> Result<()> {
        request.validate()?;
        let state = self.initialized().await?;
        let mut bindings = Bindings::for_user(&request.username);

        let default = match &request.change {
            UserChange::Password(p) => {
                bindings.password = Some(p);
                "ALTER USER {{name}} PASSWORD {{password}}"
            }
            UserChange::PublicKey(k) => {
                bindings.public_key = Some(k);
                "ALTER USER {{name}} KEY {{public_key}}"
            }
            UserChange::Expiration(t) => {
                bindings.expiration = Some(*t);
                "ALTER USER {{name}} VALID UNTIL {{expiration}}"
            }
        };
        let statements =
            if request.statements.is_empty() { Statements::new([default]) } else { request.statements.clone() };

        let mut users = state.connection.users()?;
        if !users.contains_key(&request.username) {
            return Err(WardenError::backend(format!("user {} does not exist", request.username)));
        }

        // Apply to a copy so a failing statement leaves the user untouched
        let mut staged = users.clone();
        run_all(&mut staged, &statements, &bindings)?;
        *users = staged;
        Ok(())
    }

    async fn delete_user(&self, _ctx: &CallContext, request: DeleteUserRequest) -> Result<()> {
        let state = self.initialized().await?;
        let bindings = Bindings::for_user(&request.username);
        let statements = if request.statements.is_empty() {
            Statements::new(["DROP USER {{name}}"])
        } else {
            request.statements.clone()
        };

        let mut users = state.connection.users()?;
        if !users.contains_key(&request.username) {
            debug!(username = %request.username, "User already gone");
            return Ok(());
        }
        run_all(&mut users, &statements, &bindings)
    }

    async fn backend_type(&self, _ctx: &CallContext) -> Result<String> {
        Ok(MEMDB_TYPE.to_string())
    }

    async fn close(&self) -> Result<()> {
        let was_initialized = self.state.write().await.take().is_some();
        let released = self.connections.clear();
        if was_initialized {
            info!(connections = released, "memdb backend closed");
        }
        Ok(())
    }
}

/// Builds a fresh [`MemDb`] per mount
#[derive(Debug, Clone, Copy, Default)]
pub struct MemDbFactory;

#[async_trait]
impl BackendFactory for MemDbFactory {
    async fn create(&self, _mount_id: &str, system_view: Arc<dyn SystemView>) -> Result<Arc<dyn CredentialBackend>> {
        Ok(Arc::new(MemDb::new(system_view)))
    }
}
