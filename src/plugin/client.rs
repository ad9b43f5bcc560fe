//! Host-side handle to a running plugin process.

use super::catalog::PluginRunner;
use super::handshake::{self, MagicCookie, Negotiated, VersionSet, NETWORK_TCP, NETWORK_TLS, PROTOCOL_VERSIONS_KEY};
use super::tls::HostTls;
use super::transport::{RpcConnection, RpcHandler, SERVICE_CONTROL};
use crate::config::PluginConfig;
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::observability::metrics::{record_plugin_close, record_plugin_spawn};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::either::Either;
use tracing::{debug, info, warn, Instrument};

/// How the host launches and tears down plugins
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub cookie: MagicCookie,
    pub offered: VersionSet,
    /// Hand the child per-spawn certificates and require TLS
    pub tls: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            cookie: MagicCookie::default(),
            offered: VersionSet::current(),
            tls: true,
        }
    }
}

impl SpawnOptions {
    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            shutdown_grace: config.shutdown_grace(),
            tls: config.tls,
            ..Default::default()
        }
    }
}

/// A live plugin process and its RPC connection.
///
/// Never handed out before the handshake succeeded. Dropping the client
/// kills the process.
#[derive(Debug)]
pub struct PluginClient {
    name: String,
    negotiated: Negotiated,
    connection: RpcConnection,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl PluginClient {
    /// Launch `runner`, complete the handshake and connect. Any failure kills
    /// the child before the error is returned.
    pub async fn spawn(
        runner: &PluginRunner,
        options: &SpawnOptions,
        host_services: Arc<dyn RpcHandler>,
    ) -> Result<Self> {
        let span = crate::plugin_span!("spawn", runner.name, version = %runner.version);
        let result = Self::spawn_inner(runner, options, host_services).instrument(span).await;
        record_plugin_spawn(&runner.name, result.is_ok());
        result
    }

    async fn spawn_inner(
        runner: &PluginRunner,
        options: &SpawnOptions,
        host_services: Arc<dyn RpcHandler>,
    ) -> Result<Self> {
        runner.verify_checksum().await?;
        let tls = if options.tls { Some(HostTls::generate()?) } else { None };

        let mut command = Command::new(&runner.command);
        command
            .args(&runner.args)
            .envs(&runner.env)
            .env(&options.cookie.key, &options.cookie.value)
            .env(PROTOCOL_VERSIONS_KEY, options.offered.to_string());
        if let Some(tls) = &tls {
            command.envs(tls.env());
        }
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WardenError::handshake(format!("failed to start plugin '{}': {}", runner.name, e))
            })?;

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(runner.name.clone(), stderr);
        }

        match Self::establish(&mut child, runner, options, tls.as_ref(), host_services).await {
            Ok((negotiated, connection)) => {
                info!(
                    plugin = %runner.name,
                    pid = child.id().unwrap_or_default(),
                    protocol_version = negotiated.version,
                    multiplexing = negotiated.capabilities.multiplexing,
                    "Plugin started"
                );
                Ok(Self {
                    name: runner.name.clone(),
                    negotiated,
                    connection,
                    child: Mutex::new(Some(child)),
                    closed: AtomicBool::new(false),
                    shutdown_grace: options.shutdown_grace,
                })
            }
            Err(e) => {
                warn!(plugin = %runner.name, error = %e, "Plugin handshake failed, killing process");
                if let Err(kill_error) = child.kill().await {
                    debug!(plugin = %runner.name, error = %kill_error, "Kill after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn establish(
        child: &mut Child,
        runner: &PluginRunner,
        options: &SpawnOptions,
        tls: Option<&HostTls>,
        host_services: Arc<dyn RpcHandler>,
    ) -> Result<(Negotiated, RpcConnection)> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WardenError::handshake("plugin stdout is not captured"))?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::Instant::now() + options.handshake_timeout;
        let first = tokio::time::timeout_at(deadline, lines.next_line())
            .await
            .map_err(|_| {
                WardenError::handshake(format!(
                    "plugin '{}' did not complete the handshake within {:?}",
                    runner.name, options.handshake_timeout
                ))
            })?
            .map_err(|e| WardenError::io(e, "Failed to read plugin handshake"))?
            .ok_or_else(|| {
                WardenError::handshake(format!("plugin '{}' exited before the handshake", runner.name))
            })?;

        debug!(plugin = %runner.name, line = %first, "Handshake line received");
        let line = handshake::parse_handshake(&first, &options.offered)?;
        let network = if tls.is_some() { NETWORK_TLS } else { NETWORK_TCP };
        let negotiated = handshake::validate(&line, &options.cookie, &options.offered, network)?;

        // Anything printed after the handshake is diagnostic output
        let name = runner.name.clone();
        tokio::spawn(async move {
            while let Ok(Some(extra)) = lines.next_line().await {
                debug!(plugin = %name, line = %extra, "Plugin stdout");
            }
        });

        let stream = tokio::time::timeout_at(deadline, TcpStream::connect(&line.address))
            .await
            .map_err(|_| WardenError::handshake(format!("timed out connecting to {}", line.address)))?
            .map_err(|e| WardenError::handshake(format!("failed to connect to {}: {}", line.address, e)))?;
        stream.set_nodelay(true)?;

        let stream = match tls {
            Some(tls) => Either::Left(
                tokio::time::timeout_at(deadline, tls.connect(stream))
                    .await
                    .map_err(|_| WardenError::handshake(format!("timed out negotiating TLS with {}", line.address)))??,
            ),
            None => Either::Right(stream),
        };

        let connection = RpcConnection::new(stream, format!("plugin:{}", runner.name), host_services);
        Ok((negotiated, connection))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol_version(&self) -> u32 {
        self.negotiated.version
    }

    /// Whether one process serves many mounts
    pub fn multiplexed(&self) -> bool {
        self.negotiated.capabilities.multiplexing
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.is_closed()
    }

    /// Health check
    pub async fn ping(&self, ctx: &CallContext) -> Result<()> {
        self.connection.call(SERVICE_CONTROL, "ping", "", Vec::new(), ctx).await.map(|_| ())
    }

    /// Ask the plugin to exit, then kill it if it has not within the grace
    /// period. Calling again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = CallContext::with_timeout(self.shutdown_grace);
        if let Err(e) = self.connection.call(SERVICE_CONTROL, "shutdown", "", Vec::new(), &ctx).await {
            debug!(plugin = %self.name, error = %e, "Graceful shutdown request failed");
        }
        self.connection.close();

        let mut forced = false;
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(plugin = %self.name, %status, "Plugin exited"),
                Ok(Err(e)) => warn!(plugin = %self.name, error = %e, "Failed to wait for plugin"),
                Err(_) => {
                    forced = true;
                    warn!(plugin = %self.name, "Plugin did not exit in time, killing");
                    if let Err(e) = child.kill().await {
                        warn!(plugin = %self.name, error = %e, "Failed to kill plugin");
                    }
                }
            }
        }

        record_plugin_close(&self.name, forced);
        info!(plugin = %self.name, forced, "Plugin closed");
    }
}

fn forward_stderr(plugin: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "warden::plugin::stderr", plugin = %plugin, "{}", line);
        }
    });
}
