//! Plugin side of the handshake and the serve loop.
//!
//! A plugin binary calls [`serve`] from `main`. It refuses to run unless the
//! host's magic cookie is in the environment, picks the highest protocol
//! version the host offered, prints the handshake line on stdout and then
//! serves one host connection until told to shut down. When the host passed
//! certificate material the connection is mutual TLS.

use super::handshake::{
    self, HandshakeLine, MagicCookie, Negotiated, VersionSet, CORE_PROTOCOL_VERSION, NETWORK_TCP,
    NETWORK_TLS, PROTOCOL_NAME, PROTOCOL_VERSIONS_KEY,
};
use super::tls;
use super::transport::{InboundCall, RpcConnection, RpcHandler, Router, SERVICE_BACKEND, SERVICE_CONTROL};
use crate::backend::{BackendFactory, BackendServer};
use crate::codec::encode_message;
use crate::codec::messages::Empty;
use crate::errors::{Result, WardenError};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::either::Either;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Time the host gets to hang up after asking for shutdown
const CLOSE_LINGER: Duration = Duration::from_secs(1);

pub struct ServeConfig {
    pub factory: Arc<dyn BackendFactory>,
    /// Versions this plugin speaks
    pub supported: VersionSet,
    pub cookie: MagicCookie,
    /// How long to wait for the host to connect after the handshake
    pub accept_timeout: Duration,
}

impl ServeConfig {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            supported: VersionSet::current(),
            cookie: MagicCookie::default(),
            accept_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_versions(mut self, supported: VersionSet) -> Self {
        self.supported = supported;
        self
    }
}

/// Refuse to run when the host's cookie is absent
pub fn verify_cookie<F>(cookie: &MagicCookie, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    match env(&cookie.key) {
        Some(value) if value == cookie.value => Ok(()),
        _ => Err(WardenError::handshake("magic cookie mismatch")),
    }
}

/// Pick the version to speak from what the host offered
pub fn negotiate_versions<F>(supported: &VersionSet, env: F) -> Result<Negotiated>
where
    F: Fn(&str) -> Option<String>,
{
    let offered: VersionSet = env(PROTOCOL_VERSIONS_KEY).unwrap_or_default().parse()?;
    handshake::negotiate(&offered, supported)
}

/// Answers `control.ping` and `control.shutdown`
struct ControlService {
    shutdown: CancellationToken,
}

#[async_trait]
impl RpcHandler for ControlService {
    async fn handle(&self, call: InboundCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "ping" => encode_message(&Empty {}),
            "shutdown" => {
                self.shutdown.cancel();
                encode_message(&Empty {})
            }
            other => Err(WardenError::invalid_request(format!("unknown control method '{}'", other))),
        }
    }
}

async fn announce(line: &HandshakeLine) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .map_err(|e| WardenError::io(e, "Failed to write handshake line"))?;
    stdout.flush().await.map_err(|e| WardenError::io(e, "Failed to flush handshake line"))
}

/// Run the plugin until the host shuts it down or hangs up
pub async fn serve(config: ServeConfig) -> Result<()> {
    let env = |key: &str| std::env::var(key).ok();

    if let Err(e) = verify_cookie(&config.cookie, env) {
        eprintln!(
            "This binary is a warden plugin. It is started by the warden host and is not meant to be run directly."
        );
        return Err(e);
    }

    let negotiated = match negotiate_versions(&config.supported, env) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            println!("{}", handshake::error_line(&e));
            return Err(e);
        }
    };
    let multiplexed = negotiated.capabilities.multiplexing;

    let acceptor = match tls::acceptor_from_env(env) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            println!("{}", handshake::error_line(&e));
            return Err(e);
        }
    };
    let network = if acceptor.is_some() { NETWORK_TLS } else { NETWORK_TCP };

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(|e| WardenError::io(e, "Failed to bind plugin listener"))?;
    let address = listener.local_addr()?;

    announce(&HandshakeLine {
        core_version: CORE_PROTOCOL_VERSION,
        app_version: negotiated.version,
        network: network.to_string(),
        address: address.to_string(),
        protocol: PROTOCOL_NAME.to_string(),
        capabilities: negotiated.capabilities,
        cookie_ack: config.cookie.ack(),
    })
    .await?;

    let (stream, peer) = tokio::time::timeout(config.accept_timeout, listener.accept())
        .await
        .map_err(|_| WardenError::handshake(format!("host did not connect within {:?}", config.accept_timeout)))?
        .map_err(|e| WardenError::io(e, "Failed to accept host connection"))?;
    stream.set_nodelay(true)?;
    drop(listener);

    let stream = match acceptor {
        Some(acceptor) => {
            let secured = tokio::time::timeout(config.accept_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| WardenError::handshake("host did not complete the TLS handshake"))?
                .map_err(|e| WardenError::handshake(format!("TLS handshake with host failed: {}", e)))?;
            Either::Left(secured)
        }
        None => Either::Right(stream),
    };

    let shutdown = CancellationToken::new();
    let factory = config.factory.clone();
    let mut backends: Option<Arc<BackendServer>> = None;

    let connection = RpcConnection::with_handler(stream, "host", |connection| {
        let server = Arc::new(BackendServer::new(factory, connection, multiplexed));
        backends = Some(server.clone());
        let router: Arc<dyn RpcHandler> = Arc::new(
            Router::new()
                .service(SERVICE_BACKEND, server)
                .service(SERVICE_CONTROL, Arc::new(ControlService { shutdown: shutdown.clone() })),
        );
        router
    });

    info!(peer = %peer, network, protocol_version = negotiated.version, multiplexing = multiplexed, "Host connected");

    tokio::select! {
        _ = shutdown.cancelled() => info!("Shutdown requested by host"),
        _ = connection.closed() => info!("Host closed the connection"),
    }

    if let Some(backends) = backends {
        debug!(instances = backends.instance_count().await, "Closing backend instances");
        backends.close_all().await;
    }

    let _ = tokio::time::timeout(CLOSE_LINGER, connection.closed()).await;
    connection.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::handshake::Capabilities;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_cookie_required() {
        let cookie = MagicCookie::default();
        assert!(verify_cookie(&cookie, env(&[])).is_err());
        assert!(verify_cookie(&cookie, env(&[(cookie.key.as_str(), "wrong")])).is_err());
        assert!(verify_cookie(&cookie, env(&[(cookie.key.as_str(), cookie.value.as_str())])).is_ok());
    }

    #[test]
    fn test_negotiates_highest_common_version() {
        let negotiated =
            negotiate_versions(&VersionSet::current(), env(&[(PROTOCOL_VERSIONS_KEY, "3:,4:,5:multiplex")])).unwrap();
        assert_eq!(negotiated.version, 5);
        assert!(negotiated.capabilities.multiplexing);

        let single = VersionSet::new().with(4, Capabilities::NONE);
        let negotiated = negotiate_versions(&single, env(&[(PROTOCOL_VERSIONS_KEY, "4:,5:multiplex")])).unwrap();
        assert_eq!(negotiated.version, 4);
        assert!(!negotiated.capabilities.multiplexing);
    }

    #[test]
    fn test_no_common_version() {
        let result = negotiate_versions(&VersionSet::current(), env(&[(PROTOCOL_VERSIONS_KEY, "1:,2:")]));
        let error = result.unwrap_err();
        assert!(matches!(error, WardenError::UnsupportedPluginVersion { .. }));
        assert_eq!(handshake::error_line(&error), "error|unsupported_plugin_version|4,5");

        let missing = negotiate_versions(&VersionSet::current(), env(&[]));
        assert!(matches!(missing, Err(WardenError::UnsupportedPluginVersion { .. })));
    }
}
