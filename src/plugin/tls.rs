//! Mutual TLS between the host and a plugin process.
//!
//! For every spawn the host mints a throwaway certificate authority, a
//! server certificate for the plugin and a client certificate for itself.
//! The plugin receives the CA and its own certificate and key through the
//! environment, serves TLS on its loopback listener and only accepts a client
//! signed by that CA. The host trusts nothing but the same CA.

use crate::errors::{Result, WardenError};
use crate::types::SecretString;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const TLS_CA_KEY: &str = "WARDEN_PLUGIN_TLS_CA";
pub const TLS_CERT_KEY: &str = "WARDEN_PLUGIN_TLS_CERT";
pub const TLS_KEY_KEY: &str = "WARDEN_PLUGIN_TLS_KEY";

/// Name on the plugin certificate, checked by the host
pub const SERVER_NAME: &str = "localhost";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, error: impl fmt::Display) -> WardenError {
    WardenError::handshake(format!("{}: {}", context, error))
}

fn leaf_params(common_name: &str, usage: ExtendedKeyUsagePurpose) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| tls_error("Invalid certificate parameters", e))?;
    params.subject_alt_names.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![usage];
    Ok(params)
}

fn issue(
    common_name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> Result<(Certificate, KeyPair)> {
    let key = KeyPair::generate().map_err(|e| tls_error("Failed to generate key", e))?;
    let cert = leaf_params(common_name, usage)?
        .signed_by(&key, ca, ca_key)
        .map_err(|e| tls_error("Failed to sign certificate", e))?;
    Ok((cert, key))
}

fn pkcs8(key: &KeyPair) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()))
}

/// Host half of one spawn: the material handed to the child and the
/// connector that reaches it.
pub struct HostTls {
    ca_pem: String,
    server_cert_pem: String,
    server_key_pem: SecretString,
    connector: TlsConnector,
}

impl fmt::Debug for HostTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTls").field("server_key_pem", &self.server_key_pem).finish_non_exhaustive()
    }
}

impl HostTls {
    pub fn generate() -> Result<Self> {
        let ca_key = KeyPair::generate().map_err(|e| tls_error("Failed to generate CA key", e))?;
        let mut ca_params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "warden plugin CA");
        ca_params.distinguished_name = name;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca = ca_params.self_signed(&ca_key).map_err(|e| tls_error("Failed to sign CA", e))?;

        let (server, server_key) = issue("warden plugin", ExtendedKeyUsagePurpose::ServerAuth, &ca, &ca_key)?;
        let (client, client_key) = issue("warden host", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key)?;

        let mut roots = RootCertStore::empty();
        roots.add(ca.der().clone()).map_err(|e| tls_error("Invalid CA certificate", e))?;

        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("Invalid TLS protocol configuration", e))?
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![client.der().clone()], pkcs8(&client_key))
            .map_err(|e| tls_error("Invalid client certificate", e))?;

        Ok(Self {
            ca_pem: ca.pem(),
            server_cert_pem: server.pem(),
            server_key_pem: SecretString::new(server_key.serialize_pem()),
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Environment entries for the child process
    pub fn env(&self) -> [(&'static str, &str); 3] {
        [
            (TLS_CA_KEY, self.ca_pem.as_str()),
            (TLS_CERT_KEY, self.server_cert_pem.as_str()),
            (TLS_KEY_KEY, self.server_key_pem.expose_secret()),
        ]
    }

    pub async fn connect<S>(&self, stream: S) -> Result<tokio_rustls::client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(SERVER_NAME).map_err(|e| tls_error("Invalid server name", e))?;
        self.connector
            .connect(name, stream)
            .await
            .map_err(|e| tls_error("TLS handshake with plugin failed", e))
    }
}

/// Plugin half. `Ok(None)` when the host sent no material at all, an error
/// when only part of it is present.
pub fn acceptor_from_env<F>(env: F) -> Result<Option<TlsAcceptor>>
where
    F: Fn(&str) -> Option<String>,
{
    match (env(TLS_CA_KEY), env(TLS_CERT_KEY), env(TLS_KEY_KEY)) {
        (None, None, None) => Ok(None),
        (Some(ca), Some(cert), Some(key)) => {
            let key = SecretString::new(key);
            acceptor(&ca, &cert, &key).map(Some)
        }
        _ => Err(WardenError::handshake("incomplete TLS material in the environment")),
    }
}

fn acceptor(ca_pem: &str, cert_pem: &str, key_pem: &SecretString) -> Result<TlsAcceptor> {
    let ca = CertificateDer::from_pem_slice(ca_pem.as_bytes()).map_err(|e| tls_error("Invalid CA PEM", e))?;
    let cert =
        CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|e| tls_error("Invalid certificate PEM", e))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem.expose_secret().as_bytes())
        .map_err(|e| tls_error("Invalid private key PEM", e))?;

    let mut roots = RootCertStore::empty();
    roots.add(ca).map_err(|e| tls_error("Invalid CA certificate", e))?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| tls_error("Invalid client verifier", e))?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("Invalid TLS protocol configuration", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![cert], key)
        .map_err(|e| tls_error("Invalid server certificate", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn env_of(host: &HostTls) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            host.env().iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_material_is_fresh_per_spawn() {
        let first = HostTls::generate().unwrap();
        let second = HostTls::generate().unwrap();

        let env = first.env();
        assert!(env[0].1.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(env[1].1.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(env[2].1.contains("PRIVATE KEY"));
        assert_ne!(first.ca_pem, second.ca_pem);

        let rendered = format!("{:?}", first);
        assert!(!rendered.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_acceptor_from_env_requires_all_or_nothing() {
        assert!(acceptor_from_env(|_| None).unwrap().is_none());

        let host = HostTls::generate().unwrap();
        let full = env_of(&host);
        assert!(acceptor_from_env(&full).unwrap().is_some());

        let partial = |key: &str| if key == TLS_KEY_KEY { None } else { full(key) };
        assert!(matches!(acceptor_from_env(partial), Err(WardenError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_mutual_tls_round_trip() {
        let host = HostTls::generate().unwrap();
        let acceptor = acceptor_from_env(env_of(&host)).unwrap().unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            buf
        });

        let mut stream = host.connect(client_io).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();

        assert_eq!(&echoed, b"ping");
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_plugin_from_another_spawn_is_rejected() {
        let host = HostTls::generate().unwrap();
        let stranger = HostTls::generate().unwrap();
        let acceptor = acceptor_from_env(env_of(&stranger)).unwrap().unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move { acceptor.accept(server_io).await.is_ok() });

        let result = host.connect(client_io).await;
        assert!(matches!(result, Err(WardenError::Handshake { .. })));
        assert!(!server.await.unwrap());
    }
}
