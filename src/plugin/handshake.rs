//! Handshake between the host and a freshly started plugin process.
//!
//! The host launches the child with two environment variables: the magic
//! cookie and the set of protocol versions it can speak. The child answers
//! with a single line on stdout:
//!
//! ```text
//! core|app_version|network|address|protocol|capabilities|cookie_ack
//! ```
//!
//! or `error|<kind>|<message>` when it cannot proceed. `cookie_ack` is the hex
//! SHA-256 of the cookie value, so a process that never saw the cookie cannot
//! produce a valid line.
//!
//! `network` is `tls` when the host handed the child certificate material
//! (see [`super::tls`]) and `tcp` otherwise. A host that sent material only
//! accepts `tls`.

use crate::errors::{Result, WardenError};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Version of the line format itself
pub const CORE_PROTOCOL_VERSION: u32 = 1;

pub const MAGIC_COOKIE_KEY: &str = "WARDEN_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "6f1c0b9e43d27a58e1f4c8b2d9a7e3065b4c1f8d2e9a7b3c";
pub const PROTOCOL_VERSIONS_KEY: &str = "WARDEN_PLUGIN_PROTOCOL_VERSIONS";

pub const NETWORK_TCP: &str = "tcp";
pub const NETWORK_TLS: &str = "tls";
pub const PROTOCOL_NAME: &str = "warden-rpc";
pub const CAPABILITY_MULTIPLEX: &str = "multiplex";

/// Cookie pair a host expects plugins to echo back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicCookie {
    pub key: String,
    pub value: String,
}

impl Default for MagicCookie {
    fn default() -> Self {
        Self { key: MAGIC_COOKIE_KEY.to_string(), value: MAGIC_COOKIE_VALUE.to_string() }
    }
}

impl MagicCookie {
    /// Acknowledgement a plugin must present for this cookie
    pub fn ack(&self) -> String {
        cookie_ack(&self.value)
    }
}

/// Hex SHA-256 of the cookie value
pub fn cookie_ack(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Optional protocol features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Many logical backends share one process and connection
    pub multiplexing: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities { multiplexing: false };
    pub const MULTIPLEX: Capabilities = Capabilities { multiplexing: true };

    /// Features both sides support
    pub fn intersect(self, other: Capabilities) -> Capabilities {
        Capabilities { multiplexing: self.multiplexing && other.multiplexing }
    }

    /// Unknown flags are ignored so newer plugins stay compatible
    pub fn parse(flags: &str) -> Self {
        let multiplexing = flags.split(',').map(str::trim).any(|f| f == CAPABILITY_MULTIPLEX);
        Self { multiplexing }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.multiplexing {
            f.write_str(CAPABILITY_MULTIPLEX)
        } else {
            Ok(())
        }
    }
}

/// Protocol versions a side can speak, each with its capabilities.
///
/// Text form is `version:flags` pairs separated by commas, e.g. `4:,5:multiplex`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionSet {
    versions: BTreeMap<u32, Capabilities>,
}

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a version
    pub fn with(mut self, version: u32, capabilities: Capabilities) -> Self {
        self.versions.insert(version, capabilities);
        self
    }

    /// Versions spoken by the bundled host and plugins
    pub fn current() -> Self {
        Self::new().with(4, Capabilities::NONE).with(5, Capabilities::MULTIPLEX)
    }

    pub fn versions(&self) -> Vec<u32> {
        self.versions.keys().copied().collect()
    }

    pub fn capabilities(&self, version: u32) -> Option<Capabilities> {
        self.versions.get(&version).copied()
    }

    pub fn contains(&self, version: u32) -> bool {
        self.versions.contains_key(&version)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> =
            self.versions.iter().map(|(version, caps)| format!("{}:{}", version, caps)).collect();
        f.write_str(&pairs.join(","))
    }
}

impl FromStr for VersionSet {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = VersionSet::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (version, flags) = pair.split_once(':').unwrap_or((pair, ""));
            let version: u32 = version.trim().parse().map_err(|_| {
                WardenError::handshake(format!("invalid protocol version '{}'", version))
            })?;
            set.versions.insert(version, Capabilities::parse(flags));
        }
        Ok(set)
    }
}

/// Outcome of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u32,
    pub capabilities: Capabilities,
}

/// Pick the highest version both sides speak. Capabilities are the
/// intersection of what each side advertises for that version.
pub fn negotiate(offered: &VersionSet, supported: &VersionSet) -> Result<Negotiated> {
    offered
        .versions
        .iter()
        .rev()
        .find_map(|(version, offered_caps)| {
            supported.capabilities(*version).map(|supported_caps| Negotiated {
                version: *version,
                capabilities: offered_caps.intersect(supported_caps),
            })
        })
        .ok_or_else(|| WardenError::UnsupportedPluginVersion {
            offered: offered.versions(),
            supported: supported.versions(),
        })
}

/// Successful handshake line printed by a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub network: String,
    pub address: String,
    pub protocol: String,
    pub capabilities: Capabilities,
    pub cookie_ack: String,
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}|{}|{}",
            self.core_version,
            self.app_version,
            self.network,
            self.address,
            self.protocol,
            self.capabilities,
            self.cookie_ack
        )
    }
}

/// Line for a plugin that refuses to start
pub fn error_line(error: &WardenError) -> String {
    let message = match error {
        WardenError::UnsupportedPluginVersion { supported, .. } => {
            supported.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
        }
        other => other.wire_message().replace(['\n', '|'], " "),
    };
    format!("error|{}|{}", error.wire_kind(), message)
}

/// Parse what a plugin printed. An `error|...` line becomes the error it
/// describes; `offered` fills in the host side of a version mismatch.
pub fn parse_handshake(line: &str, offered: &VersionSet) -> Result<HandshakeLine> {
    let line = line.trim();
    if line.is_empty() {
        return Err(WardenError::handshake("plugin printed an empty handshake line"));
    }

    if let Some(rest) = line.strip_prefix("error|") {
        let (kind, message) = rest.split_once('|').unwrap_or((rest, ""));
        return Err(match kind {
            "unsupported_plugin_version" => WardenError::UnsupportedPluginVersion {
                offered: offered.versions(),
                supported: message.split(',').filter_map(|v| v.trim().parse().ok()).collect(),
            },
            _ => WardenError::handshake(format!("plugin refused to start ({}): {}", kind, message)),
        });
    }

    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 7 {
        return Err(WardenError::handshake(format!(
            "malformed handshake line: expected 7 fields, got {}",
            parts.len()
        )));
    }

    let number = |field: &str, value: &str| -> Result<u32> {
        value.parse().map_err(|_| WardenError::handshake(format!("invalid {} '{}'", field, value)))
    };

    Ok(HandshakeLine {
        core_version: number("core protocol version", parts[0])?,
        app_version: number("protocol version", parts[1])?,
        network: parts[2].to_string(),
        address: parts[3].to_string(),
        protocol: parts[4].to_string(),
        capabilities: Capabilities::parse(parts[5]),
        cookie_ack: parts[6].to_string(),
    })
}

/// Check a parsed line against what the host offered and the network type it
/// expects. Returns the agreed version and capabilities.
pub fn validate(
    line: &HandshakeLine,
    cookie: &MagicCookie,
    offered: &VersionSet,
    network: &str,
) -> Result<Negotiated> {
    if line.core_version != CORE_PROTOCOL_VERSION {
        return Err(WardenError::handshake(format!(
            "unsupported core protocol version {} (expected {})",
            line.core_version, CORE_PROTOCOL_VERSION
        )));
    }

    if line.cookie_ack != cookie.ack() {
        return Err(WardenError::handshake("magic cookie acknowledgement mismatch"));
    }

    let Some(offered_caps) = offered.capabilities(line.app_version) else {
        return Err(WardenError::UnsupportedPluginVersion {
            offered: offered.versions(),
            supported: vec![line.app_version],
        });
    };

    if line.network != network {
        return Err(WardenError::handshake(format!(
            "plugin announced network type '{}' (expected '{}')",
            line.network, network
        )));
    }

    if line.protocol != PROTOCOL_NAME {
        return Err(WardenError::handshake(format!("unsupported protocol '{}'", line.protocol)));
    }

    Ok(Negotiated {
        version: line.app_version,
        capabilities: offered_caps.intersect(line.capabilities),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(version: u32, caps: Capabilities) -> HandshakeLine {
        HandshakeLine {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: version,
            network: NETWORK_TCP.into(),
            address: "127.0.0.1:40123".into(),
            protocol: PROTOCOL_NAME.into(),
            capabilities: caps,
            cookie_ack: MagicCookie::default().ack(),
        }
    }

    #[test]
    fn test_version_set_text_form() {
        let set = VersionSet::current();
        assert_eq!(set.to_string(), "4:,5:multiplex");

        let parsed: VersionSet = "5:multiplex, 4:".parse().unwrap();
        assert_eq!(parsed, set);

        let bare: VersionSet = "3".parse().unwrap();
        assert_eq!(bare.capabilities(3), Some(Capabilities::NONE));

        assert!("x:multiplex".parse::<VersionSet>().is_err());
    }

    #[test]
    fn test_negotiate_picks_highest_common() {
        let offered = VersionSet::current();
        let supported = VersionSet::new().with(3, Capabilities::NONE).with(4, Capabilities::MULTIPLEX);

        let negotiated = negotiate(&offered, &supported).unwrap();
        assert_eq!(negotiated.version, 4);
        // Host offered v4 without multiplexing
        assert!(!negotiated.capabilities.multiplexing);

        let negotiated = negotiate(&offered, &VersionSet::current()).unwrap();
        assert_eq!(negotiated, Negotiated { version: 5, capabilities: Capabilities::MULTIPLEX });
    }

    #[test]
    fn test_negotiate_empty_intersection() {
        let offered = VersionSet::current();
        let supported = VersionSet::new().with(6, Capabilities::MULTIPLEX);

        match negotiate(&offered, &supported) {
            Err(WardenError::UnsupportedPluginVersion { offered, supported }) => {
                assert_eq!(offered, vec![4, 5]);
                assert_eq!(supported, vec![6]);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_line_round_trip_and_validate() {
        let original = line(5, Capabilities::MULTIPLEX);
        let text = original.to_string();
        let parsed = parse_handshake(&text, &VersionSet::current()).unwrap();
        assert_eq!(parsed, original);

        let negotiated = validate(&parsed, &MagicCookie::default(), &VersionSet::current(), NETWORK_TCP).unwrap();
        assert_eq!(negotiated.version, 5);
        assert!(negotiated.capabilities.multiplexing);
    }

    #[test]
    fn test_validate_rejects_wrong_cookie() {
        let mut bad = line(5, Capabilities::MULTIPLEX);
        bad.cookie_ack = cookie_ack("some-other-cookie");

        let result = validate(&bad, &MagicCookie::default(), &VersionSet::current(), NETWORK_TCP);
        assert!(matches!(result, Err(WardenError::Handshake { .. })));
    }

    #[test]
    fn test_validate_rejects_unoffered_version() {
        let result = validate(
            &line(9, Capabilities::NONE),
            &MagicCookie::default(),
            &VersionSet::current(),
            NETWORK_TCP,
        );
        assert!(matches!(result, Err(WardenError::UnsupportedPluginVersion { .. })));
    }

    #[test]
    fn test_validate_refuses_plaintext_when_tls_expected() {
        let cookie = MagicCookie::default();
        let offered = VersionSet::current();

        let plain = line(5, Capabilities::MULTIPLEX);
        let result = validate(&plain, &cookie, &offered, NETWORK_TLS);
        assert!(matches!(result, Err(WardenError::Handshake { .. })));

        let mut secured = line(5, Capabilities::MULTIPLEX);
        secured.network = NETWORK_TLS.into();
        assert!(validate(&secured, &cookie, &offered, NETWORK_TLS).is_ok());
        assert!(validate(&secured, &cookie, &offered, NETWORK_TCP).is_err());
    }

    #[test]
    fn test_error_lines() {
        let mismatch = WardenError::UnsupportedPluginVersion { offered: vec![4, 5], supported: vec![6, 7] };
        let text = error_line(&mismatch);
        assert_eq!(text, "error|unsupported_plugin_version|6,7");

        match parse_handshake(&text, &VersionSet::current()) {
            Err(WardenError::UnsupportedPluginVersion { offered, supported }) => {
                assert_eq!(offered, vec![4, 5]);
                assert_eq!(supported, vec![6, 7]);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }

        let refused = parse_handshake("error|handshake|cookie missing", &VersionSet::current());
        assert!(matches!(refused, Err(WardenError::Handshake { .. })));
        assert!(parse_handshake("1|5|tcp", &VersionSet::current()).is_err());
    }
}
