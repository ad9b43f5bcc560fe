//! Message types exchanged between the host and plugin processes.
//!
//! Field tags are part of the wire contract; never renumber them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// RPC framing
// ---------------------------------------------------------------------------

/// Frame kind on a plugin connection
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum FrameKind {
    Unspecified = 0,
    Request = 1,
    Response = 2,
    Cancel = 3,
}

/// One length-delimited unit on a plugin connection
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcFrame {
    /// Correlates a response with its request; chosen by the caller
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(enumeration = "FrameKind", tag = "2")]
    pub kind: i32,
    #[prost(string, tag = "3")]
    pub service: String,
    #[prost(string, tag = "4")]
    pub method: String,
    /// Logical backend addressed on a multiplexed connection
    #[prost(string, tag = "5")]
    pub mount_id: String,
    #[prost(bytes = "vec", tag = "6")]
    #[serde(with = "crate::codec::base64_bytes")]
    pub payload: Vec<u8>,
    #[prost(message, optional, tag = "7")]
    pub error: Option<RpcError>,
    /// Remaining caller budget, zero when unbounded
    #[prost(uint64, tag = "8")]
    pub timeout_ms: u64,
}

/// Error carried back in a response frame
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub kind: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Empty request or reply
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct Empty {}

// ---------------------------------------------------------------------------
// System view
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlReply {
    #[prost(int64, tag = "1")]
    pub ttl_seconds: i64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct BoolReply {
    #[prost(bool, tag = "1")]
    pub value: bool,
}

/// Cluster replication role of the host
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum ReplicationState {
    Unknown = 0,
    Standalone = 1,
    PerformancePrimary = 2,
    PerformanceSecondary = 3,
    DisasterRecoveryPrimary = 4,
    DisasterRecoverySecondary = 5,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationStateReply {
    #[prost(enumeration = "ReplicationState", tag = "1")]
    pub state: i32,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseWrapRequest {
    /// Wrapped data as a JSON document
    #[prost(string, tag = "1")]
    pub data_json: String,
    #[prost(int64, tag = "2")]
    pub ttl_seconds: i64,
    #[prost(bool, tag = "3")]
    pub jwt: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapInfo {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub accessor: String,
    #[prost(int64, tag = "3")]
    pub ttl_seconds: i64,
    /// RFC 3339
    #[prost(string, tag = "4")]
    pub creation_time: String,
    #[prost(string, tag = "5")]
    pub creation_path: String,
    /// `opaque` or `jwt`
    #[prost(string, tag = "6")]
    pub format: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityInfoRequest {
    #[prost(string, tag = "1")]
    pub entity_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub namespace_id: String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub metadata: BTreeMap<String, String>,
    #[prost(bool, tag = "5")]
    pub disabled: bool,
}

/// Absent entity is an empty reply, not an error
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityInfoReply {
    #[prost(message, optional, tag = "1")]
    pub entity: Option<Entity>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub namespace_id: String,
    #[prost(btree_map = "string, string", tag = "4")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsForEntityReply {
    #[prost(message, repeated, tag = "1")]
    pub groups: Vec<Group>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginEnvironment {
    #[prost(string, tag = "1")]
    pub platform_version: String,
    #[prost(string, tag = "2")]
    pub plugin_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratePasswordRequest {
    #[prost(string, tag = "1")]
    pub policy_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratePasswordReply {
    #[prost(string, tag = "1")]
    pub password: String,
}

// ---------------------------------------------------------------------------
// Credential backend
// ---------------------------------------------------------------------------

/// Kind of credential a request carries
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum WireCredentialType {
    Unspecified = 0,
    Password = 1,
    RsaPrivateKey = 2,
    ClientCertificate = 3,
}

/// Credential material, exactly one kind
#[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireCredential {
    #[prost(string, tag = "10")]
    Password(String),
    /// Public half of an RSA key pair; the private key never leaves the host
    #[prost(bytes = "vec", tag = "11")]
    PublicKey(#[serde(with = "crate::codec::base64_bytes")] Vec<u8>),
    /// DER client certificate
    #[prost(bytes = "vec", tag = "12")]
    ClientCertificate(#[serde(with = "crate::codec::base64_bytes")] Vec<u8>),
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeRequest {
    #[prost(string, tag = "1")]
    pub config_json: String,
    #[prost(bool, tag = "2")]
    pub verify_connection: bool,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeReply {
    #[prost(string, tag = "1")]
    pub config_json: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UsernameConfig {
    #[prost(string, tag = "1")]
    pub display_name: String,
    #[prost(string, tag = "2")]
    pub role_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserRequest {
    #[prost(message, optional, tag = "1")]
    pub username_config: Option<UsernameConfig>,
    #[prost(string, repeated, tag = "2")]
    pub statements: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub rollback_statements: Vec<String>,
    #[prost(enumeration = "WireCredentialType", tag = "4")]
    pub credential_type: i32,
    /// Unix seconds, zero for none
    #[prost(int64, tag = "5")]
    pub expiration_unix: i64,
    #[prost(oneof = "WireCredential", tags = "10, 11, 12")]
    pub credential: Option<WireCredential>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserReply {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(int64, tag = "2")]
    pub expiration_unix: i64,
}

/// Exactly one change per update
#[derive(Clone, PartialEq, ::prost::Oneof, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireUserChange {
    #[prost(string, tag = "10")]
    Password(String),
    #[prost(bytes = "vec", tag = "11")]
    PublicKey(#[serde(with = "crate::codec::base64_bytes")] Vec<u8>),
    /// Unix seconds
    #[prost(int64, tag = "13")]
    Expiration(i64),
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateUserRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(enumeration = "WireCredentialType", tag = "2")]
    pub credential_type: i32,
    #[prost(string, repeated, tag = "3")]
    pub statements: Vec<String>,
    #[prost(oneof = "WireUserChange", tags = "10, 11, 13")]
    pub change: Option<WireUserChange>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteUserRequest {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, repeated, tag = "2")]
    pub statements: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeReply {
    #[prost(string, tag = "1")]
    pub backend_type: String,
}
