//! # Plugin Runner
//!
//! Launching backend processes, the versioned handshake, the RPC connection
//! between host and plugin, and the table of live processes.
//!
//! ## Handshake
//!
//! ```text
//! host                                   plugin
//!  |-- env: magic cookie, versions, ------>|
//!  |        per-spawn CA + plugin cert     |
//!  |<-- stdout: core|ver|tls|addr|proto|caps|ack
//!  |-- tcp connect, mutual TLS ----------->|
//!  |<========= framed RPC, both ways =====>|
//! ```

pub mod catalog;
pub mod client;
pub mod handshake;
pub mod process_table;
pub mod serve;
pub mod tls;
pub mod transport;

pub use catalog::{PluginCatalog, PluginRunner, PluginType};
pub use client::{PluginClient, SpawnOptions};
pub use handshake::{Capabilities, MagicCookie, Negotiated, VersionSet};
pub use process_table::{MountScope, ProcessTable, ScopedServices};
pub use serve::{serve, ServeConfig};
pub use tls::HostTls;
pub use transport::{InboundCall, Router, RpcConnection, RpcHandler};
