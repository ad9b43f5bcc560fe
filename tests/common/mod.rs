//! Shared helpers for tests that launch the bundled memdb plugin.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use warden::plugin::catalog::sha256_file;
use warden::plugin::transport::SERVICE_SYSTEM_VIEW;
use warden::plugin::{PluginRunner, PluginType, Router, RpcHandler};
use warden::sysview::{HostSystemView, MountSettings, SystemViewRegistry, SystemViewServer};

pub const PLUGIN_NAME: &str = "memdb";
pub const PLUGIN_VERSION: &str = "v1.0.0";

/// Path of the plugin binary built alongside these tests
pub fn plugin_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_warden-memdb-plugin"))
}

/// Directory holding the plugin binary, usable as the catalog directory
pub fn plugin_directory() -> PathBuf {
    plugin_binary().parent().map(PathBuf::from).unwrap_or_default()
}

pub async fn memdb_runner() -> PluginRunner {
    let command = plugin_binary();
    let sha256 = sha256_file(&command).await.expect("plugin binary is readable");
    PluginRunner {
        name: PLUGIN_NAME.to_string(),
        plugin_type: PluginType::Database,
        command,
        args: vec![],
        env: BTreeMap::from([("RUST_LOG".to_string(), "warden=debug".to_string())]),
        sha256,
        version: PLUGIN_VERSION.to_string(),
    }
}

/// Host services answering system view calls for the given mounts
pub fn host_services(mounts: &[&str]) -> (Arc<dyn RpcHandler>, SystemViewRegistry) {
    let registry = SystemViewRegistry::new();
    for mount in mounts {
        registry.register(*mount, Arc::new(HostSystemView::standalone(*mount, MountSettings::default())));
    }
    let router = Router::new().service(SERVICE_SYSTEM_VIEW, Arc::new(SystemViewServer::new(registry.clone())));
    (Arc::new(router), registry)
}
