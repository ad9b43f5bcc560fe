//! Registered plugin executables.

use crate::errors::{Result, WardenError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::info;

static PLUGIN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").expect("plugin name pattern is valid")
});

/// What kind of backend a plugin provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    SecretEngine,
    AuthMethod,
    Database,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::SecretEngine => "secret_engine",
            PluginType::AuthMethod => "auth_method",
            PluginType::Database => "database",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "secret_engine" | "secret" => Ok(PluginType::SecretEngine),
            "auth_method" | "auth" => Ok(PluginType::AuthMethod),
            "database" => Ok(PluginType::Database),
            other => Err(WardenError::validation_field(
                format!("unknown plugin type '{}'", other),
                "plugin_type",
            )),
        }
    }
}

/// Everything needed to launch one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRunner {
    pub name: String,
    pub plugin_type: PluginType,
    /// Absolute path of the executable
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Lowercase hex SHA-256 of the executable
    pub sha256: String,
    /// Empty for unversioned plugins
    #[serde(default)]
    pub version: String,
}

impl PluginRunner {
    /// Recompute the executable hash and compare it with the registered one
    pub async fn verify_checksum(&self) -> Result<()> {
        let bytes = tokio::fs::read(&self.command).await.map_err(|e| {
            WardenError::io(e, format!("Failed to read plugin executable {}", self.command.display()))
        })?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(&self.sha256) {
            return Err(WardenError::handshake(format!(
                "checksum mismatch for plugin '{}': expected {}, found {}",
                self.name, self.sha256, actual
            )));
        }
        Ok(())
    }
}

/// Hex SHA-256 of a file, for registering it
pub async fn sha256_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| WardenError::io(e, format!("Failed to read {}", path.display())))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CatalogKey {
    plugin_type: PluginType,
    name: String,
    version: String,
}

/// Process-wide set of plugins the host may launch
#[derive(Debug)]
pub struct PluginCatalog {
    directory: Option<PathBuf>,
    runners: RwLock<HashMap<CatalogKey, PluginRunner>>,
}

impl PluginCatalog {
    /// Catalog restricted to executables under `directory`. `None` accepts
    /// any absolute path.
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory, runners: RwLock::new(HashMap::new()) }
    }

    /// Add or replace a plugin. Returns the stored runner with its command
    /// resolved to an absolute path.
    pub async fn register(&self, mut runner: PluginRunner) -> Result<PluginRunner> {
        if !PLUGIN_NAME.is_match(&runner.name) {
            return Err(WardenError::validation_field(
                format!("invalid plugin name '{}'", runner.name),
                "name",
            ));
        }

        let sha256 = runner.sha256.to_ascii_lowercase();
        if sha256.len() != 64 || !sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WardenError::validation_field(
                "sha256 must be 64 hex characters",
                "sha256",
            ));
        }
        runner.sha256 = sha256;
        runner.command = self.resolve_command(&runner.command)?;

        let key = CatalogKey {
            plugin_type: runner.plugin_type,
            name: runner.name.clone(),
            version: runner.version.clone(),
        };

        info!(
            plugin = %runner.name,
            plugin_type = %runner.plugin_type,
            version = %runner.version,
            command = %runner.command.display(),
            "Registered plugin"
        );
        self.runners.write().await.insert(key, runner.clone());
        Ok(runner)
    }

    fn resolve_command(&self, command: &Path) -> Result<PathBuf> {
        match &self.directory {
            Some(directory) => {
                let directory = directory.canonicalize().map_err(|e| {
                    WardenError::io(e, format!("Plugin directory {} is not accessible", directory.display()))
                })?;
                let candidate = if command.is_absolute() { command.to_path_buf() } else { directory.join(command) };
                let resolved = candidate.canonicalize().map_err(|e| {
                    WardenError::io(e, format!("Plugin command {} is not accessible", candidate.display()))
                })?;
                if !resolved.starts_with(&directory) {
                    return Err(WardenError::validation_field(
                        format!("plugin command {} is outside the plugin directory", resolved.display()),
                        "command",
                    ));
                }
                Ok(resolved)
            }
            None if command.is_absolute() => Ok(command.to_path_buf()),
            None => Err(WardenError::validation_field(
                "plugin command must be an absolute path when no plugin directory is set",
                "command",
            )),
        }
    }

    /// Look a plugin up by type, name and version (`""` for unversioned)
    pub async fn get(&self, plugin_type: PluginType, name: &str, version: &str) -> Result<PluginRunner> {
        let key = CatalogKey { plugin_type, name: name.to_string(), version: version.to_string() };
        self.runners
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| WardenError::plugin_not_found(name, plugin_type))
    }

    /// Names registered for a type, sorted and deduplicated
    pub async fn list(&self, plugin_type: PluginType) -> Vec<String> {
        let runners = self.runners.read().await;
        let mut names: Vec<String> = runners
            .keys()
            .filter(|key| key.plugin_type == plugin_type)
            .map(|key| key.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Remove a plugin; removing an unknown plugin is not an error
    pub async fn deregister(&self, plugin_type: PluginType, name: &str, version: &str) -> bool {
        let key = CatalogKey { plugin_type, name: name.to_string(), version: version.to_string() };
        let removed = self.runners.write().await.remove(&key).is_some();
        if removed {
            info!(plugin = %name, plugin_type = %plugin_type, version = %version, "Deregistered plugin");
        }
        removed
    }
}
