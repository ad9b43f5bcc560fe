//! # Warden
//!
//! Trust core of a secrets platform: it runs credential backends as isolated
//! plugin processes, gives them a narrow view of host services, and tracks
//! every credential they mint as a lease that is revoked when it expires.
//!
//! ## Architecture
//!
//! ```text
//! Wire Codec → Plugin Runner → System View Bridge → Backend Capability Interface
//!                                                          ↓
//!                         Host Core ← Expiration Engine ← Lease Store
//! ```
//!
//! ## Core Components
//!
//! - **Plugin Runner** ([`plugin`]): spawn, handshake, multiplexed RPC, process table
//! - **System View** ([`sysview`]): host services a backend may call, served over RPC
//! - **Backends** ([`backend`]): the credential backend contract and a reference backend
//! - **Lease Store** ([`lease`]): write-through record of issued credentials
//! - **Expiration** ([`expiration`]): scheduled revocation with retries and queries
//! - **Core** ([`core`]): mount table and shutdown sequence
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden::{AppConfig, Core, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let core = Arc::new(Core::new(AppConfig::from_env()));
//!     core.restore().await?;
//!     core.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     core.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod expiration;
pub mod lease;
pub mod observability;
pub mod plugin;
pub mod retry;
pub mod sysview;
pub mod types;

// Re-export commonly used types and traits
pub use config::AppConfig;
pub use context::CallContext;
pub use core::{Core, CredentialRequest, IssuedCredential, MountInfo, MountRequest};
pub use errors::{Result, WardenError};
pub use observability::init_observability;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "warden");
    }
}
