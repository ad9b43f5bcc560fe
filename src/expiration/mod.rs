//! # Expiration and Revocation
//!
//! Drives leases to their end: expiry scheduling, backend revocation with
//! retries, and the operator surface for leases whose revocation failed.

pub mod manager;
pub mod query;
pub mod revoker;
pub mod schedule;

pub use manager::{ExpirationManager, PrefixRevocation, RevokeOutcome, WatcherState};
pub use query::{IrrevocableLease, LeaseCountResponse, LeaseListResponse};
pub use revoker::{BackendRevoker, RevocationPayload, Revoker};
pub use schedule::Schedule;
