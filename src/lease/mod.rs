//! # Lease Store
//!
//! Every credential handed out is recorded as a [`Lease`]. A lease is
//! `Active` until it expires or is revoked; a failed revocation moves it to
//! `PendingRevocation`, and once retries are exhausted to `Irrevocable`.
//! Successfully revoked leases are deleted.

pub mod storage;
pub mod store;
pub mod types;

pub use storage::{MemoryStorage, Storage};
pub use store::{LeaseStore, LEASE_PREFIX};
pub use types::{Lease, LeaseId, LeaseRequest, LeaseState};
