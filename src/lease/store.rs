//! Authoritative record of issued credentials.
//!
//! The store keeps every lease in an in-memory index backed by [`Storage`]:
//!
//! - Writes go to storage first; the index changes only after storage
//!   accepted the write, so the cache never serves data that would be lost on
//!   restart.
//! - Reads are served from the index.
//! - Leases are additionally indexed by the client token that requested them.
//!
//! # Locking
//!
//! Operations on one lease are serialized with a per-lease async lock taken
//! through [`LeaseStore::lock`]. [`LeaseStore::renew`] takes the lock itself;
//! the other mutating methods expect the caller to hold it, which lets the
//! expiration engine keep the lock across a backend revocation call.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = LeaseStore::new(Arc::new(MemoryStorage::new()), Arc::new(SystemClock));
//! store.load().await?;
//!
//! let lease = store.create(request).await?;
//! let renewed = store.renew(&lease.id, Duration::from_secs(600), max_ttl).await?;
//! ```

use super::storage::Storage;
use super::types::{Lease, LeaseId, LeaseRequest, LeaseState};
use crate::clock::{saturating_add, Clock};
use crate::errors::{Result, WardenError};
use crate::observability::metrics::{record_lease_created, record_lease_renewed};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Storage key prefix for lease records
pub const LEASE_PREFIX: &str = "lease/";

fn storage_key(id: &LeaseId) -> String {
    format!("{}{}", LEASE_PREFIX, id)
}

#[derive(Debug, Default)]
struct Index {
    leases: HashMap<LeaseId, Lease>,
    by_token: HashMap<String, BTreeSet<LeaseId>>,
}

impl Index {
    fn insert(&mut self, lease: Lease) {
        if let Some(previous) = self.leases.get(&lease.id) {
            if previous.client_token != lease.client_token {
                let (id, token) = (previous.id.clone(), previous.client_token.clone());
                self.unindex_token(&id, token.as_deref());
            }
        }
        if let Some(token) = &lease.client_token {
            self.by_token.entry(token.clone()).or_default().insert(lease.id.clone());
        }
        self.leases.insert(lease.id.clone(), lease);
    }

    fn remove(&mut self, id: &LeaseId) -> Option<Lease> {
        let lease = self.leases.remove(id)?;
        self.unindex_token(id, lease.client_token.as_deref());
        Some(lease)
    }

    fn unindex_token(&mut self, id: &LeaseId, token: Option<&str>) {
        let Some(token) = token else { return };
        if let Some(ids) = self.by_token.get_mut(token) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_token.remove(token);
            }
        }
    }
}

pub struct LeaseStore {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    index: RwLock<Index>,
    locks: DashMap<LeaseId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore").field("clock", &self.clock).finish()
    }
}

impl LeaseStore {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock, index: RwLock::new(Index::default()), locks: DashMap::new() }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Rebuild the index from storage. Unreadable records are skipped.
    pub async fn load(&self) -> Result<usize> {
        let keys = self.storage.list(LEASE_PREFIX).await?;
        let mut loaded = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.storage.get(&key).await? else { continue };
            match serde_json::from_slice::<Lease>(&bytes) {
                Ok(lease) => loaded.push(lease),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable lease record"),
            }
        }

        let count = loaded.len();
        let mut index = self.index.write().await;
        *index = Index::default();
        for lease in loaded {
            index.insert(lease);
        }
        info!(leases = count, "Loaded leases from storage");
        Ok(count)
    }

    /// Per-lease lock serializing operations on `id`
    pub async fn lock(&self, id: &LeaseId) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(id.clone()).or_default().clone();
        mutex.lock_owned().await
    }

    async fn persist(&self, lease: &Lease) -> Result<()> {
        let bytes = serde_json::to_vec(lease)?;
        self.storage.put(&storage_key(&lease.id), bytes).await
    }

    /// Record a newly issued credential
    pub async fn create(&self, request: LeaseRequest) -> Result<Lease> {
        if request.ttl.is_zero() {
            return Err(WardenError::validation_field("lease TTL must be greater than zero", "ttl"));
        }
        let now = self.clock.now();
        let path = if request.path.is_empty() { &request.mount_path } else { &request.path };
        let lease = Lease {
            id: LeaseId::generate(path),
            mount_accessor: request.mount_accessor,
            mount_path: request.mount_path,
            client_token: request.client_token,
            issue_time: now,
            expire_time: saturating_add(now, request.ttl),
            last_renewal_time: None,
            ttl_seconds: request.ttl.as_secs(),
            renewable: request.renewable,
            secret: request.secret,
            state: LeaseState::Active,
            revocation_attempts: 0,
            last_revocation_error: None,
            next_attempt: None,
        };

        self.persist(&lease).await?;
        self.index.write().await.insert(lease.clone());
        record_lease_created(&lease.mount_path);
        debug!(lease_id = %lease.id, ttl_seconds = lease.ttl_seconds, "Lease created");
        Ok(lease)
    }

    /// Extend an active lease by `increment` (its original TTL when zero),
    /// never past `max_ttl` after issue
    pub async fn renew(&self, id: &LeaseId, increment: Duration, max_ttl: Duration) -> Result<Lease> {
        let _guard = self.lock(id).await;

        let mut lease = self.get(id).await.ok_or_else(|| WardenError::lease_not_found(id.as_str()))?;
        if !lease.is_active() {
            return Err(WardenError::lease_not_found(id.as_str()));
        }
        if !lease.renewable {
            return Err(WardenError::lease_not_renewable(id.as_str(), "lease is not renewable"));
        }

        let now = self.clock.now();
        if lease.is_expired(now) {
            return Err(WardenError::lease_not_renewable(id.as_str(), "lease has expired"));
        }

        let increment = if increment.is_zero() { lease.ttl() } else { increment };
        let ceiling = saturating_add(lease.issue_time, max_ttl);
        let expire_time = saturating_add(now, increment).min(ceiling);
        if expire_time <= now {
            return Err(WardenError::lease_not_renewable(id.as_str(), "lease has reached its maximum TTL"));
        }

        lease.expire_time = expire_time;
        lease.ttl_seconds = (expire_time - now).num_seconds().max(0) as u64;
        lease.last_renewal_time = Some(now);

        self.persist(&lease).await?;
        self.index.write().await.insert(lease.clone());
        record_lease_renewed(&lease.mount_path);
        debug!(lease_id = %id, ttl_seconds = lease.ttl_seconds, "Lease renewed");
        Ok(lease)
    }

    pub async fn get(&self, id: &LeaseId) -> Option<Lease> {
        self.index.read().await.leases.get(id).cloned()
    }

    pub async fn lookup(&self, id: &LeaseId) -> Result<Lease> {
        self.get(id).await.ok_or_else(|| WardenError::lease_not_found(id.as_str()))
    }

    /// Leases under `prefix`, ordered by id
    pub async fn list_by_prefix(&self, prefix: &str) -> Vec<Lease> {
        let index = self.index.read().await;
        let mut leases: Vec<Lease> = index.leases.values().filter(|l| l.id.has_prefix(prefix)).cloned().collect();
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        leases
    }

    pub async fn list_by_token(&self, token: &str) -> Vec<LeaseId> {
        let index = self.index.read().await;
        index.by_token.get(token).map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
    }

    /// Replace an existing record. The caller holds the lease lock.
    pub async fn update(&self, lease: &Lease) -> Result<()> {
        if self.get(&lease.id).await.is_none() {
            return Err(WardenError::lease_not_found(lease.id.as_str()));
        }
        self.persist(lease).await?;
        self.index.write().await.insert(lease.clone());
        Ok(())
    }

    /// Remove a record. The caller holds the lease lock.
    pub async fn delete(&self, id: &LeaseId) -> Result<bool> {
        self.storage.delete(&storage_key(id)).await?;
        let removed = self.index.write().await.remove(id).is_some();
        self.locks.remove(id);
        Ok(removed)
    }

    pub async fn all(&self) -> Vec<Lease> {
        self.index.read().await.leases.values().cloned().collect()
    }

    pub async fn in_state(&self, state: LeaseState) -> Vec<Lease> {
        self.index.read().await.leases.values().filter(|l| l.state == state).cloned().collect()
    }

    /// Leases not yet in revocation
    pub async fn count_active(&self) -> usize {
        self.index.read().await.leases.values().filter(|l| l.is_active()).count()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.leases.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lease::storage::MemoryStorage;
    use serde_json::json;

    fn store() -> (LeaseStore, Arc<MemoryStorage>, ManualClock) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::default();
        (LeaseStore::new(storage.clone(), Arc::new(clock.clone())), storage, clock)
    }

    fn request(mount: &str, token: Option<&str>) -> LeaseRequest {
        LeaseRequest {
            mount_path: mount.to_string(),
            mount_accessor: format!("{}-accessor", mount.trim_end_matches('/')),
            path: format!("{}creds/ro", mount),
            client_token: token.map(str::to_string),
            ttl: Duration::from_secs(60),
            renewable: true,
            secret: json!({"username": "v-user"}),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (store, storage, _) = store();
        let lease = store.create(request("database/", Some("tok"))).await.unwrap();

        assert!(lease.id.as_str().starts_with("database/creds/ro/"));
        assert_eq!(store.lookup(&lease.id).await.unwrap(), lease);
        assert_eq!(store.list_by_token("tok").await, vec![lease.id.clone()]);
        assert_eq!(storage.list(LEASE_PREFIX).await.unwrap().len(), 1);
        assert_eq!(store.count_active().await, 1);
    }

    #[tokio::test]
    async fn test_write_through_failure_leaves_cache_untouched() {
        let (store, storage, _) = store();
        storage.set_fail_writes(true);
        assert!(store.create(request("database/", None)).await.is_err());
        assert!(store.is_empty().await);

        storage.set_fail_writes(false);
        let lease = store.create(request("database/", None)).await.unwrap();
        storage.set_fail_writes(true);
        assert!(store.renew(&lease.id, Duration::from_secs(30), Duration::from_secs(3600)).await.is_err());
        assert_eq!(store.get(&lease.id).await.unwrap().expire_time, lease.expire_time);

        let _guard = store.lock(&lease.id).await;
        assert!(store.delete(&lease.id).await.is_err());
        assert!(store.get(&lease.id).await.is_some());
    }

    #[tokio::test]
    async fn test_renew_is_capped_by_max_ttl() {
        let (store, _, clock) = store();
        let lease = store.create(request("database/", None)).await.unwrap();

        clock.advance(Duration::from_secs(30));
        let renewed = store.renew(&lease.id, Duration::from_secs(3600), Duration::from_secs(120)).await.unwrap();
        assert_eq!(renewed.expire_time, lease.issue_time + chrono::Duration::seconds(120));
        assert_eq!(renewed.ttl_seconds, 90);

        clock.advance(Duration::from_secs(90));
        let exhausted = store.renew(&lease.id, Duration::from_secs(10), Duration::from_secs(120)).await;
        assert!(matches!(exhausted, Err(WardenError::LeaseNotRenewable { .. })));
    }

    #[tokio::test]
    async fn test_renew_rejections() {
        let (store, _, _) = store();
        let mut fixed = request("database/", None);
        fixed.renewable = false;
        let lease = store.create(fixed).await.unwrap();
        let max = Duration::from_secs(3600);

        assert!(matches!(
            store.renew(&lease.id, Duration::ZERO, max).await,
            Err(WardenError::LeaseNotRenewable { .. })
        ));

        let missing = LeaseId::generate("database/creds/ro");
        assert!(matches!(store.renew(&missing, Duration::ZERO, max).await, Err(WardenError::LeaseNotFound { .. })));

        let active = store.create(request("database/", None)).await.unwrap();
        let mut irrevocable = active.clone();
        irrevocable.state = LeaseState::Irrevocable;
        {
            let _guard = store.lock(&active.id).await;
            store.update(&irrevocable).await.unwrap();
        }
        assert!(matches!(
            store.renew(&active.id, Duration::ZERO, max).await,
            Err(WardenError::LeaseNotFound { .. })
        ));
        assert_eq!(store.count_active().await, 0);
    }

    #[tokio::test]
    async fn test_prefix_listing_and_reload() {
        let (store, storage, clock) = store();
        for mount in ["database/", "database/", "aws/"] {
            store.create(request(mount, Some("tok"))).await.unwrap();
        }
        assert_eq!(store.list_by_prefix("database/").await.len(), 2);
        assert_eq!(store.list_by_prefix("aws").await.len(), 1);
        assert_eq!(store.list_by_prefix("").await.len(), 3);

        let reloaded = LeaseStore::new(storage, Arc::new(clock));
        assert_eq!(reloaded.load().await.unwrap(), 3);
        assert_eq!(reloaded.list_by_token("tok").await.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_removes_token_index() {
        let (store, _, _) = store();
        let lease = store.create(request("database/", Some("tok"))).await.unwrap();
        let _guard = store.lock(&lease.id).await;
        assert!(store.delete(&lease.id).await.unwrap());
        assert!(!store.delete(&lease.id).await.unwrap());
        assert!(store.list_by_token("tok").await.is_empty());
        assert!(matches!(store.lookup(&lease.id).await, Err(WardenError::LeaseNotFound { .. })));
    }
}
