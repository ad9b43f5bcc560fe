//! Expiration manager: schedules lease expiry and drives revocation.
//!
//! Every lease registered here gets a wake time in the [`Schedule`]. A
//! watcher task ticks at the configured interval and revokes everything that
//! is due through the [`Revoker`], a bounded number at a time, each call under
//! its own deadline.
//!
//! A failed revocation leaves the lease in `PendingRevocation` and schedules
//! another attempt after an exponential backoff. Once the retry policy is
//! exhausted the lease becomes `Irrevocable`: it stays in the store, is no
//! longer scheduled, and only moves again through [`ExpirationManager::revoke`],
//! [`ExpirationManager::retry_irrevocable`] or [`ExpirationManager::revoke_force`].
//!
//! # Watcher lifecycle
//!
//! `Idle → Watching → Stopping → Stopped`. [`ExpirationManager::stop`] cancels
//! the watcher and then waits up to a grace period for revocations already in
//! flight. Leases that come due after shutdown began are left scheduled.

use super::revoker::Revoker;
use super::schedule::Schedule;
use crate::clock::{saturating_add, Clock};
use crate::config::LeaseConfig;
use crate::context::CallContext;
use crate::errors::{Result, WardenError};
use crate::lease::{Lease, LeaseId, LeaseRequest, LeaseState, LeaseStore};
use crate::observability::metrics::{record_lease_revoked, record_revocation_failure, set_irrevocable_leases};
use crate::retry::RetryPolicy;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

/// Revoked ids remembered to tell "already revoked" from "never existed"
const RECENTLY_REVOKED_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
    Stopping,
    Stopped,
}

/// Result of an explicit revocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The backend confirmed and the lease record is gone
    Revoked,
    /// The backend call failed; the lease will be retried
    Pending,
    /// The backend call failed and retries are exhausted
    Irrevocable,
}

/// Totals from revoking every lease under a prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixRevocation {
    pub revoked: usize,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct RecentlyRevoked {
    order: VecDeque<LeaseId>,
    ids: HashSet<LeaseId>,
}

impl RecentlyRevoked {
    fn insert(&mut self, id: LeaseId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > RECENTLY_REVOKED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &LeaseId) -> bool {
        self.ids.contains(id)
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ExpirationManager {
    store: Arc<LeaseStore>,
    revoker: Arc<dyn Revoker>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    config: LeaseConfig,
    schedule: RwLock<Schedule>,
    recently_revoked: Mutex<RecentlyRevoked>,
    state: Mutex<WatcherState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for ExpirationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationManager")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ExpirationManager {
    pub fn new(store: Arc<LeaseStore>, revoker: Arc<dyn Revoker>, config: LeaseConfig) -> Self {
        let clock = store.clock().clone();
        Self {
            store,
            revoker,
            clock,
            policy: RetryPolicy::for_revocation(&config),
            config,
            schedule: RwLock::new(Schedule::new()),
            recently_revoked: Mutex::new(RecentlyRevoked::default()),
            state: Mutex::new(WatcherState::Idle),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn state(&self) -> WatcherState {
        *locked(&self.state)
    }

    /// Number of leases waiting for a wake-up
    pub async fn scheduled(&self) -> usize {
        self.schedule.read().await.len()
    }

    /// Record a new lease and schedule its expiry
    pub async fn register(&self, request: LeaseRequest) -> Result<Lease> {
        let lease = self.store.create(request).await?;
        self.schedule.write().await.insert(lease.id.clone(), lease.expire_time);
        info!(lease_id = %lease.id, expire_time = %lease.expire_time, "Lease registered");
        Ok(lease)
    }

    /// Extend an active lease and move its wake-up
    pub async fn renew(&self, id: &LeaseId, increment: Duration, max_ttl: Duration) -> Result<Lease> {
        let lease = self.store.renew(id, increment, max_ttl).await?;
        self.schedule.write().await.insert(lease.id.clone(), lease.expire_time);
        Ok(lease)
    }

    fn missing(&self, id: &LeaseId) -> WardenError {
        if locked(&self.recently_revoked).contains(id) {
            WardenError::lease_already_revoked(id.as_str())
        } else {
            WardenError::lease_not_found(id.as_str())
        }
    }

    /// Revoke a lease now.
    ///
    /// A backend failure does not fail the call: the lease moves to pending
    /// revocation and the outcome says so. Irrevocable leases get one more
    /// attempt.
    pub async fn revoke(&self, id: &LeaseId) -> Result<RevokeOutcome> {
        let _guard = self.store.lock(id).await;
        let lease = self.store.get(id).await.ok_or_else(|| self.missing(id))?;
        self.attempt_revocation(lease, "revoked").await
    }

    /// Drop the lease record without asking the backend
    pub async fn revoke_force(&self, id: &LeaseId) -> Result<()> {
        let _guard = self.store.lock(id).await;
        let lease = self.store.get(id).await.ok_or_else(|| self.missing(id))?;

        self.store.delete(id).await?;
        self.schedule.write().await.remove(id);
        locked(&self.recently_revoked).insert(id.clone());
        record_lease_revoked(&lease.mount_path, "forced");
        if lease.state == LeaseState::Irrevocable {
            self.refresh_irrevocable_gauge().await;
        }
        warn!(lease_id = %id, state = %lease.state, "Lease removed without backend revocation");
        Ok(())
    }

    /// Revoke every lease whose id falls under `prefix`
    pub async fn revoke_prefix(&self, prefix: &str, force: bool) -> Result<PrefixRevocation> {
        let leases = self.store.list_by_prefix(prefix).await;
        let mut summary = PrefixRevocation::default();

        for lease in leases {
            if force {
                match self.revoke_force(&lease.id).await {
                    Ok(()) => summary.revoked += 1,
                    Err(WardenError::LeaseNotFound { .. } | WardenError::LeaseAlreadyRevoked { .. }) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            match self.revoke(&lease.id).await {
                Ok(RevokeOutcome::Revoked) => summary.revoked += 1,
                Ok(_) => summary.pending += 1,
                Err(WardenError::LeaseNotFound { .. } | WardenError::LeaseAlreadyRevoked { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(prefix = %prefix, revoked = summary.revoked, pending = summary.pending, force, "Prefix revocation finished");
        Ok(summary)
    }

    /// Put irrevocable leases back into the revocation queue, optionally only
    /// those of one mount. Returns how many were requeued.
    pub async fn retry_irrevocable(&self, mount_path: Option<&str>) -> Result<usize> {
        let candidates = self.store.in_state(LeaseState::Irrevocable).await;
        let mut requeued = 0;

        for candidate in candidates {
            if mount_path.is_some_and(|mount| candidate.mount_path != mount) {
                continue;
            }
            let _guard = self.store.lock(&candidate.id).await;
            let Some(mut lease) = self.store.get(&candidate.id).await else { continue };
            if lease.state != LeaseState::Irrevocable {
                continue;
            }

            let now = self.clock.now();
            lease.state = LeaseState::PendingRevocation;
            lease.revocation_attempts = 0;
            lease.next_attempt = Some(now);
            self.store.update(&lease).await?;
            self.schedule.write().await.insert(lease.id.clone(), now);
            requeued += 1;
        }

        self.refresh_irrevocable_gauge().await;
        info!(requeued, mount = mount_path.unwrap_or("*"), "Irrevocable leases requeued");
        Ok(requeued)
    }

    /// Load leases from storage and rebuild the schedule
    pub async fn restore(&self) -> Result<usize> {
        let count = self.store.load().await?;
        let leases = self.store.all().await;

        let mut schedule = self.schedule.write().await;
        schedule.clear();
        for lease in &leases {
            if let Some(at) = lease.wake_time() {
                schedule.insert(lease.id.clone(), at);
            }
        }
        let scheduled = schedule.len();
        drop(schedule);

        self.refresh_irrevocable_gauge().await;
        info!(leases = count, scheduled, "Expiration schedule restored");
        Ok(count)
    }

    /// Revoke everything due now. Returns how many leases were attempted.
    pub async fn process_due(&self) -> usize {
        let now = self.clock.now();
        let due = self.schedule.write().await.take_due(now);
        if due.is_empty() {
            return 0;
        }

        debug!(due = due.len(), "Processing due leases");
        let attempted = due.len();
        futures::stream::iter(due)
            .for_each_concurrent(self.config.revocation_concurrency, |id| async move {
                if let Err(e) = self.revoke_due(&id).await {
                    error!(lease_id = %id, error = %e, "Failed to process due lease");
                }
            })
            .await;
        attempted
    }

    async fn revoke_due(&self, id: &LeaseId) -> Result<()> {
        let _guard = self.store.lock(id).await;
        let Some(lease) = self.store.get(id).await else {
            return Ok(());
        };

        let Some(wake) = lease.wake_time() else {
            return Ok(());
        };
        if wake > self.clock.now() {
            // Renewed or rescheduled since it was taken off the queue
            self.schedule.write().await.insert(id.clone(), wake);
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.schedule.write().await.insert(id.clone(), wake);
            return Ok(());
        }

        self.attempt_revocation(lease, "expired").await.map(|_| ())
    }

    /// One backend revocation attempt. The caller holds the lease lock.
    async fn attempt_revocation(&self, mut lease: Lease, reason: &str) -> Result<RevokeOutcome> {
        let attempt = lease.revocation_attempts + 1;
        let ctx = CallContext::with_timeout(self.config.revocation_timeout());
        let span = crate::lease_span!("revoke", lease.id, attempt = attempt, mount = %lease.mount_path);
        let result = ctx.run("revoke", self.revoker.revoke(&ctx, &lease)).instrument(span).await;
        let was_irrevocable = lease.state == LeaseState::Irrevocable;

        match result {
            Ok(()) => {
                self.store.delete(&lease.id).await?;
                self.schedule.write().await.remove(&lease.id);
                locked(&self.recently_revoked).insert(lease.id.clone());
                record_lease_revoked(&lease.mount_path, reason);
                if was_irrevocable {
                    self.refresh_irrevocable_gauge().await;
                }
                info!(lease_id = %lease.id, reason, "Lease revoked");
                Ok(RevokeOutcome::Revoked)
            }
            Err(e) => {
                let now = self.clock.now();
                lease.revocation_attempts = attempt;
                lease.last_revocation_error = Some(e.to_string());

                if !was_irrevocable && self.policy.allows(attempt) {
                    let next = saturating_add(now, self.policy.backoff(attempt));
                    lease.state = LeaseState::PendingRevocation;
                    lease.next_attempt = Some(next);
                    self.store.update(&lease).await?;
                    self.schedule.write().await.insert(lease.id.clone(), next);
                    record_revocation_failure(&lease.mount_path, false);
                    warn!(
                        lease_id = %lease.id,
                        attempt,
                        next_attempt = %next,
                        error = %e,
                        "Revocation failed, will retry"
                    );
                    Ok(RevokeOutcome::Pending)
                } else {
                    lease.state = LeaseState::Irrevocable;
                    lease.next_attempt = None;
                    self.store.update(&lease).await?;
                    self.schedule.write().await.remove(&lease.id);
                    record_revocation_failure(&lease.mount_path, true);
                    self.refresh_irrevocable_gauge().await;
                    error!(
                        lease_id = %lease.id,
                        attempts = attempt,
                        error = %e,
                        "Revocation retries exhausted, lease is irrevocable"
                    );
                    Ok(RevokeOutcome::Irrevocable)
                }
            }
        }
    }

    async fn refresh_irrevocable_gauge(&self) {
        set_irrevocable_leases(self.store.in_state(LeaseState::Irrevocable).await.len());
    }

    /// Start the watcher task
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = locked(&self.state);
            if *state != WatcherState::Idle {
                return Err(WardenError::internal(format!("expiration watcher cannot start from {:?}", *state)));
            }
            *state = WatcherState::Watching;
        }

        let manager = Arc::clone(self);
        let tick = self.config.tick_interval();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_ms = tick.as_millis() as u64, "Expiration watcher started");

            loop {
                tokio::select! {
                    biased;
                    _ = manager.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.process_due().await;
                    }
                }
            }
            debug!("Expiration watcher loop exited");
        });
        Ok(())
    }

    /// Stop the watcher and wait up to `grace` for in-flight revocations.
    ///
    /// Returns false when the grace period ran out first. Calling it again is
    /// a no-op.
    pub async fn stop(&self, grace: Duration) -> bool {
        {
            let mut state = locked(&self.state);
            match *state {
                WatcherState::Stopping | WatcherState::Stopped => return true,
                WatcherState::Idle | WatcherState::Watching => *state = WatcherState::Stopping,
            }
        }

        self.shutdown.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !drained {
            warn!(grace_ms = grace.as_millis() as u64, "Revocations still in flight after grace period");
        }

        *locked(&self.state) = WatcherState::Stopped;
        info!(drained, "Expiration watcher stopped");
        drained
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lease::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Revoker whose failures can be switched on
    #[derive(Debug, Default)]
    pub(crate) struct FakeRevoker {
        pub fail: AtomicBool,
        pub calls: AtomicU32,
    }

    impl FakeRevoker {
        pub(crate) fn failing() -> Self {
            Self { fail: AtomicBool::new(true), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl Revoker for FakeRevoker {
        async fn revoke(&self, _ctx: &CallContext, _lease: &Lease) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(WardenError::backend("connection refused"));
            }
            Ok(())
        }
    }

    pub(crate) fn lease_config(max_attempts: u32) -> LeaseConfig {
        LeaseConfig {
            revocation_max_attempts: max_attempts,
            revocation_backoff_base_ms: 1000,
            revocation_backoff_max_ms: 10_000,
            revocation_jitter: 0.0,
            tick_interval_ms: 10,
            ..LeaseConfig::default()
        }
    }

    pub(crate) fn manager(
        revoker: Arc<FakeRevoker>,
        config: LeaseConfig,
    ) -> (Arc<ExpirationManager>, Arc<MemoryStorage>, ManualClock) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::default();
        let store = Arc::new(LeaseStore::new(storage.clone(), Arc::new(clock.clone())));
        (Arc::new(ExpirationManager::new(store, revoker, config)), storage, clock)
    }

    pub(crate) fn request(mount: &str, ttl_seconds: u64) -> LeaseRequest {
        LeaseRequest {
            mount_path: mount.to_string(),
            mount_accessor: format!("{}-accessor", mount.trim_end_matches('/')),
            path: format!("{}creds/ro", mount),
            client_token: None,
            ttl: Duration::from_secs(ttl_seconds),
            renewable: true,
            secret: json!({"username": "v-user"}),
        }
    }

    #[tokio::test]
    async fn test_expired_lease_is_revoked() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(3));
        let lease = manager.register(request("database/", 60)).await.unwrap();

        assert_eq!(manager.process_due().await, 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(manager.process_due().await, 1);

        assert_eq!(revoker.calls.load(Ordering::SeqCst), 1);
        assert!(manager.store().get(&lease.id).await.is_none());
        assert_eq!(manager.scheduled().await, 0);

        let renewed = manager.renew(&lease.id, Duration::ZERO, Duration::from_secs(3600)).await;
        assert!(matches!(renewed, Err(WardenError::LeaseNotFound { .. })));
    }

    #[tokio::test]
    async fn test_failures_back_off_then_become_irrevocable() {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(3));
        let lease = manager.register(request("database/", 60)).await.unwrap();

        clock.advance(Duration::from_secs(60));
        manager.process_due().await;
        let pending = manager.store().lookup(&lease.id).await.unwrap();
        assert_eq!(pending.state, LeaseState::PendingRevocation);
        assert_eq!(pending.revocation_attempts, 1);
        assert_eq!(pending.next_attempt, Some(clock.now() + chrono::Duration::seconds(1)));

        // Not due again until the backoff passes
        assert_eq!(manager.process_due().await, 0);
        clock.advance(Duration::from_secs(1));
        manager.process_due().await;
        clock.advance(Duration::from_secs(2));
        manager.process_due().await;

        let irrevocable = manager.store().lookup(&lease.id).await.unwrap();
        assert_eq!(irrevocable.state, LeaseState::Irrevocable);
        assert_eq!(irrevocable.revocation_attempts, 3);
        assert!(irrevocable.last_revocation_error.is_some());
        assert_eq!(manager.store().count_active().await, 0);

        // Never retried on its own
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(manager.process_due().await, 0);
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_irrevocable_requeues() {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(1));
        let db = manager.register(request("database/", 10)).await.unwrap();
        let aws = manager.register(request("aws/", 10)).await.unwrap();

        clock.advance(Duration::from_secs(10));
        manager.process_due().await;
        assert_eq!(manager.store().in_state(LeaseState::Irrevocable).await.len(), 2);

        revoker.fail.store(false, Ordering::SeqCst);
        assert_eq!(manager.retry_irrevocable(Some("database/")).await.unwrap(), 1);
        manager.process_due().await;

        assert!(manager.store().get(&db.id).await.is_none());
        assert_eq!(manager.store().lookup(&aws.id).await.unwrap().state, LeaseState::Irrevocable);
    }

    #[tokio::test]
    async fn test_explicit_revoke() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, _) = manager(revoker.clone(), lease_config(3));
        let lease = manager.register(request("database/", 600)).await.unwrap();

        assert_eq!(manager.revoke(&lease.id).await.unwrap(), RevokeOutcome::Revoked);
        assert!(matches!(manager.revoke(&lease.id).await, Err(WardenError::LeaseAlreadyRevoked { .. })));

        let unknown = LeaseId::generate("database/creds/ro");
        assert!(matches!(manager.revoke(&unknown).await, Err(WardenError::LeaseNotFound { .. })));
    }

    #[tokio::test]
    async fn test_explicit_revoke_failure_is_pending() {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(3));
        let lease = manager.register(request("database/", 600)).await.unwrap();

        assert_eq!(manager.revoke(&lease.id).await.unwrap(), RevokeOutcome::Pending);
        let pending = manager.store().lookup(&lease.id).await.unwrap();
        assert_eq!(pending.state, LeaseState::PendingRevocation);

        revoker.fail.store(false, Ordering::SeqCst);
        clock.advance(Duration::from_secs(1));
        assert_eq!(manager.process_due().await, 1);
        assert!(manager.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_revoke_force_skips_backend() {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, storage, _) = manager(revoker.clone(), lease_config(3));
        let lease = manager.register(request("database/", 600)).await.unwrap();

        manager.revoke_force(&lease.id).await.unwrap();
        assert_eq!(revoker.calls.load(Ordering::SeqCst), 0);
        assert!(storage.is_empty().await);
        assert_eq!(manager.scheduled().await, 0);
    }

    #[tokio::test]
    async fn test_revoke_prefix() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, _) = manager(revoker.clone(), lease_config(3));
        for mount in ["database/", "database/", "aws/"] {
            manager.register(request(mount, 600)).await.unwrap();
        }

        let summary = manager.revoke_prefix("database/", false).await.unwrap();
        assert_eq!(summary, PrefixRevocation { revoked: 2, pending: 0 });
        assert_eq!(manager.store().len().await, 1);

        revoker.fail.store(true, Ordering::SeqCst);
        let forced = manager.revoke_prefix("aws/", true).await.unwrap();
        assert_eq!(forced.revoked, 1);
        assert!(manager.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_schedule() {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, storage, clock) = manager(revoker.clone(), lease_config(1));
        manager.register(request("database/", 60)).await.unwrap();
        manager.register(request("database/", 10)).await.unwrap();
        clock.advance(Duration::from_secs(10));
        manager.process_due().await;

        let store = Arc::new(LeaseStore::new(storage, Arc::new(clock.clone())));
        let restored = ExpirationManager::new(store, revoker, lease_config(1));
        assert_eq!(restored.restore().await.unwrap(), 2);
        // The irrevocable lease is kept but not scheduled
        assert_eq!(restored.scheduled().await, 1);
    }

    #[tokio::test]
    async fn test_watcher_lifecycle() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(3));
        assert_eq!(manager.state(), WatcherState::Idle);

        manager.register(request("database/", 1)).await.unwrap();
        clock.advance(Duration::from_secs(2));
        manager.start().unwrap();
        assert_eq!(manager.state(), WatcherState::Watching);
        assert!(manager.start().is_err());

        for _ in 0..100 {
            if manager.store().is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.store().is_empty().await);

        assert!(manager.stop(Duration::from_secs(1)).await);
        assert_eq!(manager.state(), WatcherState::Stopped);
        assert!(manager.stop(Duration::from_secs(1)).await);
        assert!(manager.start().is_err());
    }

    #[tokio::test]
    async fn test_due_leases_left_scheduled_after_shutdown() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, clock) = manager(revoker.clone(), lease_config(3));
        manager.register(request("database/", 5)).await.unwrap();

        manager.stop(Duration::from_millis(10)).await;
        clock.advance(Duration::from_secs(5));
        manager.process_due().await;

        assert_eq!(revoker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.scheduled().await, 1);
    }
}
