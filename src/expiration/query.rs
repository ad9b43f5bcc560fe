//! Read-only views over irrevocable leases.

use super::manager::ExpirationManager;
use crate::lease::{Lease, LeaseState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCountResponse {
    pub lease_count: usize,
    /// Keyed by mount accessor
    pub counts_per_mount: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrrevocableLease {
    pub lease_id: String,
    pub mount_id: String,
    pub error: String,
    pub expire_time: DateTime<Utc>,
}

impl From<&Lease> for IrrevocableLease {
    fn from(lease: &Lease) -> Self {
        Self {
            lease_id: lease.id.to_string(),
            mount_id: lease.mount_accessor.clone(),
            error: lease.last_revocation_error.clone().unwrap_or_default(),
            expire_time: lease.expire_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseListResponse {
    pub lease_count: usize,
    /// Keyed by mount accessor, each list ordered by lease id
    pub leases_per_mount: BTreeMap<String, Vec<IrrevocableLease>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExpirationManager {
    pub async fn count_irrevocable(&self) -> LeaseCountResponse {
        let leases = self.store().in_state(LeaseState::Irrevocable).await;
        let mut response = LeaseCountResponse { lease_count: leases.len(), ..Default::default() };
        for lease in &leases {
            *response.counts_per_mount.entry(lease.mount_accessor.clone()).or_default() += 1;
        }
        response
    }

    /// List irrevocable leases. Above the configured limit nothing is listed
    /// unless `force` is set.
    pub async fn list_irrevocable(&self, force: bool) -> LeaseListResponse {
        let mut leases = self.store().in_state(LeaseState::Irrevocable).await;
        let limit = self.config().max_irrevocable_leases_to_return;

        if leases.len() > limit && !force {
            return LeaseListResponse {
                lease_count: leases.len(),
                leases_per_mount: BTreeMap::new(),
                warnings: vec![format!(
                    "{} irrevocable leases exceed the listing limit of {}; use force to list them all",
                    leases.len(),
                    limit
                )],
            };
        }

        leases.sort_by(|a, b| a.id.cmp(&b.id));
        let mut response = LeaseListResponse { lease_count: leases.len(), ..Default::default() };
        for lease in &leases {
            response.leases_per_mount.entry(lease.mount_accessor.clone()).or_default().push(lease.into());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::tests::{lease_config, manager, request, FakeRevoker};
    use crate::config::LeaseConfig;
    use std::sync::Arc;
    use std::time::Duration;

    const MOUNTS: [(&str, usize); 3] = [("database/", 25), ("aws/", 15), ("ssh/", 10)];

    async fn fifty_irrevocable(config: LeaseConfig) -> Arc<super::ExpirationManager> {
        let revoker = Arc::new(FakeRevoker::failing());
        let (manager, _, clock) = manager(revoker, config);
        for (mount, count) in MOUNTS {
            for _ in 0..count {
                manager.register(request(mount, 30)).await.unwrap();
            }
        }
        clock.advance(Duration::from_secs(31));
        assert_eq!(manager.process_due().await, 50);
        manager
    }

    #[tokio::test]
    async fn test_count_matches_distribution() {
        let manager = fifty_irrevocable(lease_config(1)).await;
        let counts = manager.count_irrevocable().await;

        assert_eq!(counts.lease_count, 50);
        assert_eq!(counts.counts_per_mount.len(), 3);
        assert_eq!(counts.counts_per_mount.values().sum::<usize>(), 50);
        assert_eq!(counts.counts_per_mount["database-accessor"], 25);
        assert_eq!(counts.counts_per_mount["aws-accessor"], 15);
        assert_eq!(counts.counts_per_mount["ssh-accessor"], 10);
    }

    #[tokio::test]
    async fn test_list_within_limit() {
        let manager = fifty_irrevocable(lease_config(1)).await;
        let listing = manager.list_irrevocable(false).await;

        assert_eq!(listing.lease_count, 50);
        assert!(listing.warnings.is_empty());
        assert_eq!(listing.leases_per_mount["aws-accessor"].len(), 15);
        assert!(listing.leases_per_mount["ssh-accessor"].iter().all(|l| l.error.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_list_above_limit() {
        let config = LeaseConfig { max_irrevocable_leases_to_return: 10, ..lease_config(1) };
        let manager = fifty_irrevocable(config).await;

        let refused = manager.list_irrevocable(false).await;
        assert_eq!(refused.warnings.len(), 1);
        assert!(refused.leases_per_mount.is_empty());

        let forced = manager.list_irrevocable(true).await;
        assert!(forced.warnings.is_empty());
        assert_eq!(forced.leases_per_mount.values().map(Vec::len).sum::<usize>(), 50);
    }

    #[tokio::test]
    async fn test_empty_when_nothing_failed() {
        let revoker = Arc::new(FakeRevoker::default());
        let (manager, _, _) = manager(revoker, lease_config(1));
        manager.register(request("database/", 30)).await.unwrap();

        assert_eq!(manager.count_irrevocable().await.lease_count, 0);
        assert!(manager.list_irrevocable(false).await.leases_per_mount.is_empty());
    }
}
