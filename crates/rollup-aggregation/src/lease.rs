//! Partition leases with epoch fencing
//!
//! A consumer instance must hold the lease of a partition before it reads
//! or commits. Leases are stored under `lease/{partition}`:
//!
//! 1. **Acquire**: succeeds when no lease exists, the lease has expired, or
//!    the caller already owns it. Every acquisition increments the epoch.
//! 2. **Renew**: a background task extends the lease at a fixed interval
//!    shorter than the TTL. Renewal fails once another owner or epoch has
//!    taken over.
//! 3. **Release**: expires the lease immediately but keeps its epoch, so
//!    the next owner still gets a higher one.
//!
//! All transitions are compare-and-set writes against the version read.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rollup_common::config::CheckpointConfig;
use rollup_common::error::{CheckpointError, Error, Result};
use rollup_common::metrics;
use rollup_common::types::Timestamp;
use rollup_storage::{decode, encode, keys, CasOutcome, DurableStore, Versioned};

use crate::clock::SharedClock;

/// Exclusive right to consume one partition until `expires_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub partition_key: String,
    pub owner: String,
    pub epoch: u64,
    pub expires_at: Timestamp,
}

impl Lease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

pub struct LeaseManager {
    owner: String,
    store: Arc<dyn DurableStore>,
    clock: SharedClock,
    ttl_ms: i64,
    renew_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        owner: impl Into<String>,
        store: Arc<dyn DurableStore>,
        clock: SharedClock,
        config: &CheckpointConfig,
    ) -> Self {
        Self {
            owner: owner.into(),
            store,
            clock,
            ttl_ms: config.lease_ttl_ms,
            renew_interval: Duration::from_millis(
                u64::try_from(config.lease_renew_interval_ms).unwrap_or(0),
            ),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take the lease of `partition_key`, or fail with `LeaseHeld`
    pub async fn acquire(&self, partition_key: &str) -> Result<Lease> {
        let key = keys::lease(partition_key);
        let mut current = self.read(&key).await?;

        loop {
            let now = self.clock.now_millis();
            let (expected, epoch) = match &current {
                Some((version, held)) => {
                    if held.owner != self.owner && !held.is_expired(now) {
                        return Err(Error::Checkpoint(CheckpointError::LeaseHeld {
                            partition_key: partition_key.to_string(),
                            owner: held.owner.clone(),
                            expires_at: held.expires_at,
                        }));
                    }
                    (Some(*version), held.epoch + 1)
                }
                None => (None, 1),
            };

            let lease = Lease {
                partition_key: partition_key.to_string(),
                owner: self.owner.clone(),
                epoch,
                expires_at: now.saturating_add(self.ttl_ms),
            };

            match self.store.compare_and_set(&key, expected, encode(&lease)?).await? {
                CasOutcome::Applied { .. } => {
                    info!(
                        "Acquired lease on partition {} (owner {}, epoch {})",
                        partition_key, self.owner, epoch
                    );
                    metrics::record_lease_event("acquired");
                    return Ok(lease);
                }
                CasOutcome::Conflict { current: latest } => {
                    debug!("Lease race on partition {}, re-reading", partition_key);
                    current = latest.map(|v| decode_versioned(&v)).transpose()?;
                }
            }
        }
    }

    /// Extend a lease this manager holds
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let key = keys::lease(&lease.partition_key);
        let version = self.owned_version(&key, lease).await?;

        let renewed = Lease {
            expires_at: self.clock.now_millis().saturating_add(self.ttl_ms),
            ..lease.clone()
        };

        match self
            .store
            .compare_and_set(&key, Some(version), encode(&renewed)?)
            .await?
        {
            CasOutcome::Applied { .. } => {
                metrics::record_lease_event("renewed");
                Ok(renewed)
            }
            CasOutcome::Conflict { .. } => Err(self.lost(lease)),
        }
    }

    /// Give the lease up so another instance can take over immediately
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let key = keys::lease(&lease.partition_key);
        let version = match self.owned_version(&key, lease).await {
            Ok(version) => version,
            // Someone else already owns it; nothing to release
            Err(Error::Checkpoint(CheckpointError::LeaseLost { .. })) => return Ok(()),
            Err(e) => return Err(e),
        };

        let released = Lease {
            expires_at: self.clock.now_millis(),
            ..lease.clone()
        };
        if self
            .store
            .compare_and_set(&key, Some(version), encode(&released)?)
            .await?
            .is_applied()
        {
            info!(
                "Released lease on partition {} (epoch {})",
                lease.partition_key, lease.epoch
            );
            metrics::record_lease_event("released");
        }
        Ok(())
    }

    /// Fail with `LeaseLost` unless `lease` is still the stored lease
    pub async fn check(&self, lease: &Lease) -> Result<()> {
        self.owned_version(&keys::lease(&lease.partition_key), lease)
            .await
            .map(|_| ())
    }

    /// Stored lease of `partition_key`
    pub async fn current(&self, partition_key: &str) -> Result<Option<Lease>> {
        Ok(self
            .read(&keys::lease(partition_key))
            .await?
            .map(|(_, lease)| lease))
    }

    /// Renew `lease` in the background until `parent` is cancelled or the
    /// lease is lost
    pub fn keep_alive(self: &Arc<Self>, lease: Lease, parent: &CancellationToken) -> LeaseGuard {
        let shared = Arc::new(RwLock::new(lease));
        let lost = CancellationToken::new();
        let stop = parent.child_token();

        let handle = tokio::spawn(renew_loop(
            self.clone(),
            shared.clone(),
            lost.clone(),
            stop.clone(),
        ));

        LeaseGuard {
            lease: shared,
            lost,
            stop,
            handle: Some(handle),
        }
    }

    async fn owned_version(&self, key: &str, lease: &Lease) -> Result<u64> {
        match self.read(key).await? {
            Some((version, stored))
                if stored.owner == lease.owner && stored.epoch == lease.epoch =>
            {
                Ok(version)
            }
            _ => Err(self.lost(lease)),
        }
    }

    fn lost(&self, lease: &Lease) -> Error {
        metrics::record_lease_event("lost");
        Error::Checkpoint(CheckpointError::LeaseLost {
            partition_key: lease.partition_key.clone(),
            epoch: lease.epoch,
        })
    }

    async fn read(&self, key: &str) -> Result<Option<(u64, Lease)>> {
        self.store
            .get(key)
            .await?
            .map(|v| decode_versioned(&v))
            .transpose()
    }
}

fn decode_versioned(versioned: &Versioned) -> Result<(u64, Lease)> {
    Ok((versioned.version, decode(&versioned.value)?))
}

async fn renew_loop(
    manager: Arc<LeaseManager>,
    lease: Arc<RwLock<Lease>>,
    lost: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            () = tokio::time::sleep(manager.renew_interval) => {}
        }

        let current = lease.read().clone();
        match manager.renew(&current).await {
            Ok(renewed) => *lease.write() = renewed,
            Err(e) if e.is_transient() && !current.is_expired(manager.clock.now_millis()) => {
                warn!(
                    "Lease renewal for partition {} failed, will retry: {}",
                    current.partition_key, e
                );
            }
            Err(e) => {
                warn!("Lost lease on partition {}: {}", current.partition_key, e);
                lost.cancel();
                break;
            }
        }
    }
}

/// Handle to a lease kept alive by a background renewal task
pub struct LeaseGuard {
    lease: Arc<RwLock<Lease>>,
    lost: CancellationToken,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    /// Latest renewed lease
    pub fn lease(&self) -> Lease {
        self.lease.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lease.read().epoch
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Token cancelled when renewal fails for good
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop renewing and return the last lease. A renewal task that
    /// panicked or was aborted marks the lease lost.
    pub async fn stop(mut self) -> Lease {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(
                    "Lease renewal task for partition {} did not finish cleanly: {}",
                    self.lease.read().partition_key,
                    e
                );
                self.lost.cancel();
            }
        }
        self.lease()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use rollup_storage::MemoryStore;

    fn config() -> CheckpointConfig {
        CheckpointConfig {
            lease_ttl_ms: 1_000,
            lease_renew_interval_ms: 20,
        }
    }

    fn managers() -> (Arc<LeaseManager>, Arc<LeaseManager>, Arc<ManualClock>) {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = LeaseManager::new("a", store.clone(), clock.clone(), &config());
        let b = LeaseManager::new("b", store, clock.clone(), &config());
        (Arc::new(a), Arc::new(b), clock)
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let (a, b, clock) = managers();

        let lease = a.acquire("u1").await.unwrap();
        assert_eq!(lease.epoch, 1);

        let err = b.acquire("u1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Checkpoint(CheckpointError::LeaseHeld { ref owner, .. }) if owner == "a"
        ));

        clock.set(1_000);
        let taken = b.acquire("u1").await.unwrap();
        assert_eq!(taken.epoch, 2);

        // The old owner is fenced off
        assert!(a.renew(&lease).await.unwrap_err().is_fatal_to_consumer());
        assert!(a.check(&lease).await.is_err());
        b.check(&taken).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (a, b, clock) = managers();
        let lease = a.acquire("u1").await.unwrap();

        clock.set(900);
        let renewed = a.renew(&lease).await.unwrap();
        assert_eq!(renewed.expires_at, 1_900);

        clock.set(1_500);
        assert!(b.acquire("u1").await.is_err());
    }

    #[tokio::test]
    async fn test_release_hands_over_with_higher_epoch() {
        let (a, b, _) = managers();
        let lease = a.acquire("u1").await.unwrap();
        a.release(&lease).await.unwrap();

        let next = b.acquire("u1").await.unwrap();
        assert_eq!(next.epoch, 2);

        // Releasing a lease already taken over is a no-op
        a.release(&lease).await.unwrap();
        b.check(&next).await.unwrap();
    }

    #[tokio::test]
    async fn test_reacquire_by_same_owner_bumps_epoch() {
        let (a, _, _) = managers();
        let first = a.acquire("u1").await.unwrap();
        let second = a.acquire("u1").await.unwrap();
        assert_eq!(second.epoch, first.epoch + 1);
        assert!(a.check(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_keep_alive_detects_takeover() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let a = Arc::new(LeaseManager::new("a", store.clone(), clock, &config()));

        let lease = a.acquire("u1").await.unwrap();
        let root = CancellationToken::new();
        let guard = a.keep_alive(lease.clone(), &root);

        // Another instance fenced us off with a newer epoch
        let stolen = Lease {
            owner: "b".to_string(),
            epoch: lease.epoch + 1,
            ..lease
        };
        store.put(&keys::lease("u1"), encode(&stolen).unwrap()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), guard.lost_token().cancelled())
            .await
            .expect("renewal task should notice the takeover");
        assert!(guard.is_lost());
        guard.stop().await;
    }

    #[tokio::test]
    async fn test_keep_alive_renews() {
        let (a, _, clock) = managers();
        let lease = a.acquire("u1").await.unwrap();
        let guard = a.keep_alive(lease, &CancellationToken::new());

        clock.set(500);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.lease().expires_at >= 1_500);
        assert!(!guard.is_lost());

        let last = guard.stop().await;
        a.release(&last).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_renewal_task_died_marks_lease_lost() {
        let (a, _, clock) = managers();
        let lease = a.acquire("u1").await.unwrap();
        let guard = a.keep_alive(lease.clone(), &CancellationToken::new());
        let lost = guard.lost_token();

        if let Some(handle) = &guard.handle {
            handle.abort();
        }
        let last = guard.stop().await;
        assert!(lost.is_cancelled());
        assert_eq!(last.epoch, lease.epoch);

        // The stored lease is still ours to release
        a.release(&last).await.unwrap();
        let stored = a.current("u1").await.unwrap().unwrap();
        assert!(stored.is_expired(clock.now_millis()));
    }
}
