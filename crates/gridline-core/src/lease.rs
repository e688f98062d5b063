//! Leader election over a lease record.
//!
//! [`LeaderElector`] is a two-state machine. In `Standby` it retries acquisition every
//! retry period. Once `Leading` it starts the leader task with a child cancellation token and
//! renews the lease; a renewal that cannot succeed within the renew deadline cancels the leader
//! task and reports [`FatalError::LeadershipLost`] through the [`Lifecycle`]. There is no way
//! back to `Standby` while the process lives, except through shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ClusterError, ClusterResult, FatalError};
use crate::lifecycle::Lifecycle;

/// Snapshot of a lease as stored in the cluster.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LeaseRecord {
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    /// Optimistic-concurrency token. Updates carrying a stale one fail with `Conflict`.
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    fn same_term(&self, other: &LeaseRecord) -> bool {
        self.holder_identity == other.holder_identity
            && self.renew_time == other.renew_time
            && self.acquire_time == other.acquire_time
            && self.lease_transitions == other.lease_transitions
    }
}

/// Storage for one named lease.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Identity this process writes as holder.
    fn identity(&self) -> &str;

    async fn get(&self) -> ClusterResult<Option<LeaseRecord>>;

    /// Fails with `Conflict` if the lease already exists.
    async fn create(&self, record: &LeaseRecord) -> ClusterResult<LeaseRecord>;

    /// Fails with `Conflict` if `record.resource_version` is stale.
    async fn update(&self, record: &LeaseRecord) -> ClusterResult<LeaseRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionConfig {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Standby,
    Leading,
}

struct Observed {
    record: LeaseRecord,
    at: Instant,
}

enum Renewal {
    Renewed,
    Lost,
    Shutdown,
}

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: ElectionConfig,
    state: watch::Sender<LeaderState>,
    observed: Option<Observed>,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: ElectionConfig) -> Self {
        let (state, _) = watch::channel(LeaderState::Standby);
        Self {
            lock,
            config,
            state,
            observed: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Campaign until leading, run `leader_task`, and keep the lease until shutdown.
    pub async fn run<F, Fut>(mut self, lifecycle: Lifecycle, leader_task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = lifecycle.shutdown_token();
        let identity = self.lock.identity().to_string();
        info!(identity = %identity, "campaigning for leadership");

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return,
                attempt = self.try_acquire_or_renew() => attempt,
            };
            match attempt {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "lease acquisition failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        info!(identity = %identity, "acquired leadership");
        self.state.send_replace(LeaderState::Leading);
        let leading = shutdown.child_token();
        lifecycle.spawn("leader-task", leader_task(leading.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            match self.renew_within_deadline(&shutdown).await {
                Renewal::Renewed => {}
                Renewal::Shutdown => break,
                Renewal::Lost => {
                    leading.cancel();
                    self.state.send_replace(LeaderState::Standby);
                    error!(identity = %identity, "failed to renew lease within deadline");
                    lifecycle.fail(FatalError::LeadershipLost);
                    return;
                }
            }
        }

        leading.cancel();
        self.release().await;
        self.state.send_replace(LeaderState::Standby);
    }

    async fn renew_within_deadline(&mut self, shutdown: &CancellationToken) -> Renewal {
        let deadline = Instant::now() + self.config.renew_deadline;
        loop {
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Err(_) => return Renewal::Lost,
                Ok(Ok(true)) => return Renewal::Renewed,
                Ok(Ok(false)) => debug!("lease renewal refused"),
                Ok(Err(err)) => warn!(error = %err, "lease renewal failed"),
            }
            if Instant::now() + self.config.retry_period >= deadline {
                return Renewal::Lost;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Renewal::Shutdown,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// One election round. `Ok(true)` means this process holds the lease afterwards.
    pub async fn try_acquire_or_renew(&mut self) -> ClusterResult<bool> {
        let now = Utc::now();
        let identity = self.lock.identity().to_string();
        let duration_secs = i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX);

        let current = match self.lock.get().await? {
            Some(current) => current,
            None => {
                let fresh = LeaseRecord {
                    holder_identity: Some(identity),
                    lease_duration_seconds: duration_secs,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_transitions: 0,
                    resource_version: None,
                };
                return match self.lock.create(&fresh).await {
                    Ok(created) => {
                        self.observe(created);
                        Ok(true)
                    }
                    Err(ClusterError::Conflict) => Ok(false),
                    Err(err) => Err(err),
                };
            }
        };

        self.observe(current.clone());
        let held_by_us = current.holder() == Some(identity.as_str());
        if let Some(holder) = current.holder() {
            if !held_by_us && !self.observed_expired() {
                return Ok(false);
            }
            if !held_by_us {
                info!(previous = %holder, "previous leader's lease expired");
            }
        }

        let mut next = current.clone();
        if !held_by_us {
            next.lease_transitions += 1;
            next.acquire_time = Some(now);
        }
        next.holder_identity = Some(identity);
        next.lease_duration_seconds = duration_secs;
        next.renew_time = Some(now);

        match self.lock.update(&next).await {
            Ok(updated) => {
                self.observe(updated);
                Ok(true)
            }
            Err(ClusterError::Conflict) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn observe(&mut self, record: LeaseRecord) {
        let changed = match &self.observed {
            Some(seen) => !seen.record.same_term(&record),
            None => true,
        };
        if changed {
            if let Some(holder) = record.holder() {
                if holder != self.lock.identity() {
                    info!(leader = %holder, "observed leader");
                }
            }
            self.observed = Some(Observed {
                record,
                at: Instant::now(),
            });
        } else if let Some(seen) = self.observed.as_mut() {
            seen.record.resource_version = record.resource_version;
        }
    }

    fn observed_expired(&self) -> bool {
        match &self.observed {
            Some(seen) => {
                let secs = u64::try_from(seen.record.lease_duration_seconds).unwrap_or(0);
                seen.at + Duration::from_secs(secs) <= Instant::now()
            }
            None => true,
        }
    }

    /// Hand the lease back so the next replica need not wait for expiry.
    async fn release(&mut self) {
        let identity = self.lock.identity().to_string();
        match tokio::time::timeout(self.config.renew_deadline, self.release_once(&identity)).await {
            Ok(Ok(())) => info!(identity = %identity, "released leadership"),
            Ok(Err(err)) => warn!(error = %err, "failed to release lease"),
            Err(_) => warn!("timed out releasing lease"),
        }
    }

    async fn release_once(&self, identity: &str) -> ClusterResult<()> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if current.holder() != Some(identity) {
            return Ok(());
        }
        let now = Utc::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration_seconds: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            ..current
        };
        self.lock.update(&released).await.map(|_| ())
    }
}
