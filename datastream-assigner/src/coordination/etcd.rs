use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions, WatchStream,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{published_epoch, Coordination, PublishOutcome, TRIGGER_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::types::{
    Assignment, InstanceId, InstanceStatus, PublishedAssignment, RebalanceTrigger,
    RegisteredInstance, StreamGroup,
};
use crate::util;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations (e.g. "/datastream/" or "/test-{uuid}/").
    pub prefix: String,
}

/// All etcd key patterns used by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKey<'a> {
    Instance(&'a str),
    InstancesPrefix,
    StreamGroup(&'a str),
    StreamGroupsPrefix,
    Assignment,
    Leader,
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Instance(id) => format!("{prefix}instances/{id}"),
            StoreKey::InstancesPrefix => format!("{prefix}instances/"),
            StoreKey::StreamGroup(id) => format!("{prefix}stream-groups/{id}"),
            StoreKey::StreamGroupsPrefix => format!("{prefix}stream-groups/"),
            StoreKey::Assignment => format!("{prefix}assignment"),
            StoreKey::Leader => format!("{prefix}coordinator/leader"),
        }
    }
}

/// Which trigger a change under `key` should raise, if any.
fn trigger_for_key(prefix: &str, key: &str) -> Option<RebalanceTrigger> {
    let rest = key.strip_prefix(prefix)?;
    if rest.starts_with("instances/") {
        Some(RebalanceTrigger::MembershipChanged)
    } else if rest.starts_with("stream-groups/") {
        Some(RebalanceTrigger::StreamGroupsChanged)
    } else {
        None
    }
}

/// Sorted ids of instances eligible for tasks.
fn active_instance_names(instances: &[RegisteredInstance]) -> BTreeSet<InstanceId> {
    instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Ready)
        .map(|i| i.instance_id.clone())
        .collect()
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Identifier for this candidate (e.g. pod name).
    pub name: String,
    /// TTL for the leader lease. If the leader dies, the key expires after this.
    pub lease_ttl: i64,
    /// How often to send keepalive pings.
    pub keepalive_interval: Duration,
    /// How long to wait before retrying after failing to acquire leadership.
    pub retry_interval: Duration,
}

/// Written to the leader key when leadership is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub holder: String,
    pub lease_id: i64,
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub instance_id: InstanceId,
    pub lease_ttl: i64,
    pub keepalive_interval: Duration,
}

/// etcd-backed coordination.
///
/// Instances register under a lease and vanish from the live set when it
/// expires. The elected coordinator's lease fences publication: an
/// assignment is only written while this process's lease still owns the
/// leader key, and only over the exact assignment version it read.
///
/// `Client` is `Clone` (it wraps an inner `Arc`), so each method clones it.
#[derive(Clone)]
pub struct EtcdCoordination {
    client: Client,
    config: StoreConfig,
    /// Lease backing our leader record, 0 when not leading.
    leader_lease: Arc<AtomicI64>,
}

impl EtcdCoordination {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self {
            client,
            config,
            leader_lease: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.config.prefix)
    }

    // ── JSON helpers ─────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.get_versioned(key).await?.map(|(value, _)| value))
    }

    async fn get_versioned<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, i64)>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => {
                let value = serde_json::from_slice(kv.value())?;
                Ok(Some((value, kv.version())))
            }
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(Error::from))
            .collect()
    }

    async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        options: Option<PutOptions>,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let options = WatchOptions::new().with_prefix();
        Ok(self.client.clone().watch(prefix, Some(options)).await?)
    }

    // ── Lease operations ────────────────────────────────────────

    pub async fn grant_lease(&self, ttl: i64) -> Result<i64> {
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    pub async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    /// Refresh `lease_id` every `interval` until `cancel` fires.
    ///
    /// Fails as soon as etcd reports the lease gone, either by closing the
    /// response stream or by answering with a zero TTL. By then every key
    /// attached to the lease has been deleted.
    async fn keep_lease_alive(
        &self,
        lease_id: i64,
        interval: Duration,
        holder: LeaseHolder,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mut keeper, mut responses) = self.client.clone().lease_keep_alive(lease_id).await?;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            keeper.keep_alive().await?;
            let ttl = responses.message().await?.map(|resp| resp.ttl());
            match holder.refreshed(lease_id, ttl) {
                Ok(ttl) => tracing::trace!(lease_id, ttl, ?holder, "lease refreshed"),
                Err(e) => {
                    tracing::warn!(lease_id, ?holder, "lease lapsed");
                    return Err(e);
                }
            }
        }
    }

    // ── Instance operations ─────────────────────────────────────

    pub async fn register_instance(&self, instance: &RegisteredInstance, lease_id: i64) -> Result<()> {
        util::validate_identifier(&instance.instance_id)?;
        self.put_json(
            &self.key(StoreKey::Instance(&instance.instance_id)),
            instance,
            Some(PutOptions::new().with_lease(lease_id)),
        )
        .await
    }

    pub async fn list_instances(&self) -> Result<Vec<RegisteredInstance>> {
        self.list_json(&self.key(StoreKey::InstancesPrefix)).await
    }

    /// Change an instance's status, keeping its lease attached.
    pub async fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        let key = self.key(StoreKey::Instance(instance_id));
        let mut instance: RegisteredInstance = self
            .get_json(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?;
        instance.status = status;
        self.put_json(&key, &instance, Some(PutOptions::new().with_ignore_lease()))
            .await
    }

    /// Register this instance and keep its lease alive until cancelled.
    ///
    /// On shutdown the instance is marked draining and its lease revoked so
    /// the coordinator reassigns its tasks without waiting for the TTL.
    pub async fn run_membership(&self, config: MembershipConfig, cancel: CancellationToken) -> Result<()> {
        let lease_id = self.grant_lease(config.lease_ttl).await?;
        let instance = RegisteredInstance {
            instance_id: config.instance_id.clone(),
            status: InstanceStatus::Ready,
            registered_at: util::now_seconds(),
        };
        self.register_instance(&instance, lease_id).await?;
        tracing::info!(instance = %config.instance_id, "registered with etcd");

        let result = self
            .keep_lease_alive(lease_id, config.keepalive_interval, LeaseHolder::Membership, &cancel)
            .await;

        if let Err(e) = self
            .set_instance_status(&config.instance_id, InstanceStatus::Draining)
            .await
        {
            tracing::debug!(instance = %config.instance_id, error = %e, "could not mark instance draining");
        }
        drop(self.revoke_lease(lease_id).await);
        tracing::info!(instance = %config.instance_id, "left the cluster");

        result
    }

    // ── Stream group operations ─────────────────────────────────

    pub async fn put_stream_group(&self, group: &StreamGroup) -> Result<()> {
        util::validate_identifier(&group.id)?;
        self.put_json(&self.key(StoreKey::StreamGroup(&group.id)), group, None)
            .await
    }

    pub async fn delete_stream_group(&self, id: &str) -> Result<()> {
        self.client
            .clone()
            .delete(self.key(StoreKey::StreamGroup(id)), None)
            .await?;
        Ok(())
    }

    // ── Leader election ─────────────────────────────────────────

    pub async fn get_leader(&self) -> Result<Option<LeaderRecord>> {
        self.get_json(&self.key(StoreKey::Leader)).await
    }

    /// CAS: only succeed if the leader key does not exist (version == 0).
    async fn try_acquire(&self, holder: &str, lease_id: i64) -> Result<bool> {
        let key = self.key(StoreKey::Leader);
        let record = LeaderRecord {
            holder: holder.to_string(),
            lease_id,
        };
        let value = serde_json::to_vec(&record)?;

        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key.clone(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(key, None)]);

        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    fn leader_lease(&self) -> Option<i64> {
        match self.leader_lease.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

#[async_trait]
impl Coordination for EtcdCoordination {
    async fn live_instances(&self) -> Result<BTreeSet<InstanceId>> {
        Ok(active_instance_names(&self.list_instances().await?))
    }

    async fn stream_groups(&self) -> Result<Vec<StreamGroup>> {
        self.list_json(&self.key(StoreKey::StreamGroupsPrefix)).await
    }

    async fn current_assignment(&self) -> Result<Option<PublishedAssignment>> {
        self.get_json(&self.key(StoreKey::Assignment)).await
    }

    async fn publish_assignment(
        &self,
        epoch: u64,
        assignment: &Assignment,
    ) -> Result<PublishOutcome> {
        let lease_id = self.leader_lease().ok_or(Error::LeadershipLost)?;
        let key = self.key(StoreKey::Assignment);

        let stored = self.get_versioned::<PublishedAssignment>(&key).await?;
        let version = stored.as_ref().map_or(0, |(_, v)| *v);
        let current_epoch = published_epoch(stored.as_ref().map(|(p, _)| p));
        if epoch != current_epoch + 1 {
            return Ok(PublishOutcome::Conflict { current_epoch });
        }

        let published = PublishedAssignment {
            epoch,
            published_at: util::now_seconds(),
            assignment: assignment.clone(),
        };
        let txn = Txn::new()
            .when(vec![
                Compare::lease(self.key(StoreKey::Leader), CompareOp::Equal, lease_id),
                Compare::version(key.clone(), CompareOp::Equal, version),
            ])
            .and_then(vec![TxnOp::put(
                key,
                serde_json::to_vec(&published)?,
                None,
            )]);

        if self.client.clone().txn(txn).await?.succeeded() {
            return Ok(PublishOutcome::Published(published));
        }

        match self.get_leader().await? {
            Some(leader) if leader.lease_id == lease_id => {
                let current = self.current_assignment().await?;
                Ok(PublishOutcome::Conflict {
                    current_epoch: published_epoch(current.as_ref()),
                })
            }
            _ => Err(Error::LeadershipLost),
        }
    }

    /// Watches instances and stream groups and forwards each batch of events
    /// as one trigger. The channel closes when either watch ends.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RebalanceTrigger>> {
        let mut instances = self.watch_prefix(&self.key(StoreKey::InstancesPrefix)).await?;
        let mut groups = self.watch_prefix(&self.key(StoreKey::StreamGroupsPrefix)).await?;
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let prefix = self.config.prefix.clone();

        tokio::spawn(async move {
            loop {
                let resp = tokio::select! {
                    _ = tx.closed() => return,
                    msg = instances.message() => msg,
                    msg = groups.message() => msg,
                };
                let resp = match resp {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        tracing::warn!("etcd watch stream ended");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "etcd watch failed");
                        return;
                    }
                };

                let triggers: BTreeSet<RebalanceTrigger> = resp
                    .events()
                    .iter()
                    .filter_map(|event| event.kv())
                    .filter_map(|kv| std::str::from_utf8(kv.key()).ok())
                    .filter_map(|key| trigger_for_key(&prefix, key))
                    .collect();
                for trigger in triggers {
                    if tx.send(trigger).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Run a closure as leader indefinitely.
///
/// Campaigns for the leader key via etcd CAS. When elected, runs `work_fn`
/// with a token that is cancelled if the leader lease lapses, then revokes
/// the lease so the next candidate can take over at once. Between terms,
/// and while another candidate leads, waits `retry_interval`.
///
/// The outer `cancel` token stops the entire election loop.
pub async fn run_as_leader<F, Fut>(
    store: &EtcdCoordination,
    config: LeaderElectionConfig,
    cancel: CancellationToken,
    work_fn: F,
) -> Result<()>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while !cancel.is_cancelled() {
        match store.serve_term(&config, &cancel, &work_fn).await {
            Ok(true) => tracing::info!(name = %config.name, "leadership term ended"),
            Ok(false) => tracing::debug!(name = %config.name, "another candidate is leader, standing by"),
            Err(e) => tracing::warn!(name = %config.name, error = %e, "leadership term failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }
    Ok(())
}

impl EtcdCoordination {
    /// Try to take the leader key and, if that works, run `work_fn` for as
    /// long as the lease holds. Returns whether a term was served.
    ///
    /// Publication is fenced on `leader_lease`, which is cleared before the
    /// work is asked to stop so a lapsed leader cannot publish on its way out.
    async fn serve_term<F, Fut>(
        &self,
        config: &LeaderElectionConfig,
        cancel: &CancellationToken,
        work_fn: &F,
    ) -> Result<bool>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let lease_id = self.grant_lease(config.lease_ttl).await?;
        if !self.try_acquire(&config.name, lease_id).await? {
            drop(self.revoke_lease(lease_id).await);
            return Ok(false);
        }

        tracing::info!(name = %config.name, lease_id, "acquired leadership");
        self.leader_lease.store(lease_id, Ordering::SeqCst);

        let term = cancel.child_token();
        let work = work_fn(term.clone());
        tokio::pin!(work);

        let result = tokio::select! {
            result = &mut work => result,
            kept = self.keep_lease_alive(lease_id, config.keepalive_interval, LeaseHolder::Leadership, &term) => {
                self.leader_lease.store(0, Ordering::SeqCst);
                term.cancel();
                let finished = work.await;
                kept.and(finished)
            }
        };

        self.leader_lease.store(0, Ordering::SeqCst);
        term.cancel();
        drop(self.revoke_lease(lease_id).await);
        result.map(|()| true)
    }
}

/// What a lease keeps alive. Decides the error raised when it lapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseHolder {
    /// An instance registration; the instance has left the live set.
    Membership,
    /// The coordinator's leader record; another candidate may now lead.
    Leadership,
}

impl LeaseHolder {
    /// Remaining TTL from a keepalive answer, or the error for a lease that
    /// no longer exists. `None` means etcd closed the response stream.
    fn refreshed(self, lease_id: i64, ttl: Option<i64>) -> Result<i64> {
        match ttl {
            Some(ttl) if ttl > 0 => Ok(ttl),
            _ => Err(match self {
                LeaseHolder::Membership => Error::LeaseExpired(lease_id),
                LeaseHolder::Leadership => Error::LeadershipLost,
            }),
        }
    }
}
