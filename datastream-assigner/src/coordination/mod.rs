mod etcd;

pub use etcd::{
    run_as_leader, EtcdCoordination, LeaderElectionConfig, LeaderRecord, MembershipConfig,
    StoreConfig,
};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::Result;
use crate::types::{Assignment, InstanceId, PublishedAssignment, RebalanceTrigger, StreamGroup};
use crate::util;

/// Buffer per subscriber. A full buffer already holds a pending trigger, so
/// further sends are dropped.
pub const TRIGGER_CHANNEL_CAPACITY: usize = 64;

/// Result of an epoch compare-and-set publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(PublishedAssignment),
    /// Another publisher got there first; `current_epoch` is what the store
    /// holds now.
    Conflict { current_epoch: u64 },
}

/// Everything the engine needs from the cluster: membership, stream group
/// definitions, durable publication, and change notifications.
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn live_instances(&self) -> Result<BTreeSet<InstanceId>>;

    /// All stream groups, paused ones included.
    async fn stream_groups(&self) -> Result<Vec<StreamGroup>>;

    async fn current_assignment(&self) -> Result<Option<PublishedAssignment>>;

    /// Publish `assignment` as `epoch`. Succeeds only if the stored epoch is
    /// `epoch - 1` (or nothing is stored and `epoch` is 1).
    async fn publish_assignment(&self, epoch: u64, assignment: &Assignment)
        -> Result<PublishOutcome>;

    /// Stream of rebalance triggers for membership and stream group changes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RebalanceTrigger>>;
}

fn published_epoch(published: Option<&PublishedAssignment>) -> u64 {
    published.map_or(0, |p| p.epoch)
}

#[derive(Debug, Default)]
struct InMemoryState {
    live: BTreeSet<InstanceId>,
    groups: BTreeMap<String, StreamGroup>,
    published: Option<PublishedAssignment>,
    publications: usize,
    subscribers: Vec<mpsc::Sender<RebalanceTrigger>>,
}

impl InMemoryState {
    fn emit(&mut self, trigger: RebalanceTrigger) {
        self.subscribers.retain(|tx| match tx.try_send(trigger) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Process-local coordination for tests and single-node deployments.
///
/// Every mutator emits the matching trigger to all subscribers.
#[derive(Debug, Default)]
pub struct InMemoryCoordination {
    state: Mutex<InMemoryState>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_instance(&self, instance: impl Into<InstanceId>) {
        let mut state = self.state.lock().await;
        if state.live.insert(instance.into()) {
            state.emit(RebalanceTrigger::MembershipChanged);
        }
    }

    pub async fn remove_instance(&self, instance: &str) {
        let mut state = self.state.lock().await;
        if state.live.remove(instance) {
            state.emit(RebalanceTrigger::MembershipChanged);
        }
    }

    /// Insert or replace a stream group.
    pub async fn put_stream_group(&self, group: StreamGroup) {
        let mut state = self.state.lock().await;
        if state.groups.get(&group.id) != Some(&group) {
            state.groups.insert(group.id.clone(), group);
            state.emit(RebalanceTrigger::StreamGroupsChanged);
        }
    }

    pub async fn remove_stream_group(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.groups.remove(id).is_some() {
            state.emit(RebalanceTrigger::StreamGroupsChanged);
        }
    }

    pub async fn set_paused(&self, id: &str, paused: bool) {
        let mut state = self.state.lock().await;
        let changed = match state.groups.get_mut(id) {
            Some(group) if group.paused != paused => {
                group.paused = paused;
                true
            }
            _ => false,
        };
        if changed {
            state.emit(RebalanceTrigger::StreamGroupsChanged);
        }
    }

    /// Send a trigger to every subscriber without changing any state.
    pub async fn notify(&self, trigger: RebalanceTrigger) {
        self.state.lock().await.emit(trigger);
    }

    /// Overwrite the published assignment as if another coordinator had
    /// published it.
    pub async fn force_publish(&self, epoch: u64, assignment: Assignment) {
        let mut state = self.state.lock().await;
        state.published = Some(PublishedAssignment {
            epoch,
            published_at: util::now_seconds(),
            assignment,
        });
    }

    /// Number of successful `publish_assignment` calls.
    pub async fn publications(&self) -> usize {
        self.state.lock().await.publications
    }
}

#[async_trait]
impl Coordination for InMemoryCoordination {
    async fn live_instances(&self) -> Result<BTreeSet<InstanceId>> {
        Ok(self.state.lock().await.live.clone())
    }

    async fn stream_groups(&self) -> Result<Vec<StreamGroup>> {
        Ok(self.state.lock().await.groups.values().cloned().collect())
    }

    async fn current_assignment(&self) -> Result<Option<PublishedAssignment>> {
        Ok(self.state.lock().await.published.clone())
    }

    async fn publish_assignment(
        &self,
        epoch: u64,
        assignment: &Assignment,
    ) -> Result<PublishOutcome> {
        let mut state = self.state.lock().await;
        let current_epoch = published_epoch(state.published.as_ref());
        if epoch != current_epoch + 1 {
            return Ok(PublishOutcome::Conflict { current_epoch });
        }

        let published = PublishedAssignment {
            epoch,
            published_at: util::now_seconds(),
            assignment: assignment.clone(),
        };
        state.published = Some(published.clone());
        state.publications += 1;
        Ok(PublishOutcome::Published(published))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RebalanceTrigger>> {
        let (tx, rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        self.state.lock().await.subscribers.push(tx);
        Ok(rx)
    }
}
