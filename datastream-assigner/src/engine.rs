use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::coordination::{Coordination, PublishOutcome};
use crate::error::{Error, Result};
use crate::strategy::AssignmentStrategy;
use crate::throughput::{ThroughputProvider, ThroughputSnapshot};
use crate::types::{Assignment, PublishedAssignment, RebalanceTrigger, StreamGroup};
use crate::util;
use crate::validation::validate_assignment;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long to wait after the first trigger before rebalancing, to batch
    /// bursts (e.g. a rolling restart) into a single rebalance.
    pub debounce_interval: Duration,
    /// Re-run the strategy this often even without triggers, to pick up new
    /// throughput estimates. `None` disables it.
    pub reevaluation_interval: Option<Duration>,
    /// Attempts per trigger when a computation is superseded or loses the
    /// publication race.
    pub max_rebalance_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_secs(1),
            reevaluation_interval: Some(Duration::from_secs(300)),
            max_rebalance_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// A new assignment was published as `epoch`; `moved` partitions changed
    /// owner.
    Published { epoch: u64, moved: usize },
    /// The computed assignment equals the one already published.
    Unchanged { epoch: u64 },
    /// A newer trigger arrived while computing; the result was discarded.
    Superseded,
    /// Another publisher advanced the epoch first; the result was discarded.
    Conflict { current_epoch: u64 },
}

impl RebalanceOutcome {
    fn should_retry(&self) -> bool {
        matches!(self, Self::Superseded | Self::Conflict { .. })
    }
}

/// Runs the strategy on every trigger, validates the result and publishes it.
///
/// Computations are serialized. A computation that finishes after a newer
/// trigger was noted is discarded rather than published, and a publication
/// that loses the epoch race leaves no trace. Both are then recomputed from
/// fresh inputs.
pub struct AssignmentEngine {
    coordination: Arc<dyn Coordination>,
    strategy: Arc<dyn AssignmentStrategy>,
    throughput: Arc<dyn ThroughputProvider>,
    config: EngineConfig,
    rebalance_lock: Mutex<()>,
    trigger_seq: AtomicU64,
    current: RwLock<Option<PublishedAssignment>>,
}

impl AssignmentEngine {
    pub fn new(
        coordination: Arc<dyn Coordination>,
        strategy: Arc<dyn AssignmentStrategy>,
        throughput: Arc<dyn ThroughputProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordination,
            strategy,
            throughput,
            config,
            rebalance_lock: Mutex::new(()),
            trigger_seq: AtomicU64::new(0),
            current: RwLock::new(None),
        }
    }

    /// Last assignment this engine published or verified.
    pub async fn current(&self) -> Option<PublishedAssignment> {
        self.current.read().await.clone()
    }

    /// Note that inputs changed. Any computation already running will be
    /// discarded when it finishes.
    pub fn notify(&self, trigger: RebalanceTrigger) {
        let seq = self.trigger_seq.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(?trigger, seq, "rebalance triggered");
    }

    /// Compute, validate and publish one assignment.
    pub async fn rebalance(&self, trigger: RebalanceTrigger) -> Result<RebalanceOutcome> {
        let _guard = self.rebalance_lock.lock().await;
        let seq = self.trigger_seq.load(Ordering::SeqCst);

        let live = self.coordination.live_instances().await?;
        let all_groups = self.coordination.stream_groups().await?;
        let groups: Vec<StreamGroup> = all_groups.iter().filter(|g| g.is_active()).cloned().collect();
        let published = self.coordination.current_assignment().await?;
        let (epoch, previous) = match &published {
            Some(p) => (p.epoch, p.assignment.clone()),
            None => (0, Assignment::new()),
        };

        let throughput = if self.strategy.uses_throughput() {
            self.fetch_throughput(&groups).await
        } else {
            ThroughputSnapshot::new()
        };

        let next = self.strategy.assign(&live, &groups, &previous, &throughput)?;
        if let Err(e) = validate_assignment(
            &next,
            &live,
            &all_groups,
            self.strategy.coverage(),
            self.strategy.default_max_partitions_per_task(),
        ) {
            tracing::error!(
                strategy = self.strategy.name(),
                ?trigger,
                error = %e,
                "computed assignment is invalid, not publishing"
            );
            return Err(e);
        }

        if self.trigger_seq.load(Ordering::SeqCst) != seq {
            tracing::debug!(?trigger, "newer trigger arrived, discarding result");
            return Ok(RebalanceOutcome::Superseded);
        }

        if published.is_some() && next == previous {
            tracing::debug!(epoch, "assignment unchanged");
            *self.current.write().await = published;
            return Ok(RebalanceOutcome::Unchanged { epoch });
        }

        match self.coordination.publish_assignment(epoch + 1, &next).await? {
            PublishOutcome::Published(published) => {
                let moved = util::compute_partition_moves(&previous, &published.assignment).len();
                tracing::info!(
                    epoch = published.epoch,
                    moved,
                    instances = live.len(),
                    tasks = published.assignment.task_count(),
                    strategy = self.strategy.name(),
                    ?trigger,
                    "published assignment"
                );
                let epoch = published.epoch;
                *self.current.write().await = Some(published);
                Ok(RebalanceOutcome::Published { epoch, moved })
            }
            PublishOutcome::Conflict { current_epoch } => {
                tracing::warn!(
                    attempted = epoch + 1,
                    current_epoch,
                    "publication conflict, discarding result"
                );
                Ok(RebalanceOutcome::Conflict { current_epoch })
            }
        }
    }

    /// `rebalance`, repeated while the result is superseded or conflicts, up
    /// to `max_rebalance_attempts` times.
    pub async fn rebalance_with_retry(&self, trigger: RebalanceTrigger) -> Result<RebalanceOutcome> {
        let attempts = self.config.max_rebalance_attempts.max(1);
        let mut outcome = self.rebalance(trigger).await?;
        for attempt in 2..=attempts {
            if !outcome.should_retry() {
                break;
            }
            tracing::debug!(attempt, ?outcome, "retrying rebalance");
            outcome = self.rebalance(trigger).await?;
        }
        Ok(outcome)
    }

    /// Re-check the published assignment against current membership and
    /// stream groups, and adopt it as `current()` if it holds.
    ///
    /// Returns `Ok(None)` when nothing has been published yet.
    pub async fn verify_published(&self) -> Result<Option<PublishedAssignment>> {
        let Some(published) = self.coordination.current_assignment().await? else {
            return Ok(None);
        };
        let live = self.coordination.live_instances().await?;
        let groups = self.coordination.stream_groups().await?;
        validate_assignment(
            &published.assignment,
            &live,
            &groups,
            self.strategy.coverage(),
            self.strategy.default_max_partitions_per_task(),
        )?;
        *self.current.write().await = Some(published.clone());
        Ok(Some(published))
    }

    /// Rebalance on every trigger until cancelled.
    ///
    /// Assignment failures are logged and wait for the next trigger;
    /// coordination errors end the loop. Triggers that arrive while a
    /// rebalance is in flight supersede it and queue one more round.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut triggers = self.coordination.subscribe().await?;
        let mut ticker = self.config.reevaluation_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        self.notify(RebalanceTrigger::Initial);
        let mut pending = self
            .handle_while_listening(RebalanceTrigger::Initial, &mut triggers, &cancel)
            .await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // Wait for the first trigger, unless one landed mid-rebalance
            let trigger = match pending.take() {
                Some(trigger) => trigger,
                None => {
                    let trigger = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        msg = triggers.recv() => {
                            msg.ok_or_else(|| Error::invalid_state("trigger stream ended"))?
                        }
                        _ = next_tick(&mut ticker) => RebalanceTrigger::Periodic,
                    };
                    self.notify(trigger);
                    trigger
                }
            };

            // Drain additional triggers arriving within the debounce window
            let deadline = Instant::now() + self.config.debounce_interval;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep_until(deadline) => break,
                    msg = triggers.recv() => {
                        let more = msg.ok_or_else(|| Error::invalid_state("trigger stream ended"))?;
                        self.notify(more);
                    }
                }
            }

            pending = self.handle_while_listening(trigger, &mut triggers, &cancel).await?;
        }
    }

    /// Run [`handle`](Self::handle) while still reading `triggers`, so a
    /// change that lands mid-computation bumps the sequence and the
    /// computation is discarded instead of published stale.
    ///
    /// Returns the last trigger seen meanwhile; it still needs its own round
    /// in case it arrived after the computation passed its check.
    async fn handle_while_listening(
        &self,
        trigger: RebalanceTrigger,
        triggers: &mut mpsc::Receiver<RebalanceTrigger>,
        cancel: &CancellationToken,
    ) -> Result<Option<RebalanceTrigger>> {
        let handled = self.handle(trigger);
        tokio::pin!(handled);

        let mut pending = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = &mut handled => {
                    result?;
                    return Ok(pending);
                }
                msg = triggers.recv() => {
                    let more = msg.ok_or_else(|| Error::invalid_state("trigger stream ended"))?;
                    self.notify(more);
                    pending = Some(more);
                }
            }
        }
    }

    async fn handle(&self, trigger: RebalanceTrigger) -> Result<()> {
        match self.rebalance_with_retry(trigger).await {
            Ok(outcome) => {
                if outcome.should_retry() {
                    tracing::warn!(?trigger, ?outcome, "gave up rebalancing after retries");
                }
                Ok(())
            }
            Err(e) if e.is_assignment_failure() => {
                tracing::warn!(?trigger, error = %e, "rebalance failed, waiting for next trigger");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot throughput for every cluster the groups read from. An
    /// unavailable cluster falls back to the strategy's default estimate.
    async fn fetch_throughput(&self, groups: &[StreamGroup]) -> ThroughputSnapshot {
        let clusters: BTreeSet<&str> = groups.iter().map(|g| g.source_cluster.as_str()).collect();
        let mut snapshot = ThroughputSnapshot::new();
        for cluster in clusters {
            match self.throughput.throughput_info(cluster).await {
                Ok(info) => snapshot.insert(info),
                Err(e) => {
                    tracing::warn!(cluster, error = %e, "throughput unavailable, using default estimates");
                }
            }
        }

        for group in groups {
            let missing: Vec<&str> = group
                .partitions
                .iter()
                .filter(|p| snapshot.sample(&group.source_cluster, p).is_none())
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                tracing::warn!(
                    stream_group = %group.id,
                    cluster = %group.source_cluster,
                    missing = missing.len(),
                    partitions = %util::summarize_partitions(missing),
                    "no throughput sample, using default estimate"
                );
            }
        }

        snapshot
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
