#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datastream_assigner::coordination::InMemoryCoordination;
use datastream_assigner::engine::{AssignmentEngine, EngineConfig};
use datastream_assigner::error::Result;
use datastream_assigner::strategy::AssignmentStrategy;
use datastream_assigner::throughput::{
    ClusterThroughputInfo, PartitionThroughput, StaticThroughputProvider, ThroughputProvider,
    ThroughputSnapshot,
};
use datastream_assigner::types::{InstanceId, StreamGroup};

pub const CLUSTER: &str = "kafka-a";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn fixture_path(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

// ── Input builders ──────────────────────────────────────────────

/// Group `id` with partitions `p0..p{n-1}` on [`CLUSTER`].
pub fn group(id: &str, n: usize) -> StreamGroup {
    StreamGroup {
        id: id.to_string(),
        streams: vec![format!("{id}-stream")],
        source: format!("kafka://broker-1:9092/{id}"),
        destination: format!("kafka://dest-1:9092/{id}"),
        source_cluster: CLUSTER.to_string(),
        task_prefix: None,
        partitions: (0..n).map(|p| format!("p{p}")).collect(),
        max_partitions_per_task: None,
        min_tasks: 0,
        paused: false,
    }
}

/// Group `id` with the given partition keys.
pub fn group_with(id: &str, partitions: &[&str]) -> StreamGroup {
    StreamGroup {
        partitions: partitions.iter().map(|p| p.to_string()).collect(),
        ..group(id, 0)
    }
}

pub fn instances(names: &[&str]) -> BTreeSet<InstanceId> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Snapshot for [`CLUSTER`] with `rates[i]` KB/s for partition `p{i}`.
pub fn snapshot(rates: &[u64]) -> ThroughputSnapshot {
    ThroughputSnapshot::new().with_cluster(cluster_info(rates))
}

pub fn cluster_info(rates: &[u64]) -> ClusterThroughputInfo {
    rates
        .iter()
        .enumerate()
        .fold(ClusterThroughputInfo::new(CLUSTER), |info, (p, &kb)| {
            info.with_partition(format!("p{p}"), PartitionThroughput::new(kb, kb * 10))
        })
}

/// Sum of KB/s per instance according to `throughput`.
pub fn loads(
    assignment: &datastream_assigner::types::Assignment,
    throughput: &ThroughputSnapshot,
) -> BTreeMap<InstanceId, u64> {
    assignment
        .iter()
        .map(|(instance, tasks)| {
            let load = tasks
                .iter()
                .flat_map(|t| t.partition_ids.iter())
                .filter_map(|p| throughput.sample(CLUSTER, p))
                .map(|s| s.bytes_in_kb_per_sec)
                .sum();
            (instance.clone(), load)
        })
        .collect()
}

// ── Engine harness ──────────────────────────────────────────────

/// Throughput provider that can park the first lookup until released, to
/// interleave events with an in-flight rebalance.
pub struct GatedThroughputProvider {
    inner: StaticThroughputProvider,
    armed: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedThroughputProvider {
    pub fn new(inner: StaticThroughputProvider) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl ThroughputProvider for GatedThroughputProvider {
    async fn throughput_info(&self, cluster: &str) -> Result<ClusterThroughputInfo> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.throughput_info(cluster).await
    }

    async fn all_throughput_info(&self) -> Result<BTreeMap<String, ClusterThroughputInfo>> {
        self.inner.all_throughput_info().await
    }
}

pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        debounce_interval: Duration::from_millis(50),
        reevaluation_interval: None,
        max_rebalance_attempts: 3,
    }
}

pub fn build_engine(
    coordination: Arc<InMemoryCoordination>,
    strategy: Arc<dyn AssignmentStrategy>,
    throughput: Arc<dyn ThroughputProvider>,
) -> Arc<AssignmentEngine> {
    Arc::new(AssignmentEngine::new(
        coordination,
        strategy,
        throughput,
        fast_engine_config(),
    ))
}

pub fn start_engine(
    engine: Arc<AssignmentEngine>,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    let token = cancel.child_token();
    tokio::spawn(async move { engine.run(token).await })
}
