mod file;

pub use file::{parse_throughput_document, FileThroughputProvider};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Estimated inbound rate of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionThroughput {
    pub bytes_in_kb_per_sec: u64,
    pub messages_per_sec: u64,
}

impl PartitionThroughput {
    pub fn new(bytes_in_kb_per_sec: u64, messages_per_sec: u64) -> Self {
        Self {
            bytes_in_kb_per_sec,
            messages_per_sec,
        }
    }
}

/// Per-partition estimates for one cluster.
///
/// Entries that could not be parsed are kept in `malformed` (partition ->
/// reason) instead of `partitions`, so "no usable sample" never reads as
/// "zero throughput".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterThroughputInfo {
    pub cluster: String,
    pub partitions: BTreeMap<String, PartitionThroughput>,
    pub malformed: BTreeMap<String, String>,
}

impl ClusterThroughputInfo {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            ..Default::default()
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>, sample: PartitionThroughput) -> Self {
        self.partitions.insert(partition.into(), sample);
        self
    }
}

/// Source of throughput estimates.
///
/// Implementations must be idempotent and side-effect free. Estimates may be
/// stale; an unreachable source must return `Error::ThroughputUnavailable`
/// rather than an empty result.
#[async_trait]
pub trait ThroughputProvider: Send + Sync {
    async fn throughput_info(&self, cluster: &str) -> Result<ClusterThroughputInfo>;

    async fn all_throughput_info(&self) -> Result<BTreeMap<String, ClusterThroughputInfo>>;
}

/// Immutable, pre-fetched estimates handed to a strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThroughputSnapshot {
    clusters: BTreeMap<String, ClusterThroughputInfo>,
}

impl ThroughputSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ClusterThroughputInfo) {
        self.clusters.insert(info.cluster.clone(), info);
    }

    pub fn with_cluster(mut self, info: ClusterThroughputInfo) -> Self {
        self.insert(info);
        self
    }

    pub fn cluster(&self, cluster: &str) -> Option<&ClusterThroughputInfo> {
        self.clusters.get(cluster)
    }

    /// `None` when there is no usable sample, including malformed entries.
    pub fn sample(&self, cluster: &str, partition: &str) -> Option<PartitionThroughput> {
        self.clusters
            .get(cluster)
            .and_then(|info| info.partitions.get(partition))
            .copied()
    }
}

impl From<BTreeMap<String, ClusterThroughputInfo>> for ThroughputSnapshot {
    fn from(clusters: BTreeMap<String, ClusterThroughputInfo>) -> Self {
        Self { clusters }
    }
}

/// In-memory provider for tests, offline runs, and deployments without a
/// throughput source.
#[derive(Debug, Clone, Default)]
pub struct StaticThroughputProvider {
    clusters: BTreeMap<String, ClusterThroughputInfo>,
}

impl StaticThroughputProvider {
    pub fn new(clusters: impl IntoIterator<Item = ClusterThroughputInfo>) -> Self {
        Self {
            clusters: clusters
                .into_iter()
                .map(|info| (info.cluster.clone(), info))
                .collect(),
        }
    }

    /// Parses the same JSON document format as [`FileThroughputProvider`].
    pub fn from_json(document: &str) -> Result<Self> {
        Ok(Self {
            clusters: parse_throughput_document(document)?,
        })
    }
}

#[async_trait]
impl ThroughputProvider for StaticThroughputProvider {
    async fn throughput_info(&self, cluster: &str) -> Result<ClusterThroughputInfo> {
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| Error::ThroughputUnavailable {
                cluster: cluster.to_string(),
                reason: "cluster not found".to_string(),
            })
    }

    async fn all_throughput_info(&self) -> Result<BTreeMap<String, ClusterThroughputInfo>> {
        Ok(self.clusters.clone())
    }
}
