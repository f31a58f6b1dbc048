use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{ClusterThroughputInfo, PartitionThroughput, ThroughputProvider};
use crate::error::{Error, Result};

const ROOT_NODE: &str = "stats";
const BYTES_IN_KB_TOKEN: &str = "bytesInKB:";
const MESSAGES_IN_TOKEN: &str = "msgIn:";

/// Reads throughput estimates from a JSON snapshot file:
///
/// ```text
/// {
///   "stats": {
///     "<cluster>": {
///       "<partition>": "bytesInKB:<int>,msgIn:<int>"
///     }
///   }
/// }
/// ```
///
/// The file is re-read on every call so an operator can swap it in place.
#[derive(Debug, Clone)]
pub struct FileThroughputProvider {
    path: PathBuf,
}

impl FileThroughputProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self, cluster: &str) -> Result<BTreeMap<String, ClusterThroughputInfo>> {
        let unavailable = |reason: String| Error::ThroughputUnavailable {
            cluster: cluster.to_string(),
            reason,
        };
        let document = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| unavailable(format!("failed to read {}: {e}", self.path.display())))?;
        parse_throughput_document(&document).map_err(|e| unavailable(e.to_string()))
    }
}

#[async_trait]
impl ThroughputProvider for FileThroughputProvider {
    async fn throughput_info(&self, cluster: &str) -> Result<ClusterThroughputInfo> {
        let mut clusters = self.load(cluster).await?;
        clusters
            .remove(cluster)
            .ok_or_else(|| Error::ThroughputUnavailable {
                cluster: cluster.to_string(),
                reason: "cluster not found in throughput file".to_string(),
            })
    }

    async fn all_throughput_info(&self) -> Result<BTreeMap<String, ClusterThroughputInfo>> {
        self.load("*").await
    }
}

/// Parse a throughput snapshot document.
///
/// Fails only when the document itself is unusable. A malformed partition
/// entry is logged and recorded in `malformed`; a cluster node that is not an
/// object is logged and skipped. Neither affects the other entries.
pub fn parse_throughput_document(document: &str) -> Result<BTreeMap<String, ClusterThroughputInfo>> {
    let root: Value = serde_json::from_str(document)?;
    let stats = root
        .get(ROOT_NODE)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::invalid_state(format!("missing \"{ROOT_NODE}\" object")))?;

    let mut clusters = BTreeMap::new();
    for (cluster, node) in stats {
        let Some(entries) = node.as_object() else {
            tracing::warn!(cluster = %cluster, "throughput stats for cluster are not an object, skipping");
            continue;
        };

        let mut info = ClusterThroughputInfo::new(cluster.clone());
        for (partition, value) in entries {
            let parsed = match value.as_str() {
                Some(raw) => parse_sample(raw),
                None => Err(format!("expected a string, got {value}")),
            };
            match parsed {
                Ok(sample) => {
                    info.partitions.insert(partition.clone(), sample);
                }
                Err(reason) => {
                    tracing::warn!(
                        cluster = %cluster,
                        partition = %partition,
                        reason = %reason,
                        "malformed throughput entry, treating as missing"
                    );
                    info.malformed.insert(partition.clone(), reason);
                }
            }
        }
        clusters.insert(cluster.clone(), info);
    }

    Ok(clusters)
}

fn parse_sample(raw: &str) -> std::result::Result<PartitionThroughput, String> {
    let mut bytes = None;
    let mut messages = None;

    for token in raw.split(',').map(str::trim) {
        if let Some(rate) = token.strip_prefix(BYTES_IN_KB_TOKEN) {
            bytes = Some(parse_rate(rate)?);
        } else if let Some(rate) = token.strip_prefix(MESSAGES_IN_TOKEN) {
            messages = Some(parse_rate(rate)?);
        } else {
            return Err(format!("unexpected token {token:?}"));
        }
    }

    match (bytes, messages) {
        (Some(bytes), Some(messages)) => Ok(PartitionThroughput::new(bytes, messages)),
        (None, _) => Err(format!("missing {BYTES_IN_KB_TOKEN} in {raw:?}")),
        (_, None) => Err(format!("missing {MESSAGES_IN_TOKEN} in {raw:?}")),
    }
}

fn parse_rate(rate: &str) -> std::result::Result<u64, String> {
    rate.trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid rate {rate:?}: {e}"))
}
