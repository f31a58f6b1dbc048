use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::{StreamGroup, Task};

const HASHED_ID_LEN: usize = 16;
const BROKER_LIST_SCHEMES: [&str; 2] = ["kafka", "kafkassl"];

/// Derives the consumer-group id downstream transports use for a stream
/// group's tasks.
///
/// With hashing enabled the id depends only on the group's task prefix and
/// this cluster's name, so it survives connection-string edits. Otherwise it
/// spells out the normalized source and the destination.
#[derive(Debug, Clone)]
pub struct GroupIdConstructor {
    hashing_enabled: bool,
    cluster_name: String,
}

impl GroupIdConstructor {
    pub fn new(hashing_enabled: bool, cluster_name: impl Into<String>) -> Self {
        Self {
            hashing_enabled,
            cluster_name: cluster_name.into(),
        }
    }

    pub fn for_group(&self, group: &StreamGroup) -> String {
        if self.hashing_enabled {
            hashed_group_id(group.task_prefix(), &self.cluster_name)
        } else {
            format!(
                "{}-to-{}",
                normalize_connection_string(&group.source),
                group.destination
            )
        }
    }

    /// Group id for a task. Tasks carry no connection strings, so the group
    /// they were cut from must be supplied.
    pub fn for_task(&self, task: &Task, group: &StreamGroup) -> Result<String> {
        if task.stream_group_id != group.id {
            return Err(Error::invalid_state(format!(
                "task {} belongs to stream group {}, not {}",
                task.task_id, task.stream_group_id, group.id
            )));
        }
        Ok(self.for_group(group))
    }
}

fn hashed_group_id(task_prefix: &str, cluster_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_prefix.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}.{cluster_name}", &digest[..HASHED_ID_LEN])
}

/// Lowercase the scheme and, for broker-list schemes, sort the brokers so
/// that the same cluster always yields the same string.
pub fn normalize_connection_string(raw: &str) -> String {
    let Some((scheme, rest)) = raw.trim().split_once("://") else {
        return raw.trim().to_string();
    };
    let scheme = scheme.to_ascii_lowercase();
    if !BROKER_LIST_SCHEMES.contains(&scheme.as_str()) {
        return format!("{scheme}://{rest}");
    }

    let (brokers, path) = match rest.split_once('/') {
        Some((brokers, path)) => (brokers, Some(path)),
        None => (rest, None),
    };
    let mut brokers: Vec<&str> = brokers
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .collect();
    brokers.sort_unstable();

    match path {
        Some(path) => format!("{scheme}://{}/{path}", brokers.join(",")),
        None => format!("{scheme}://{}", brokers.join(",")),
    }
}
