use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{Assignment, InstanceId, Partition};

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Check that an identifier is safe to interpolate into an etcd key.
///
/// Instance and stream group ids become key segments, so a name like
/// `../assignment` must not reach the store.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::invalid_config(format!(
            "identifier {name:?} must be 1-128 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::invalid_config(format!(
            "identifier {name:?} contains invalid characters (only alphanumeric, dash, underscore, dot allowed)"
        )));
    }
    if name.chars().all(|c| c == '.') {
        return Err(Error::invalid_config(format!("identifier {name:?} is reserved")));
    }
    Ok(())
}

/// A partition that changes owner between two assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMove {
    pub partition: Partition,
    pub from: InstanceId,
    pub to: InstanceId,
}

/// Compare two assignments and list the partitions whose owner changed.
///
/// Partitions only present in `next` are new, not moved, and are skipped.
pub fn compute_partition_moves(previous: &Assignment, next: &Assignment) -> Vec<PartitionMove> {
    let before = previous.partition_owners();
    next.partition_owners()
        .into_iter()
        .filter_map(|(partition, to)| {
            let from = *before.get(&partition)?;
            (from != to).then(|| PartitionMove {
                partition,
                from: from.clone(),
                to: to.clone(),
            })
        })
        .collect()
}

/// Compact a list of partition keys for logging.
///
/// Keys shaped like `{topic}-{n}` are grouped by topic with consecutive
/// numbers merged, so `events-0, events-1, events-2, events-5` becomes
/// `events:[0-2, 5]`. Other keys are listed as they are.
pub fn summarize_partitions<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    let mut numbered: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    let mut other: Vec<&str> = Vec::new();

    for key in keys {
        match key
            .rsplit_once('-')
            .and_then(|(topic, n)| Some((topic, n.parse::<u64>().ok()?)))
        {
            Some((topic, n)) if !topic.is_empty() => numbered.entry(topic).or_default().push(n),
            _ => other.push(key),
        }
    }

    if numbered.is_empty() && other.is_empty() {
        return "[]".to_string();
    }

    other.sort_unstable();
    numbered
        .into_iter()
        .map(|(topic, numbers)| format!("{topic}:{}", compact_ranges(numbers)))
        .chain(other.into_iter().map(str::to_string))
        .collect::<Vec<_>>()
        .join(", ")
}

fn compact_ranges(mut numbers: Vec<u64>) -> String {
    numbers.sort_unstable();
    numbers.dedup();

    let mut ranges: Vec<String> = Vec::new();
    let mut iter = numbers.into_iter();
    let Some(mut start) = iter.next() else {
        return "[]".to_string();
    };
    let mut end = start;
    let mut push = |start: u64, end: u64| {
        ranges.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        })
    };
    for n in iter {
        if n == end + 1 {
            end = n;
        } else {
            push(start, end);
            start = n;
            end = n;
        }
    }
    push(start, end);

    format!("[{}]", ranges.join(", "))
}
