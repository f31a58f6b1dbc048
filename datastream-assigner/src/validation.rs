use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::strategy::Coverage;
use crate::types::{Assignment, InstanceId, StreamGroup};

/// Check every assignment invariant against the inputs it was computed from.
///
/// `groups` may include paused groups; they count as inactive and must hold
/// no tasks. `default_limit` is the strategy-wide max partitions per task.
/// Returns the first violation found as `Error::InvariantViolation`.
pub fn validate_assignment(
    assignment: &Assignment,
    live: &BTreeSet<InstanceId>,
    groups: &[StreamGroup],
    coverage: Coverage,
    default_limit: Option<u32>,
) -> Result<()> {
    let active: HashMap<&str, &StreamGroup> = groups
        .iter()
        .filter(|g| g.is_active())
        .map(|g| (g.id.as_str(), g))
        .collect();
    let indexes: HashMap<&str, HashMap<&str, usize>> = active
        .iter()
        .map(|(&id, g)| (id, g.partition_index()))
        .collect();

    if !active.is_empty() {
        if let Some(missing) = live.iter().find(|id| !assignment.contains_instance(id)) {
            return Err(Error::invariant(format!(
                "live instance {missing} missing from assignment"
            )));
        }
    }

    let mut task_ids = HashSet::new();
    // (group, partition) -> instances holding it, in instance order
    let mut holders: BTreeMap<(&str, &str), Vec<&InstanceId>> = BTreeMap::new();
    // group -> instance -> task count
    let mut task_counts: HashMap<&str, BTreeMap<&InstanceId, usize>> = HashMap::new();

    for (instance, tasks) in assignment.iter() {
        if !tasks.is_empty() && !live.contains(instance) {
            return Err(Error::invariant(format!(
                "instance {instance} is not live but holds {} tasks",
                tasks.len()
            )));
        }

        for task in tasks {
            if !task_ids.insert(task.task_id.as_str()) {
                return Err(Error::invariant(format!("duplicate task id {}", task.task_id)));
            }
            let Some(group) = active.get(task.stream_group_id.as_str()) else {
                return Err(Error::invariant(format!(
                    "task {} belongs to unknown or paused stream group {}",
                    task.task_id, task.stream_group_id
                )));
            };
            if let Some(limit) = group.partition_limit(default_limit) {
                if task.len() > limit {
                    return Err(Error::invariant(format!(
                        "task {} holds {} partitions, limit is {limit}",
                        task.task_id,
                        task.len()
                    )));
                }
            }

            let index = &indexes[group.id.as_str()];
            let mut last = None;
            for key in &task.partition_ids {
                let Some(&position) = index.get(key.as_str()) else {
                    return Err(Error::invariant(format!(
                        "task {} holds partition {key} which is not in stream group {}",
                        task.task_id, group.id
                    )));
                };
                if last.is_some_and(|prev| prev >= position) {
                    return Err(Error::invariant(format!(
                        "task {} partitions are not in group order",
                        task.task_id
                    )));
                }
                last = Some(position);
                holders
                    .entry((group.id.as_str(), key.as_str()))
                    .or_default()
                    .push(instance);
            }
            *task_counts
                .entry(group.id.as_str())
                .or_default()
                .entry(instance)
                .or_default() += 1;
        }
    }

    let mut group_ids: Vec<&str> = active.keys().copied().collect();
    group_ids.sort_unstable();
    for id in group_ids {
        let group = active[id];
        for key in &group.partitions {
            let owners = holders
                .get(&(id, key.as_str()))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            check_coverage(id, key, owners, live, coverage)?;
        }

        let required = group.required_tasks(group.partition_limit(default_limit));
        let counts = task_counts.get(id);
        let deficient = match coverage {
            Coverage::Exclusive => {
                let total: usize = counts.map_or(0, |c| c.values().sum());
                (total < required).then_some(total)
            }
            Coverage::Broadcast => live
                .iter()
                .map(|instance| counts.and_then(|c| c.get(instance)).copied().unwrap_or(0))
                .find(|&n| n < required),
        };
        if let Some(found) = deficient {
            return Err(Error::invariant(format!(
                "stream group {id} needs at least {required} tasks, found {found}"
            )));
        }
    }

    Ok(())
}

fn check_coverage(
    group: &str,
    key: &str,
    owners: &[&InstanceId],
    live: &BTreeSet<InstanceId>,
    coverage: Coverage,
) -> Result<()> {
    match coverage {
        Coverage::Exclusive => match owners {
            [_] => Ok(()),
            [] => Err(Error::invariant(format!(
                "partition {group}/{key} is not assigned"
            ))),
            _ => Err(Error::invariant(format!(
                "partition {group}/{key} is assigned {} times",
                owners.len()
            ))),
        },
        Coverage::Broadcast => {
            let distinct: BTreeSet<&InstanceId> = owners.iter().copied().collect();
            if distinct.len() != owners.len() {
                return Err(Error::invariant(format!(
                    "partition {group}/{key} is assigned twice to one instance"
                )));
            }
            match live.iter().find(|id| !distinct.contains(id)) {
                Some(missing) => Err(Error::invariant(format!(
                    "partition {group}/{key} is missing on {missing}"
                ))),
                None => Ok(()),
            }
        }
    }
}
