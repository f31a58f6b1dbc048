use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    build_tasks, check_inputs, extend_assignment, pad_min_tasks, previous_owners, sorted_groups,
    AssignmentStrategy,
};
use crate::error::{Error, Result};
use crate::throughput::{PartitionThroughput, ThroughputSnapshot};
use crate::types::{Assignment, InstanceId, StreamGroup};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBasedConfig {
    /// Limit for groups without their own `max_partitions_per_task`.
    pub max_partitions_per_task: Option<u32>,
    /// Largest tolerated difference between the most and least loaded
    /// instance, in KB/s.
    pub imbalance_threshold: u64,
    /// Estimate used for partitions without a usable sample. Must be non-zero.
    pub default_throughput: PartitionThroughput,
    /// Upper bound on corrective moves per rebalance.
    pub max_rebalance_moves: usize,
    /// Keep empty tasks to satisfy a group's `min_tasks`.
    pub allow_empty_tasks: bool,
}

impl Default for LoadBasedConfig {
    fn default() -> Self {
        Self {
            max_partitions_per_task: None,
            imbalance_threshold: 0,
            default_throughput: PartitionThroughput::new(5, 5),
            max_rebalance_moves: 64,
            allow_empty_tasks: false,
        }
    }
}

/// Balances estimated throughput across instances.
///
/// Partitions already owned by a live instance stay put and seed its load.
/// Everything else is placed largest-first onto the least loaded instance.
/// When placement happened or the live set changed, a bounded pass then
/// moves single partitions from the most to the least loaded instance until
/// the spread is within `imbalance_threshold`.
#[derive(Debug, Clone)]
pub struct LoadBasedStrategy {
    config: LoadBasedConfig,
}

#[derive(Debug, Clone, Copy)]
struct Item {
    /// Index into the id-sorted group list.
    group: usize,
    /// Index into the group's partition list.
    partition: usize,
    load: PartitionThroughput,
}

impl Item {
    /// Heaviest first; group and partition order make the order total.
    fn placement_order(&self, other: &Self) -> Ordering {
        other
            .load
            .bytes_in_kb_per_sec
            .cmp(&self.load.bytes_in_kb_per_sec)
            .then_with(|| other.load.messages_per_sec.cmp(&self.load.messages_per_sec))
            .then_with(|| self.group.cmp(&other.group))
            .then_with(|| self.partition.cmp(&other.partition))
    }
}

impl LoadBasedStrategy {
    pub fn new(config: LoadBasedConfig) -> Result<Self> {
        if config.max_partitions_per_task == Some(0) {
            return Err(Error::invalid_config(
                "max partitions per task must be positive",
            ));
        }
        if config.default_throughput.bytes_in_kb_per_sec == 0 {
            return Err(Error::invalid_config(
                "default throughput estimate must be non-zero",
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &LoadBasedConfig {
        &self.config
    }

    /// Move partitions off the most loaded instance until the spread is
    /// within the threshold, no move would reduce it, or the budget runs out.
    ///
    /// Only partitions lighter than the current spread are candidates, so
    /// each move strictly lowers the larger of the two loads involved.
    fn rebalance<'a>(
        &self,
        loads: &mut BTreeMap<&'a InstanceId, u64>,
        owned: &mut BTreeMap<&'a InstanceId, Vec<Item>>,
    ) -> usize {
        let mut moves = 0;
        while moves < self.config.max_rebalance_moves {
            let Some((most, max_load)) = most_loaded(loads) else {
                break;
            };
            let Some((least, min_load)) = least_loaded(loads) else {
                break;
            };
            let spread = max_load - min_load;
            if spread <= self.config.imbalance_threshold {
                break;
            }

            let candidate = owned.get(most).and_then(|items| {
                items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| {
                        item.load.bytes_in_kb_per_sec > 0 && item.load.bytes_in_kb_per_sec < spread
                    })
                    .min_by(|(_, a), (_, b)| a.placement_order(b))
                    .map(|(pos, _)| pos)
            });
            let Some(pos) = candidate else {
                break;
            };

            let Some(item) = owned.get_mut(most).map(|items| items.remove(pos)) else {
                break;
            };
            *loads.entry(most).or_default() -= item.load.bytes_in_kb_per_sec;
            *loads.entry(least).or_default() += item.load.bytes_in_kb_per_sec;
            owned.entry(least).or_default().push(item);
            moves += 1;
        }
        moves
    }
}

/// Highest load; ties go to the lowest id.
fn most_loaded<'a>(loads: &BTreeMap<&'a InstanceId, u64>) -> Option<(&'a InstanceId, u64)> {
    loads
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(id, load)| (*id, *load))
}

/// Lowest load; ties go to the lowest id.
fn least_loaded<'a>(loads: &BTreeMap<&'a InstanceId, u64>) -> Option<(&'a InstanceId, u64)> {
    loads
        .iter()
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(id, load)| (*id, *load))
}

impl AssignmentStrategy for LoadBasedStrategy {
    fn name(&self) -> &'static str {
        "load-based"
    }

    fn assign(
        &self,
        live: &BTreeSet<InstanceId>,
        groups: &[StreamGroup],
        previous: &Assignment,
        throughput: &ThroughputSnapshot,
    ) -> Result<Assignment> {
        check_inputs(live, groups)?;
        let groups = sorted_groups(groups);

        let mut loads: BTreeMap<&InstanceId, u64> = live.iter().map(|id| (id, 0)).collect();
        let mut owned: BTreeMap<&InstanceId, Vec<Item>> =
            live.iter().map(|id| (id, Vec::new())).collect();
        let mut unassigned = Vec::new();

        // Seed loads from partitions that stay where they are
        for (g, group) in groups.iter().enumerate() {
            let owners = previous_owners(group, previous, live);
            for (p, key) in group.partitions.iter().enumerate() {
                let load = throughput
                    .sample(&group.source_cluster, key)
                    .unwrap_or(self.config.default_throughput);
                let item = Item {
                    group: g,
                    partition: p,
                    load,
                };
                match owners.get(&p) {
                    Some(&owner) => {
                        *loads.entry(owner).or_default() += load.bytes_in_kb_per_sec;
                        owned.entry(owner).or_default().push(item);
                    }
                    None => unassigned.push(item),
                }
            }
        }

        let capacity_changed = !live.iter().eq(previous.instances());
        let placement_needed = !unassigned.is_empty() || capacity_changed;

        // Greedy largest-first placement
        unassigned.sort_by(Item::placement_order);
        for item in unassigned {
            let Some((target, _)) = least_loaded(&loads) else {
                break;
            };
            *loads.entry(target).or_default() += item.load.bytes_in_kb_per_sec;
            owned.entry(target).or_default().push(item);
        }

        if placement_needed {
            self.rebalance(&mut loads, &mut owned);
        }

        let mut assignment = Assignment::with_instances(live);
        for (g, group) in groups.iter().enumerate() {
            let placement: BTreeMap<&InstanceId, Vec<usize>> = owned
                .iter()
                .map(|(&id, items)| {
                    let parts = items
                        .iter()
                        .filter(|item| item.group == g)
                        .map(|item| item.partition)
                        .collect();
                    (id, parts)
                })
                .collect();
            let limit = group.partition_limit(self.config.max_partitions_per_task);
            extend_assignment(&mut assignment, build_tasks(group, &placement, previous, limit));
            if self.config.allow_empty_tasks {
                pad_min_tasks(&mut assignment, group);
            }
        }

        assignment.normalize();
        Ok(assignment)
    }

    fn uses_throughput(&self) -> bool {
        true
    }

    fn default_max_partitions_per_task(&self) -> Option<u32> {
        self.config.max_partitions_per_task
    }
}
