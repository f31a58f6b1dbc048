use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{
    build_tasks, check_inputs, extend_assignment, pad_min_tasks, previous_owners, sorted_groups,
    AssignmentStrategy,
};
use crate::error::{Error, Result};
use crate::throughput::ThroughputSnapshot;
use crate::types::{Assignment, InstanceId, StreamGroup, Task};

/// Assigns partitions while minimizing movement from the previous assignment.
///
/// Keeps every partition whose owner is still live, then redistributes
/// orphaned and new partitions so each instance holds within +/-1 of the
/// ideal share of every group. When an instance joins with nothing, the most
/// loaded instances give up their most recently added partitions to it.
/// Finally whole tasks move between instances until task counts are within
/// one of each other.
#[derive(Debug, Clone, Default)]
pub struct StickyStrategy {
    max_partitions_per_task: Option<u32>,
    allow_empty_tasks: bool,
}

impl StickyStrategy {
    pub fn new(max_partitions_per_task: Option<u32>, allow_empty_tasks: bool) -> Result<Self> {
        if max_partitions_per_task == Some(0) {
            return Err(Error::invalid_config(
                "max partitions per task must be positive",
            ));
        }
        Ok(Self {
            max_partitions_per_task,
            allow_empty_tasks,
        })
    }

    /// Decide which instance owns each partition of `group`.
    ///
    /// `totals` holds partition counts from groups already placed and only
    /// breaks ties, which spreads small groups across the fleet instead of
    /// stacking them on the lowest ids.
    fn place_group<'a>(
        &self,
        group: &StreamGroup,
        live: &'a BTreeSet<InstanceId>,
        previous: &Assignment,
        totals: &BTreeMap<&'a InstanceId, usize>,
    ) -> BTreeMap<&'a InstanceId, Vec<usize>> {
        let num_partitions = group.partitions.len();
        let num_instances = live.len();

        // Step 1: Keep partitions whose owner is still live
        let owners = previous_owners(group, previous, live);
        let mut placement: BTreeMap<&InstanceId, Vec<usize>> =
            live.iter().map(|id| (id, Vec::new())).collect();
        let mut pool = Vec::new();
        for partition in 0..num_partitions {
            match owners.get(&partition).and_then(|owner| placement.get_mut(owner)) {
                Some(parts) => parts.push(partition),
                None => pool.push(partition),
            }
        }

        // Step 2: Decide targets. Instances already holding more of this
        // group get the +1 slots, to minimize movement.
        let base = num_partitions / num_instances;
        let extra = num_partitions % num_instances;
        let mut ranked: Vec<&InstanceId> = live.iter().collect();
        ranked.sort_by(|a, b| {
            placement[b]
                .len()
                .cmp(&placement[a].len())
                .then_with(|| totals[a].cmp(&totals[b]))
                .then_with(|| a.cmp(b))
        });
        let targets: HashMap<&InstanceId, usize> = ranked
            .iter()
            .enumerate()
            .map(|(rank, &id)| (id, base + usize::from(rank < extra)))
            .collect();

        // Step 3: Strip excess from overloaded instances. Later positions in
        // the partition list were added most recently and move first.
        for (instance, parts) in placement.iter_mut() {
            let target = targets[instance];
            if parts.len() > target {
                parts.sort_unstable();
                pool.extend(parts.drain(target..));
            }
        }

        // Step 4: Fill underloaded instances from the pool, fewest first
        pool.sort_unstable();
        for partition in pool {
            let instance = least_loaded(
                live.iter().filter(|id| placement[*id].len() < targets[*id]),
                &placement,
                totals,
            )
            .or_else(|| least_loaded(live.iter(), &placement, totals));
            let Some(instance) = instance else {
                break;
            };
            if let Some(parts) = placement.get_mut(instance) {
                parts.push(partition);
            }
        }

        placement
    }
}

/// Move whole tasks from the instance holding the most tasks to the one
/// holding the fewest until the counts differ by at most one. Donors give up
/// their most recently added tasks first.
///
/// A task only moves if its group stays within one partition per instance
/// afterwards. When no task qualifies the pass stops short.
fn balance_task_counts(assignment: &mut Assignment) {
    loop {
        let counts: Vec<(InstanceId, usize)> = assignment
            .iter()
            .map(|(id, tasks)| (id.clone(), tasks.len()))
            .collect();
        let Some((donor, most)) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        else {
            return;
        };
        let Some((receiver, fewest)) = counts
            .iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        else {
            return;
        };
        if most - fewest <= 1 {
            return;
        }

        let movable = assignment
            .tasks(donor)
            .iter()
            .rev()
            .find(|task| keeps_group_balanced(assignment, task, donor, receiver))
            .map(|task| task.task_id.clone());
        let Some(task_id) = movable else {
            return;
        };
        if let Some(task) = assignment.take_task(donor, &task_id) {
            assignment.push_task(receiver, task);
        }
    }
}

/// Whether moving `task` from `donor` to `receiver` leaves its group's
/// per-instance partition counts within one of each other.
fn keeps_group_balanced(assignment: &Assignment, task: &Task, donor: &str, receiver: &str) -> bool {
    let moved = task.len();
    let (min, max) = assignment
        .iter()
        .map(|(id, tasks)| {
            let held: usize = tasks
                .iter()
                .filter(|t| t.stream_group_id == task.stream_group_id)
                .map(Task::len)
                .sum();
            if id == donor {
                held.saturating_sub(moved)
            } else if id == receiver {
                held + moved
            } else {
                held
            }
        })
        .fold((usize::MAX, 0), |(lo, hi), held| (lo.min(held), hi.max(held)));
    max.saturating_sub(min) <= 1
}

/// Fewest partitions of the current group, then fewest overall, then lowest id.
fn least_loaded<'a>(
    candidates: impl Iterator<Item = &'a InstanceId>,
    placement: &BTreeMap<&'a InstanceId, Vec<usize>>,
    totals: &BTreeMap<&'a InstanceId, usize>,
) -> Option<&'a InstanceId> {
    candidates.min_by_key(|id| (placement[*id].len(), totals[*id], *id))
}

impl AssignmentStrategy for StickyStrategy {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn assign(
        &self,
        live: &BTreeSet<InstanceId>,
        groups: &[StreamGroup],
        previous: &Assignment,
        _throughput: &ThroughputSnapshot,
    ) -> Result<Assignment> {
        check_inputs(live, groups)?;

        let mut assignment = Assignment::with_instances(live);
        let mut totals: BTreeMap<&InstanceId, usize> = live.iter().map(|id| (id, 0)).collect();

        for group in sorted_groups(groups) {
            let placement = self.place_group(group, live, previous, &totals);
            for (instance, parts) in &placement {
                *totals.entry(*instance).or_default() += parts.len();
            }

            let limit = group.partition_limit(self.max_partitions_per_task);
            extend_assignment(&mut assignment, build_tasks(group, &placement, previous, limit));
            if self.allow_empty_tasks {
                pad_min_tasks(&mut assignment, group);
            }
        }

        assignment.normalize();
        balance_task_counts(&mut assignment);
        assignment.normalize();
        Ok(assignment)
    }

    fn default_max_partitions_per_task(&self) -> Option<u32> {
        self.max_partitions_per_task
    }
}
