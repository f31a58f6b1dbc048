mod broadcast;
mod load_based;
mod sticky;

pub use broadcast::BroadcastStrategy;
pub use load_based::{LoadBasedConfig, LoadBasedStrategy};
pub use sticky::StickyStrategy;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::throughput::{PartitionThroughput, ThroughputSnapshot};
use crate::types::{Assignment, InstanceId, StreamGroup, Task};
use crate::util;

/// How partitions must be covered by a valid assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// Every partition is owned by exactly one instance.
    Exclusive,
    /// Every instance owns every partition exactly once.
    Broadcast,
}

/// Trait for partition assignment strategies.
///
/// The engine calls `assign` on every rebalance with a snapshot of its
/// inputs. Implementations are pure: no I/O, no shared mutable state, and
/// the same inputs always produce the same assignment, so any instance can
/// check a coordinator's result.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the assignment for `groups` over `live` instances.
    ///
    /// - `live`: instances eligible for tasks
    /// - `groups`: active stream groups (paused groups already removed)
    /// - `previous`: last published assignment (empty on first run)
    /// - `throughput`: estimates; ignored by strategies that do not use them
    fn assign(
        &self,
        live: &BTreeSet<InstanceId>,
        groups: &[StreamGroup],
        previous: &Assignment,
        throughput: &ThroughputSnapshot,
    ) -> Result<Assignment>;

    fn coverage(&self) -> Coverage {
        Coverage::Exclusive
    }

    /// Whether the engine should fetch a throughput snapshot before calling
    /// `assign`.
    fn uses_throughput(&self) -> bool {
        false
    }

    /// Limit applied to groups without their own `max_partitions_per_task`.
    fn default_max_partitions_per_task(&self) -> Option<u32> {
        None
    }
}

pub const MAX_PARTITIONS_PER_TASK: &str = "maxPartitionsPerTask";
pub const IMBALANCE_THRESHOLD: &str = "imbalanceThreshold";
pub const DEFAULT_THROUGHPUT_ESTIMATE: &str = "defaultThroughputEstimate";
pub const DEFAULT_MESSAGES_ESTIMATE: &str = "defaultMessagesEstimate";
pub const MAX_REBALANCE_MOVES: &str = "maxRebalanceMoves";
pub const ALLOW_EMPTY_TASKS: &str = "allowEmptyTasks";

/// The closed set of strategies, selected by name at construction.
#[derive(Debug, Clone)]
pub enum Strategy {
    Broadcast(BroadcastStrategy),
    Sticky(StickyStrategy),
    LoadBased(LoadBasedStrategy),
}

impl Strategy {
    /// Build a strategy from its name and a property bag.
    ///
    /// Names are matched case-insensitively with `-` and `_` ignored, so
    /// `load-based`, `LOAD_BASED` and `loadbased` are the same strategy.
    pub fn from_properties(name: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        let max_partitions_per_task = parse_partition_limit(properties)?;
        let allow_empty_tasks = parse_property::<bool>(properties, ALLOW_EMPTY_TASKS)?.unwrap_or(false);

        match normalized.as_str() {
            "broadcast" => Ok(Self::Broadcast(BroadcastStrategy::new(max_partitions_per_task)?)),
            "sticky" => Ok(Self::Sticky(StickyStrategy::new(
                max_partitions_per_task,
                allow_empty_tasks,
            )?)),
            "loadbased" => {
                let defaults = LoadBasedConfig::default();
                let config = LoadBasedConfig {
                    max_partitions_per_task,
                    imbalance_threshold: parse_property(properties, IMBALANCE_THRESHOLD)?
                        .unwrap_or(defaults.imbalance_threshold),
                    default_throughput: PartitionThroughput::new(
                        parse_property(properties, DEFAULT_THROUGHPUT_ESTIMATE)?
                            .unwrap_or(defaults.default_throughput.bytes_in_kb_per_sec),
                        parse_property(properties, DEFAULT_MESSAGES_ESTIMATE)?
                            .unwrap_or(defaults.default_throughput.messages_per_sec),
                    ),
                    max_rebalance_moves: parse_property(properties, MAX_REBALANCE_MOVES)?
                        .unwrap_or(defaults.max_rebalance_moves),
                    allow_empty_tasks,
                };
                Ok(Self::LoadBased(LoadBasedStrategy::new(config)?))
            }
            _ => Err(Error::invalid_config(format!(
                "unknown assignment strategy {name:?}"
            ))),
        }
    }

    fn inner(&self) -> &dyn AssignmentStrategy {
        match self {
            Self::Broadcast(s) => s,
            Self::Sticky(s) => s,
            Self::LoadBased(s) => s,
        }
    }
}

impl AssignmentStrategy for Strategy {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn assign(
        &self,
        live: &BTreeSet<InstanceId>,
        groups: &[StreamGroup],
        previous: &Assignment,
        throughput: &ThroughputSnapshot,
    ) -> Result<Assignment> {
        self.inner().assign(live, groups, previous, throughput)
    }

    fn coverage(&self) -> Coverage {
        self.inner().coverage()
    }

    fn uses_throughput(&self) -> bool {
        self.inner().uses_throughput()
    }

    fn default_max_partitions_per_task(&self) -> Option<u32> {
        self.inner().default_max_partitions_per_task()
    }
}

fn parse_property<T: std::str::FromStr>(
    properties: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    properties
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::invalid_config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

/// Parsed as signed so that `0` and negative values are reported as invalid
/// rather than as parse failures.
fn parse_partition_limit(properties: &HashMap<String, String>) -> Result<Option<u32>> {
    match parse_property::<i64>(properties, MAX_PARTITIONS_PER_TASK)? {
        None => Ok(None),
        Some(limit) => check_partition_limit(limit).map(Some),
    }
}

pub(crate) fn check_partition_limit(limit: i64) -> Result<u32> {
    if limit <= 0 {
        return Err(Error::invalid_config(format!(
            "{MAX_PARTITIONS_PER_TASK} must be positive, got {limit}"
        )));
    }
    u32::try_from(limit)
        .map_err(|_| Error::invalid_config(format!("{MAX_PARTITIONS_PER_TASK} {limit} is too large")))
}

// ── Shared helpers ──────────────────────────────────────────────

/// Checks common to every strategy. Runs before any placement so a bad input
/// never produces a partial assignment.
pub(crate) fn check_inputs(live: &BTreeSet<InstanceId>, groups: &[StreamGroup]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut prefixes = HashMap::new();
    for group in groups {
        if !ids.insert(group.id.as_str()) {
            return Err(Error::invalid_config(format!(
                "duplicate stream group id {}",
                group.id
            )));
        }
        // Task ids are derived from the prefix, so two groups sharing one
        // would mint the same ids.
        util::validate_identifier(group.task_prefix())?;
        if let Some(other) = prefixes.insert(group.task_prefix(), group.id.as_str()) {
            return Err(Error::invalid_config(format!(
                "stream groups {other} and {} share task prefix {}",
                group.id,
                group.task_prefix()
            )));
        }
        if group.max_partitions_per_task == Some(0) {
            return Err(Error::invalid_config(format!(
                "stream group {}: {MAX_PARTITIONS_PER_TASK} must be positive",
                group.id
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = group.partitions.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(Error::invalid_config(format!(
                "stream group {} lists partition {dup} more than once",
                group.id
            )));
        }
    }

    if live.is_empty() && !groups.is_empty() {
        return Err(Error::Unassignable {
            groups: groups.len(),
        });
    }
    Ok(())
}

/// Groups sorted by id, the order every strategy processes them in.
pub(crate) fn sorted_groups(groups: &[StreamGroup]) -> Vec<&StreamGroup> {
    let mut sorted: Vec<&StreamGroup> = groups.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));
    sorted
}

/// Previous live owner of each of `group`'s partitions, by partition index.
///
/// Partitions that left the group, and owners no longer live, are dropped.
pub(crate) fn previous_owners<'a>(
    group: &StreamGroup,
    previous: &Assignment,
    live: &'a BTreeSet<InstanceId>,
) -> BTreeMap<usize, &'a InstanceId> {
    let index = group.partition_index();
    let mut owners = BTreeMap::new();
    for (instance, task) in previous.tasks_for_group(&group.id) {
        let Some(owner) = live.get(instance) else {
            continue;
        };
        for key in &task.partition_ids {
            if let Some(&i) = index.get(key.as_str()) {
                owners.entry(i).or_insert(owner);
            }
        }
    }
    owners
}

/// Hands out `{prefix}_{n}` ids, lowest unused `n` first.
pub(crate) struct TaskIdAllocator<'a> {
    prefix: &'a str,
    used: BTreeSet<String>,
    next: usize,
}

impl<'a> TaskIdAllocator<'a> {
    pub(crate) fn new(prefix: &'a str) -> Self {
        Self {
            prefix,
            used: BTreeSet::new(),
            next: 0,
        }
    }

    /// Reserve an existing id. Returns false if it is already taken.
    pub(crate) fn reserve(&mut self, id: &str) -> bool {
        self.used.insert(id.to_string())
    }

    pub(crate) fn allocate(&mut self) -> String {
        loop {
            let candidate = format!("{}_{}", self.prefix, self.next);
            self.next += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

/// Pack each instance's partitions of `group` into tasks of at most `limit`
/// partitions.
///
/// `placement` maps instance -> partition indices into `group.partitions`.
/// Previous tasks of this group on the same instance keep their id and
/// whichever of their partitions stayed; remaining partitions fill tasks
/// with room before new tasks are opened. Tasks left empty are dropped.
pub(crate) fn build_tasks(
    group: &StreamGroup,
    placement: &BTreeMap<&InstanceId, Vec<usize>>,
    previous: &Assignment,
    limit: Option<usize>,
) -> BTreeMap<InstanceId, Vec<Task>> {
    let index = group.partition_index();
    let mut claimed = vec![false; group.partitions.len()];
    let mut ids = TaskIdAllocator::new(group.task_prefix());
    let mut packed: BTreeMap<&InstanceId, Vec<(String, Vec<usize>)>> = BTreeMap::new();

    // Retain previous tasks first so that their ids are reserved before any
    // new id is handed out.
    for (&instance, owned) in placement {
        let owned: HashSet<usize> = owned.iter().copied().collect();
        let mut kept = Vec::new();
        for task in previous
            .tasks(instance)
            .iter()
            .filter(|t| t.stream_group_id == group.id)
        {
            let mut retained: Vec<usize> = task
                .partition_ids
                .iter()
                .filter_map(|key| index.get(key.as_str()).copied())
                .filter(|i| owned.contains(i) && !claimed[*i])
                .collect();
            retained.sort_unstable();
            retained.dedup();
            if let Some(limit) = limit {
                retained.truncate(limit);
            }
            if retained.is_empty() || !ids.reserve(&task.task_id) {
                continue;
            }
            for &i in &retained {
                claimed[i] = true;
            }
            kept.push((task.task_id.clone(), retained));
        }
        packed.insert(instance, kept);
    }

    for (&instance, owned) in placement {
        let mut leftovers: Vec<usize> = owned.iter().copied().filter(|i| !claimed[*i]).collect();
        leftovers.sort_unstable();
        let tasks = packed.entry(instance).or_default();
        for i in leftovers {
            claimed[i] = true;
            match tasks
                .iter_mut()
                .find(|(_, parts)| limit.map_or(true, |limit| parts.len() < limit))
            {
                Some((_, parts)) => parts.push(i),
                None => tasks.push((ids.allocate(), vec![i])),
            }
        }
    }

    packed
        .into_iter()
        .map(|(instance, tasks)| {
            let tasks = tasks
                .into_iter()
                .map(|(task_id, mut parts)| {
                    parts.sort_unstable();
                    let keys = parts.iter().map(|&i| group.partitions[i].clone()).collect();
                    Task::new(task_id, group.id.clone(), keys)
                })
                .collect();
            (instance.clone(), tasks)
        })
        .collect()
}

/// Top `group` up to `min_tasks` tasks with empty ones, each placed on the
/// instance holding the fewest tasks overall (ties: lowest id).
pub(crate) fn pad_min_tasks(assignment: &mut Assignment, group: &StreamGroup) {
    let existing: Vec<String> = assignment
        .tasks_for_group(&group.id)
        .map(|(_, t)| t.task_id.clone())
        .collect();
    let mut ids = TaskIdAllocator::new(group.task_prefix());
    for id in &existing {
        ids.reserve(id);
    }

    let mut count = existing.len();
    while count < group.min_tasks as usize {
        let Some(target) = assignment
            .iter()
            .min_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone())
        else {
            return;
        };
        assignment.push_task(&target, Task::new(ids.allocate(), group.id.clone(), Vec::new()));
        count += 1;
    }
}

/// Merge one group's packed tasks into `assignment`.
pub(crate) fn extend_assignment(assignment: &mut Assignment, tasks: BTreeMap<InstanceId, Vec<Task>>) {
    for (instance, tasks) in tasks {
        for task in tasks {
            assignment.push_task(&instance, task);
        }
    }
}
