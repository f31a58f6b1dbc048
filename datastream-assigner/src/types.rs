use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Stable identifier of a worker instance (e.g. pod name).
pub type InstanceId = String;

/// One unit of source data within a stream group: a table shard, a
/// topic-partition, a change-stream slot.
///
/// Identity is the `(stream_group, key)` pair; the same key in two groups is
/// two different partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub stream_group: String,
    pub key: String,
}

impl Partition {
    pub fn new(stream_group: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            stream_group: stream_group.into(),
            key: key.into(),
        }
    }
}

/// A set of logical streams that share source partitioning and are therefore
/// assigned as a unit.
///
/// Created and removed by the management layer; stored under
/// `{prefix}stream-groups/{id}` when coordination runs on etcd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamGroup {
    pub id: String,
    /// Names of the logical stream definitions in this group.
    #[serde(default)]
    pub streams: Vec<String>,
    /// Source connection string, e.g. `kafka://broker-1:9092/events`.
    pub source: String,
    /// Destination connection string.
    pub destination: String,
    /// Cluster whose throughput statistics describe this group's partitions.
    pub source_cluster: String,
    /// Logical prefix for task ids and hashed group ids. Defaults to `id`.
    #[serde(default)]
    pub task_prefix: Option<String>,
    /// Ordered partition keys. Empty when the partition set is elastic or not
    /// yet known.
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Overrides the strategy-wide limit when set.
    #[serde(default)]
    pub max_partitions_per_task: Option<u32>,
    /// Minimum number of tasks, honored with empty tasks only when the
    /// strategy allows them.
    #[serde(default)]
    pub min_tasks: u32,
    #[serde(default)]
    pub paused: bool,
}

impl StreamGroup {
    pub fn task_prefix(&self) -> &str {
        self.task_prefix.as_deref().unwrap_or(&self.id)
    }

    pub fn is_active(&self) -> bool {
        !self.paused
    }

    /// Position of every partition key in the group's ordered partition list.
    pub fn partition_index(&self) -> HashMap<&str, usize> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect()
    }

    pub fn partition(&self, key: &str) -> Partition {
        Partition::new(self.id.clone(), key)
    }

    /// Effective max partitions per task: the group override, else the
    /// strategy default, else unlimited (`None`).
    pub fn partition_limit(&self, strategy_default: Option<u32>) -> Option<usize> {
        self.max_partitions_per_task
            .or(strategy_default)
            .map(|limit| limit as usize)
    }

    /// Lower bound on the number of tasks needed to carry every partition.
    pub fn required_tasks(&self, limit: Option<usize>) -> usize {
        match limit {
            _ if self.partitions.is_empty() => 0,
            Some(limit) if limit > 0 => self.partitions.len().div_ceil(limit),
            _ => 1,
        }
    }
}

/// The unit of assignment: partitions of one stream group owned atomically by
/// one instance.
///
/// This is also the published task descriptor consumed by every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub stream_group_id: String,
    pub partition_ids: Vec<String>,
}

impl Task {
    pub fn new(
        task_id: impl Into<String>,
        stream_group_id: impl Into<String>,
        partition_ids: Vec<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            stream_group_id: stream_group_id.into(),
            partition_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partition_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partition_ids.len()
    }

    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        self.partition_ids
            .iter()
            .map(|key| Partition::new(self.stream_group_id.clone(), key.clone()))
    }
}

/// Mapping from instance to its ordered tasks.
///
/// Every live instance is present, possibly with no tasks, so consumers of a
/// published assignment can tell "owns nothing" from "unknown instance".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignment {
    instances: BTreeMap<InstanceId, Vec<Task>>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty assignment with an entry for each of `instances`.
    pub fn with_instances<'a>(instances: impl IntoIterator<Item = &'a InstanceId>) -> Self {
        Self {
            instances: instances
                .into_iter()
                .map(|id| (id.clone(), Vec::new()))
                .collect(),
        }
    }

    pub fn from_map(instances: BTreeMap<InstanceId, Vec<Task>>) -> Self {
        let mut assignment = Self { instances };
        assignment.normalize();
        assignment
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.keys()
    }

    pub fn contains_instance(&self, instance: &str) -> bool {
        self.instances.contains_key(instance)
    }

    pub fn tasks(&self, instance: &str) -> &[Task] {
        self.instances
            .get(instance)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstanceId, &[Task])> {
        self.instances.iter().map(|(id, tasks)| (id, tasks.as_slice()))
    }

    /// All tasks of one stream group, with their owners.
    pub fn tasks_for_group<'a>(
        &'a self,
        stream_group: &'a str,
    ) -> impl Iterator<Item = (&'a InstanceId, &'a Task)> + 'a {
        self.instances.iter().flat_map(move |(id, tasks)| {
            tasks
                .iter()
                .filter(move |t| t.stream_group_id == stream_group)
                .map(move |t| (id, t))
        })
    }

    pub fn push_task(&mut self, instance: &str, task: Task) {
        self.instances
            .entry(instance.to_string())
            .or_default()
            .push(task);
    }

    pub(crate) fn take_task(&mut self, instance: &str, task_id: &str) -> Option<Task> {
        let tasks = self.instances.get_mut(instance)?;
        let pos = tasks.iter().position(|t| t.task_id == task_id)?;
        Some(tasks.remove(pos))
    }

    pub fn task_count(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    pub fn partition_count(&self, instance: &str) -> usize {
        self.tasks(instance).iter().map(Task::len).sum()
    }

    /// Owner of every partition. If a partition appears more than once, the
    /// lowest instance id wins.
    pub fn partition_owners(&self) -> BTreeMap<Partition, &InstanceId> {
        let mut owners = BTreeMap::new();
        for (id, tasks) in &self.instances {
            for partition in tasks.iter().flat_map(Task::partitions) {
                owners.entry(partition).or_insert(id);
            }
        }
        owners
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    /// Orders each instance's tasks by `(stream_group_id, task_id)`.
    pub(crate) fn normalize(&mut self) {
        for tasks in self.instances.values_mut() {
            tasks.sort_by(|a, b| {
                (&a.stream_group_id, &a.task_id).cmp(&(&b.stream_group_id, &b.task_id))
            });
        }
    }
}

/// An assignment as durably recorded by the coordination store.
///
/// Stored under `{prefix}assignment`. `epoch` increases by one with every
/// successful publication; a publisher must name the epoch it supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAssignment {
    pub epoch: u64,
    pub published_at: i64,
    pub assignment: Assignment,
}

/// A worker registered under `{prefix}instances/{instance_id}` with a lease
/// attached. When the lease expires the key disappears and the instance
/// leaves the live set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredInstance {
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub registered_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Eligible for tasks.
    Ready,
    /// Shutting down gracefully; excluded from new assignments.
    Draining,
}

/// Why a rebalance was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RebalanceTrigger {
    /// First computation after becoming coordinator.
    Initial,
    /// An instance joined, left or changed status.
    MembershipChanged,
    /// A stream group was added, removed, paused, resumed or had its
    /// partition list changed.
    StreamGroupsChanged,
    /// Periodic re-evaluation, e.g. to pick up new throughput estimates.
    Periodic,
    /// Requested explicitly by an operator or test.
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(partitions: &[&str]) -> StreamGroup {
        StreamGroup {
            id: "orders".to_string(),
            streams: vec!["orders-mysql".to_string()],
            source: "mysql://db-1/orders".to_string(),
            destination: "kafka://broker-1:9092/orders".to_string(),
            source_cluster: "db-1".to_string(),
            task_prefix: None,
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            max_partitions_per_task: None,
            min_tasks: 0,
            paused: false,
        }
    }

    #[test]
    fn task_prefix_defaults_to_id() {
        let mut g = group(&[]);
        assert_eq!(g.task_prefix(), "orders");
        g.task_prefix = Some("orders-v2".to_string());
        assert_eq!(g.task_prefix(), "orders-v2");
    }

    #[test]
    fn partition_limit_prefers_group_override() {
        let mut g = group(&["p0"]);
        assert_eq!(g.partition_limit(None), None);
        assert_eq!(g.partition_limit(Some(4)), Some(4));
        g.max_partitions_per_task = Some(2);
        assert_eq!(g.partition_limit(Some(4)), Some(2));
    }

    #[test]
    fn required_tasks_rounds_up() {
        let g = group(&["p0", "p1", "p2", "p3", "p4"]);
        assert_eq!(g.required_tasks(Some(2)), 3);
        assert_eq!(g.required_tasks(Some(5)), 1);
        assert_eq!(g.required_tasks(None), 1);
        assert_eq!(group(&[]).required_tasks(Some(2)), 0);
    }

    #[test]
    fn stream_group_deserializes_with_defaults() {
        let json = r#"{
            "id": "orders",
            "source": "mysql://db-1/orders",
            "destination": "kafka://broker-1:9092/orders",
            "sourceCluster": "db-1"
        }"#;
        let g: StreamGroup = serde_json::from_str(json).unwrap();
        assert!(g.partitions.is_empty());
        assert!(g.is_active());
        assert_eq!(g.min_tasks, 0);
        assert_eq!(g.max_partitions_per_task, None);
    }

    #[test]
    fn task_serializes_as_descriptor() {
        let task = Task::new("orders_0", "orders", vec!["p0".to_string()]);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "taskId": "orders_0",
                "streamGroupId": "orders",
                "partitionIds": ["p0"],
            })
        );
    }

    #[test]
    fn published_assignment_schema() {
        let mut assignment = Assignment::new();
        assignment.push_task(
            "worker-0",
            Task::new("orders_0", "orders", vec!["p0".to_string(), "p1".to_string()]),
        );
        let published = PublishedAssignment {
            epoch: 7,
            published_at: 1700000000,
            assignment,
        };
        let json = serde_json::to_value(&published).unwrap();
        assert_eq!(json["epoch"], 7);
        assert_eq!(json["assignment"]["worker-0"][0]["taskId"], "orders_0");
        let back: PublishedAssignment = serde_json::from_value(json).unwrap();
        assert_eq!(back, published);
    }

    #[test]
    fn normalize_orders_tasks_by_group_then_id() {
        let mut map = BTreeMap::new();
        map.insert(
            "worker-0".to_string(),
            vec![
                Task::new("b_0", "b", vec![]),
                Task::new("a_1", "a", vec![]),
                Task::new("a_0", "a", vec![]),
            ],
        );
        let assignment = Assignment::from_map(map);
        let ids: Vec<&str> = assignment
            .tasks("worker-0")
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a_0", "a_1", "b_0"]);
    }

    #[test]
    fn partition_owners_first_instance_wins() {
        let mut assignment = Assignment::new();
        assignment.push_task("b", Task::new("g_0", "g", vec!["p0".to_string()]));
        assignment.push_task("a", Task::new("g_1", "g", vec!["p0".to_string()]));
        let owners = assignment.partition_owners();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[&Partition::new("g", "p0")], "a");
    }

    #[test]
    fn with_instances_lists_empty_owners() {
        let live = ["a".to_string(), "b".to_string()];
        let assignment = Assignment::with_instances(live.iter());
        assert!(assignment.contains_instance("a"));
        assert!(assignment.tasks("b").is_empty());
        assert!(assignment.is_empty());
    }
}
