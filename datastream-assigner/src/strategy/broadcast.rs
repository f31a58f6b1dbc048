use std::collections::BTreeSet;

use super::{check_inputs, sorted_groups, AssignmentStrategy, Coverage};
use crate::error::{Error, Result};
use crate::throughput::ThroughputSnapshot;
use crate::types::{Assignment, InstanceId, StreamGroup, Task};

/// Gives every live instance every partition of every group.
///
/// For fan-out consumers that each need the full partition set. Stateless:
/// ignores the previous assignment and recomputes from scratch. When a
/// partition limit applies, each instance's copy is split into
/// `ceil(P/K)` tasks; otherwise each instance gets one task per group, empty
/// if the group's partitions are not known yet.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStrategy {
    max_partitions_per_task: Option<u32>,
}

impl BroadcastStrategy {
    pub fn new(max_partitions_per_task: Option<u32>) -> Result<Self> {
        if max_partitions_per_task == Some(0) {
            return Err(Error::invalid_config(
                "max partitions per task must be positive",
            ));
        }
        Ok(Self {
            max_partitions_per_task,
        })
    }

    fn tasks_for(&self, group: &StreamGroup, instance: &str) -> Vec<Task> {
        // Prefixes never contain '@', so the id splits back into one
        // (prefix, instance, n) triple.
        let prefix = format!("{}@{}", group.task_prefix(), instance);
        let limit = group.partition_limit(self.max_partitions_per_task);

        let chunks: Vec<Vec<String>> = match limit {
            Some(limit) if !group.partitions.is_empty() => group
                .partitions
                .chunks(limit)
                .map(<[String]>::to_vec)
                .collect(),
            _ => vec![group.partitions.clone()],
        };

        chunks
            .into_iter()
            .enumerate()
            .map(|(n, partitions)| Task::new(format!("{prefix}_{n}"), group.id.clone(), partitions))
            .collect()
    }
}

impl AssignmentStrategy for BroadcastStrategy {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn assign(
        &self,
        live: &BTreeSet<InstanceId>,
        groups: &[StreamGroup],
        _previous: &Assignment,
        _throughput: &ThroughputSnapshot,
    ) -> Result<Assignment> {
        check_inputs(live, groups)?;

        let mut assignment = Assignment::with_instances(live);
        for group in sorted_groups(groups) {
            for instance in live {
                for task in self.tasks_for(group, instance) {
                    assignment.push_task(instance, task);
                }
            }
        }
        assignment.normalize();
        Ok(assignment)
    }

    fn coverage(&self) -> Coverage {
        Coverage::Broadcast
    }

    fn default_max_partitions_per_task(&self) -> Option<u32> {
        self.max_partitions_per_task
    }
}
