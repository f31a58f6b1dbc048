mod common;

use std::collections::HashMap;

use datastream_assigner::strategy::{AssignmentStrategy, Strategy, MAX_PARTITIONS_PER_TASK};
use datastream_assigner::throughput::ThroughputSnapshot;
use datastream_assigner::types::{Assignment, StreamGroup, Task};
use datastream_assigner::validation::validate_assignment;

use common::*;

/// Run each property against every strategy variant.
macro_rules! strategy_tests {
    ($( $(#[$meta:meta])* $name:ident ),* $(,)?) => {
        mod broadcast {
            $(
                $(#[$meta])*
                #[test]
                fn $name() {
                    super::$name("broadcast");
                }
            )*
        }

        mod sticky {
            $(
                $(#[$meta])*
                #[test]
                fn $name() {
                    super::$name("sticky");
                }
            )*
        }

        mod load_based {
            $(
                $(#[$meta])*
                #[test]
                fn $name() {
                    super::$name("load-based");
                }
            )*
        }
    };
}

strategy_tests! {
    covers_every_partition,
    only_live_instances_hold_tasks,
    deterministic_for_identical_inputs,
    stable_without_changes,
    respects_partition_limit,
    recovers_from_instance_loss,
}

fn strategy(name: &str, properties: &[(&str, &str)]) -> Strategy {
    let properties: HashMap<String, String> = properties
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Strategy::from_properties(name, &properties).unwrap()
}

fn workload() -> (Vec<StreamGroup>, ThroughputSnapshot) {
    let groups = vec![group("orders", 7), group("clicks", 3), group("elastic", 0)];
    (groups, snapshot(&[50, 10, 30, 70, 20, 40, 60]))
}

fn assert_valid(strategy: &Strategy, assignment: &Assignment, live: &[&str], groups: &[StreamGroup]) {
    validate_assignment(
        assignment,
        &instances(live),
        groups,
        strategy.coverage(),
        strategy.default_max_partitions_per_task(),
    )
    .unwrap_or_else(|e| panic!("{} produced an invalid assignment: {e}", strategy.name()));
}

// ── Shared properties ───────────────────────────────────────────

fn covers_every_partition(name: &str) {
    let strategy = strategy(name, &[]);
    let (groups, throughput) = workload();
    let live = ["w-0", "w-1", "w-2"];

    let result = strategy
        .assign(&instances(&live), &groups, &Assignment::new(), &throughput)
        .unwrap();

    assert_valid(&strategy, &result, &live, &groups);
    let owned: usize = result.iter().map(|(id, _)| result.partition_count(id)).sum();
    let expected = match name {
        "broadcast" => 10 * live.len(),
        _ => 10,
    };
    assert_eq!(owned, expected);
}

fn only_live_instances_hold_tasks(name: &str) {
    let strategy = strategy(name, &[]);
    let (groups, throughput) = workload();

    let mut previous = Assignment::new();
    previous.push_task("gone", Task::new("orders_0", "orders", vec!["p0".into(), "p1".into()]));
    previous.push_task("w-0", Task::new("orders_1", "orders", vec!["p2".into()]));

    let result = strategy
        .assign(&instances(&["w-0", "w-1"]), &groups, &previous, &throughput)
        .unwrap();

    assert!(!result.contains_instance("gone"));
    assert_eq!(result.instances().collect::<Vec<_>>(), vec!["w-0", "w-1"]);
    assert_valid(&strategy, &result, &["w-0", "w-1"], &groups);
}

fn deterministic_for_identical_inputs(name: &str) {
    let strategy = strategy(name, &[]);
    let (groups, throughput) = workload();
    let live = instances(&["w-2", "w-0", "w-1"]);

    let first = strategy.assign(&live, &groups, &Assignment::new(), &throughput).unwrap();
    let second = strategy.assign(&live, &groups, &Assignment::new(), &throughput).unwrap();
    assert_eq!(first, second);

    let mut reordered = groups.clone();
    reordered.reverse();
    let third = strategy.assign(&live, &reordered, &Assignment::new(), &throughput).unwrap();
    assert_eq!(first, third);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&third).unwrap()
    );
}

fn stable_without_changes(name: &str) {
    let strategy = strategy(name, &[]);
    let (groups, throughput) = workload();
    let live = instances(&["w-0", "w-1", "w-2"]);

    let first = strategy.assign(&live, &groups, &Assignment::new(), &throughput).unwrap();
    let second = strategy.assign(&live, &groups, &first, &throughput).unwrap();
    assert_eq!(first, second);
}

fn respects_partition_limit(name: &str) {
    let strategy = strategy(name, &[(MAX_PARTITIONS_PER_TASK, "2")]);
    let (groups, throughput) = workload();
    let live = ["w-0", "w-1"];

    let result = strategy
        .assign(&instances(&live), &groups, &Assignment::new(), &throughput)
        .unwrap();

    assert_valid(&strategy, &result, &live, &groups);
    for (_, tasks) in result.iter() {
        assert!(tasks.iter().all(|t| t.len() <= 2));
    }
    // ceil(7/2) tasks at least for the largest group
    let orders_tasks = result.tasks_for_group("orders").count();
    assert!(orders_tasks >= 4, "orders has {orders_tasks} tasks");
}

fn recovers_from_instance_loss(name: &str) {
    let strategy = strategy(name, &[]);
    let (groups, throughput) = workload();

    let before = strategy
        .assign(&instances(&["w-0", "w-1", "w-2"]), &groups, &Assignment::new(), &throughput)
        .unwrap();
    let after = strategy
        .assign(&instances(&["w-0", "w-2"]), &groups, &before, &throughput)
        .unwrap();

    assert_valid(&strategy, &after, &["w-0", "w-2"], &groups);
    assert!(!after.contains_instance("w-1"));
}

// ── Scenarios ───────────────────────────────────────────────────

#[test]
fn scenario_a_broadcast_gives_everyone_everything() {
    let strategy = strategy("broadcast", &[]);
    let groups = vec![group("g", 6)];
    let live = instances(&["a", "b", "c"]);

    let result = strategy
        .assign(&live, &groups, &Assignment::new(), &ThroughputSnapshot::new())
        .unwrap();

    for instance in &live {
        let tasks = result.tasks(instance);
        assert_eq!(tasks.len(), 1, "{instance} should hold exactly one task");
        assert_eq!(tasks[0].partition_ids, vec!["p0", "p1", "p2", "p3", "p4", "p5"]);
    }
}

#[test]
fn scenario_b_sticky_reassigns_removed_instance() {
    let strategy = strategy("sticky", &[]);
    let groups = vec![group_with("g", &["p1", "p2", "p3", "p4"])];

    let mut previous = Assignment::new();
    previous.push_task("A", Task::new("g_0", "g", vec!["p1".into(), "p2".into()]));
    previous.push_task("B", Task::new("g_1", "g", vec!["p3".into(), "p4".into()]));

    let result = strategy
        .assign(&instances(&["A"]), &groups, &previous, &ThroughputSnapshot::new())
        .unwrap();

    assert!(!result.contains_instance("B"));
    assert_eq!(result.partition_count("A"), 4);
    // A's original task keeps its id and partitions
    assert_eq!(result.tasks("A")[0].task_id, "g_0");
    assert_eq!(result.tasks("A")[0].partition_ids, vec!["p1", "p2", "p3", "p4"]);
}

#[test]
fn scenario_c_load_based_greedy_descending() {
    let strategy = strategy("load-based", &[]);
    let groups = vec![group("g", 6)];
    let throughput = snapshot(&[100, 80, 60, 40, 20, 10]);

    let result = strategy
        .assign(&instances(&["a", "b"]), &groups, &Assignment::new(), &throughput)
        .unwrap();

    let loads = loads(&result, &throughput);
    let mut values: Vec<u64> = loads.values().copied().collect();
    values.sort_unstable();
    // 310 KB/s cannot split evenly into halves made of these partitions
    // any better than 150 / 160.
    assert_eq!(values, vec![150, 160]);
}

#[test]
fn sticky_scale_out_moves_minimum() {
    let strategy = strategy("sticky", &[]);
    let groups = vec![group("g", 12)];

    let before = strategy
        .assign(&instances(&["a", "b", "c"]), &groups, &Assignment::new(), &ThroughputSnapshot::new())
        .unwrap();
    let after = strategy
        .assign(&instances(&["a", "b", "c", "d"]), &groups, &before, &ThroughputSnapshot::new())
        .unwrap();

    let moves = datastream_assigner::util::compute_partition_moves(&before, &after);
    assert_eq!(moves.len(), 3);
    assert!(moves.iter().all(|m| m.to == "d"));
    for instance in ["a", "b", "c", "d"] {
        assert_eq!(after.partition_count(instance), 3);
    }
}

#[test]
fn sticky_scale_out_balances_task_counts() {
    let strategy = strategy("sticky", &[]);
    let groups: Vec<StreamGroup> = ["g1", "g2", "g3", "g4"].iter().map(|id| group(id, 1)).collect();

    let before = strategy
        .assign(&instances(&["a"]), &groups, &Assignment::new(), &ThroughputSnapshot::new())
        .unwrap();
    assert_eq!(before.tasks("a").len(), 4);

    let live = ["a", "b"];
    let after = strategy
        .assign(&instances(&live), &groups, &before, &ThroughputSnapshot::new())
        .unwrap();

    assert_valid(&strategy, &after, &live, &groups);
    let counts: Vec<usize> = live.iter().map(|i| after.tasks(i).len()).collect();
    let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
    assert!(spread <= 1, "task counts {counts:?} differ by more than one");

    // Tasks move whole, so only the moved groups' partitions change owner.
    let moves = datastream_assigner::util::compute_partition_moves(&before, &after);
    assert_eq!(moves.len(), 2);
    assert!(moves.iter().all(|m| m.from == "a" && m.to == "b"));
}

#[test]
fn load_based_balance_bound_holds() {
    let strategy = strategy("load-based", &[("imbalanceThreshold", "15")]);
    let rates = [90, 85, 70, 64, 51, 40, 33, 25, 18, 12, 9, 4];
    let groups = vec![group("g", rates.len())];
    let throughput = snapshot(&rates);

    let result = strategy
        .assign(&instances(&["a", "b", "c"]), &groups, &Assignment::new(), &throughput)
        .unwrap();

    let loads = loads(&result, &throughput);
    let max = loads.values().max().copied().unwrap();
    let min = loads.values().min().copied().unwrap();
    let largest = rates.iter().copied().max().unwrap();
    assert!(
        max - min <= largest.max(15),
        "spread {} exceeds both threshold and largest partition",
        max - min
    );
}
