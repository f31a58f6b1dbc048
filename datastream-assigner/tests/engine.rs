mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use datastream_assigner::coordination::{Coordination, InMemoryCoordination};
use datastream_assigner::engine::{AssignmentEngine, RebalanceOutcome};
use datastream_assigner::strategy::{AssignmentStrategy, Strategy};
use datastream_assigner::throughput::{FileThroughputProvider, StaticThroughputProvider, ThroughputProvider};
use datastream_assigner::types::{Assignment, Partition, RebalanceTrigger};

use common::*;

/// Poll the engine until its current assignment satisfies `predicate`.
async fn wait_for_published(engine: &Arc<AssignmentEngine>, predicate: fn(&Assignment) -> bool) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let engine = Arc::clone(engine);
        async move {
            engine
                .current()
                .await
                .is_some_and(|p| predicate(&p.assignment))
        }
    })
    .await;
}

fn load_based() -> Arc<dyn AssignmentStrategy> {
    Arc::new(Strategy::from_properties("load-based", &HashMap::new()).unwrap())
}

fn sticky() -> Arc<dyn AssignmentStrategy> {
    Arc::new(Strategy::from_properties("sticky", &HashMap::new()).unwrap())
}

async fn seeded(instances: &[&str], groups: &[(&str, usize)]) -> Arc<InMemoryCoordination> {
    let coordination = Arc::new(InMemoryCoordination::new());
    for instance in instances {
        coordination.add_instance(*instance).await;
    }
    for (id, n) in groups {
        coordination.put_stream_group(group(id, *n)).await;
    }
    coordination
}

#[tokio::test]
async fn file_throughput_drives_load_based_assignment() {
    let coordination = seeded(&["a", "b"], &[("g", 6)]).await;
    let throughput: Arc<dyn ThroughputProvider> =
        Arc::new(FileThroughputProvider::new(fixture_path("partition_throughput.json")));
    let engine = build_engine(coordination.clone(), load_based(), throughput);

    let outcome = engine.rebalance(RebalanceTrigger::Initial).await.unwrap();
    assert!(matches!(outcome, RebalanceOutcome::Published { epoch: 1, .. }));

    let published = engine.current().await.unwrap();
    let owners = published.assignment.partition_owners();
    let covered: BTreeSet<&Partition> = owners.keys().collect();
    assert_eq!(covered.len(), 6);

    let total: usize = ["a", "b"]
        .iter()
        .map(|i| published.assignment.partition_count(i))
        .sum();
    assert_eq!(total, 6);
    assert!(published.assignment.partition_count("a") > 0);
    assert!(published.assignment.partition_count("b") > 0);

    let verified = engine.verify_published().await.unwrap().unwrap();
    assert_eq!(verified.epoch, 1);
}

#[tokio::test]
async fn superseded_computation_is_discarded() {
    let coordination = seeded(&["a", "b"], &[("g", 4)]).await;
    let gate = Arc::new(GatedThroughputProvider::new(StaticThroughputProvider::new([
        cluster_info(&[10, 20, 30, 40]),
    ])));
    let engine = build_engine(coordination.clone(), load_based(), gate.clone());

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.rebalance(RebalanceTrigger::Initial).await })
    };
    gate.entered.notified().await;
    engine.notify(RebalanceTrigger::Manual);
    gate.release.notify_one();

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome, RebalanceOutcome::Superseded);
    assert_eq!(coordination.publications().await, 0);
    assert!(engine.current().await.is_none());
}

#[tokio::test]
async fn superseded_computation_is_retried() {
    let coordination = seeded(&["a", "b"], &[("g", 4)]).await;
    let gate = Arc::new(GatedThroughputProvider::new(StaticThroughputProvider::new([
        cluster_info(&[10, 20, 30, 40]),
    ])));
    let engine = build_engine(coordination.clone(), load_based(), gate.clone());

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.rebalance_with_retry(RebalanceTrigger::Initial).await })
    };
    gate.entered.notified().await;
    engine.notify(RebalanceTrigger::MembershipChanged);
    gate.release.notify_one();

    let outcome = in_flight.await.unwrap().unwrap();
    assert!(matches!(outcome, RebalanceOutcome::Published { epoch: 1, .. }));
    assert_eq!(coordination.publications().await, 1);
}

#[tokio::test]
async fn publication_conflict_leaves_store_untouched_then_retries() {
    let coordination = seeded(&["a", "b"], &[("g", 4)]).await;
    let gate = Arc::new(GatedThroughputProvider::new(StaticThroughputProvider::new([
        cluster_info(&[10, 20, 30, 40]),
    ])));
    let engine = build_engine(coordination.clone(), load_based(), gate.clone());

    let in_flight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.rebalance(RebalanceTrigger::Initial).await })
    };
    gate.entered.notified().await;
    let foreign = Assignment::with_instances(instances(&["a", "b"]).iter());
    coordination.force_publish(1, foreign.clone()).await;
    gate.release.notify_one();

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome, RebalanceOutcome::Conflict { current_epoch: 1 });
    let stored = coordination.current_assignment().await.unwrap().unwrap();
    assert_eq!(stored.epoch, 1);
    assert_eq!(stored.assignment, foreign);
    assert!(engine.current().await.is_none());

    let retried = engine.rebalance_with_retry(RebalanceTrigger::Manual).await.unwrap();
    assert!(matches!(retried, RebalanceOutcome::Published { epoch: 2, .. }));
    assert_eq!(coordination.publications().await, 1);
}

#[tokio::test]
async fn run_loop_follows_membership_changes() {
    let coordination = seeded(&["a"], &[("g", 6)]).await;
    let engine = build_engine(
        coordination.clone(),
        sticky(),
        Arc::new(StaticThroughputProvider::default()),
    );
    let cancel = CancellationToken::new();
    let handle = start_engine(engine.clone(), cancel.clone());

    wait_for_published(&engine, |a| a.partition_count("a") == 6).await;

    coordination.add_instance("b").await;
    coordination.add_instance("c").await;
    wait_for_published(&engine, |a| {
        ["a", "b", "c"].iter().all(|i| a.partition_count(i) == 2)
    })
    .await;

    coordination.remove_instance("a").await;
    wait_for_published(&engine, |a| {
        !a.contains_instance("a") && a.partition_count("b") == 3 && a.partition_count("c") == 3
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_loop_survives_unassignable_start() {
    let coordination = seeded(&[], &[("g", 3)]).await;
    let engine = build_engine(
        coordination.clone(),
        sticky(),
        Arc::new(StaticThroughputProvider::default()),
    );
    let cancel = CancellationToken::new();
    let handle = start_engine(engine.clone(), cancel.clone());

    // The initial rebalance fails with no live instances; the loop keeps
    // waiting for triggers.
    tokio::time::sleep(fast_engine_config().debounce_interval * 2).await;
    assert!(!handle.is_finished());
    assert_eq!(coordination.publications().await, 0);

    coordination.add_instance("a").await;
    wait_for_published(&engine, |a| a.partition_count("a") == 3).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn paused_group_is_released_by_run_loop() {
    let coordination = seeded(&["a", "b"], &[("g", 4), ("h", 2)]).await;
    let engine = build_engine(
        coordination.clone(),
        sticky(),
        Arc::new(StaticThroughputProvider::default()),
    );
    let cancel = CancellationToken::new();
    let handle = start_engine(engine.clone(), cancel.clone());

    wait_for_published(&engine, |a| a.tasks_for_group("h").count() > 0).await;

    coordination.set_paused("h", true).await;
    wait_for_published(&engine, |a| a.tasks_for_group("h").count() == 0).await;

    let stored = coordination.current_assignment().await.unwrap().unwrap();
    assert_eq!(stored.assignment.tasks_for_group("g").map(|(_, t)| t.len()).sum::<usize>(), 4);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn run_loop_discards_computation_overtaken_by_membership_change() {
    let coordination = seeded(&["a", "b"], &[("g", 4)]).await;
    let gate = Arc::new(GatedThroughputProvider::new(StaticThroughputProvider::new([
        cluster_info(&[10, 20, 30, 40]),
    ])));
    let engine = build_engine(coordination.clone(), load_based(), gate.clone());
    let cancel = CancellationToken::new();
    let handle = start_engine(engine.clone(), cancel.clone());

    // The initial rebalance is parked mid-computation when "c" joins.
    gate.entered.notified().await;
    coordination.add_instance("c").await;
    tokio::time::sleep(POLL_INTERVAL).await;
    gate.release.notify_one();

    wait_for_published(&engine, |a| a.partition_count("c") > 0).await;
    let published = engine.current().await.unwrap();
    assert_eq!(published.epoch, 1, "an assignment without c was published first");
    assert_eq!(coordination.publications().await, 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
