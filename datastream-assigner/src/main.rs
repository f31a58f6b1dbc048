use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use datastream_assigner::config::Config;
use datastream_assigner::coordination::{run_as_leader, Coordination, EtcdCoordination};
use datastream_assigner::engine::AssignmentEngine;
use datastream_assigner::strategy::{AssignmentStrategy, Strategy};
use datastream_assigner::throughput::{
    FileThroughputProvider, StaticThroughputProvider, ThroughputProvider,
};

fn init_tracing(json: bool) {
    let base_layer = tracing_subscriber::fmt::layer().with_target(true);
    let log_layer = if json {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer.with_filter(EnvFilter::from_default_env()).boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_with_defaults().context("failed to load configuration")?;
    init_tracing(config.log_json);

    let strategy = Strategy::from_properties(
        &config.assignment_strategy,
        &config.strategy_property_map(),
    )
    .context("invalid assignment strategy")?;
    tracing::info!(strategy = strategy.name(), "assignment strategy configured");

    let throughput: Arc<dyn ThroughputProvider> = match &config.throughput_file {
        Some(path) => {
            tracing::info!(path = %path, "reading throughput estimates from file");
            Arc::new(FileThroughputProvider::new(path))
        }
        None => Arc::new(StaticThroughputProvider::default()),
    };

    let coordination = Arc::new(
        EtcdCoordination::connect(config.store_config())
            .await
            .context("failed to connect to etcd")?,
    );

    let group_ids = config.group_id_constructor();
    for group in coordination
        .stream_groups()
        .await
        .context("failed to list stream groups")?
    {
        tracing::info!(
            stream_group = %group.id,
            group_id = %group_ids.for_group(&group),
            paused = group.paused,
            partitions = group.partitions.len(),
            "known stream group"
        );
    }

    let engine = AssignmentEngine::new(
        coordination.clone(),
        Arc::new(strategy),
        throughput,
        config.engine_config(),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            cancel.cancel();
        });
    }

    let membership = {
        let coordination = coordination.clone();
        let membership_config = config.membership_config();
        let token = cancel.clone();
        tokio::spawn(async move { coordination.run_membership(membership_config, token).await })
    };

    run_as_leader(
        &coordination,
        config.leader_election_config(),
        cancel.clone(),
        |leadership_cancel| engine.run(leadership_cancel),
    )
    .await
    .context("leader election failed")?;

    cancel.cancel();
    membership
        .await
        .context("membership task panicked")?
        .context("membership failed")?;

    Ok(())
}
