use std::collections::HashMap;
use std::time::Duration;

use envconfig::Envconfig;

use crate::coordination::{LeaderElectionConfig, MembershipConfig, StoreConfig};
use crate::engine::EngineConfig;
use crate::group_id::GroupIdConstructor;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/datastream-assigner/")]
    pub etcd_prefix: String,

    // ── Membership ──────────────────────────────────────────────────
    #[envconfig(default = "assigner-0")]
    pub instance_name: String,

    #[envconfig(default = "30")]
    pub instance_lease_ttl_secs: i64,

    #[envconfig(default = "10")]
    pub instance_keepalive_interval_secs: u64,

    // ── Leader election ─────────────────────────────────────────────
    #[envconfig(default = "15")]
    pub leader_lease_ttl_secs: i64,

    #[envconfig(default = "5")]
    pub leader_keepalive_interval_secs: u64,

    #[envconfig(default = "5")]
    pub election_retry_interval_secs: u64,

    // ── Engine ──────────────────────────────────────────────────────
    #[envconfig(default = "1")]
    pub rebalance_debounce_interval_secs: u64,

    /// 0 disables periodic re-evaluation.
    #[envconfig(default = "300")]
    pub reevaluation_interval_secs: u64,

    #[envconfig(default = "3")]
    pub max_rebalance_attempts: usize,

    // ── Strategy ────────────────────────────────────────────────────
    #[envconfig(default = "sticky")]
    pub assignment_strategy: String,

    /// Comma-separated `key=value` pairs, e.g.
    /// `maxPartitionsPerTask=8,imbalanceThreshold=500`.
    #[envconfig(default = "")]
    pub strategy_properties: String,

    /// Throughput snapshot file. Without it every partition uses the
    /// strategy's default estimate.
    pub throughput_file: Option<String>,

    // ── Group ids ───────────────────────────────────────────────────
    #[envconfig(default = "default")]
    pub cluster_name: String,

    #[envconfig(default = "false")]
    pub group_id_hashing_enabled: bool,

    // ── Logging ─────────────────────────────────────────────────────
    #[envconfig(default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse `strategy_properties`. Entries without `=` are ignored.
    pub fn strategy_property_map(&self) -> HashMap<String, String> {
        self.strategy_properties
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    pub fn instance_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.instance_keepalive_interval_secs)
    }

    pub fn leader_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.leader_keepalive_interval_secs)
    }

    pub fn election_retry_interval(&self) -> Duration {
        Duration::from_secs(self.election_retry_interval_secs)
    }

    pub fn rebalance_debounce_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_debounce_interval_secs)
    }

    pub fn reevaluation_interval(&self) -> Option<Duration> {
        (self.reevaluation_interval_secs > 0)
            .then(|| Duration::from_secs(self.reevaluation_interval_secs))
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
        }
    }

    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            instance_id: self.instance_name.clone(),
            lease_ttl: self.instance_lease_ttl_secs,
            keepalive_interval: self.instance_keepalive_interval(),
        }
    }

    pub fn leader_election_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            name: self.instance_name.clone(),
            lease_ttl: self.leader_lease_ttl_secs,
            keepalive_interval: self.leader_keepalive_interval(),
            retry_interval: self.election_retry_interval(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            debounce_interval: self.rebalance_debounce_interval(),
            reevaluation_interval: self.reevaluation_interval(),
            max_rebalance_attempts: self.max_rebalance_attempts,
        }
    }

    pub fn group_id_constructor(&self) -> GroupIdConstructor {
        GroupIdConstructor::new(self.group_id_hashing_enabled, self.cluster_name.clone())
    }
}
