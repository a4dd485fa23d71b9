use serde::Deserialize;

use crate::error::ConfigResult;

/// Raw instance configuration as parsed from TOML.
#[derive(Debug, Deserialize)]
pub struct InstanceConfig {
    /// Worker registry and stats settings.
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Output protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Subscriptions served by this instance.
    #[serde(default, rename = "subscription")]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl InstanceConfig {
    /// Parse an instance config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: InstanceConfig = toml::from_str(toml_str)?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplicationConfig {
    /// Number of worker slots shared by every database.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Stats table bound; -1 derives it from `max_workers`.
    #[serde(default = "default_stats_max_entries")]
    pub stats_max_entries: i64,
    /// Seconds between stats prunes; 0 disables pruning.
    #[serde(default = "default_prune_interval", alias = "ctt_prune_interval")]
    pub stats_prune_interval_secs: u64,
    /// Seconds a crashed worker stays down before it is relaunched.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,
    /// Seconds between manager reconcile passes.
    #[serde(default = "default_naptime")]
    pub naptime_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            stats_max_entries: default_stats_max_entries(),
            stats_prune_interval_secs: default_prune_interval(),
            restart_delay_secs: default_restart_delay(),
            naptime_secs: default_naptime(),
        }
    }
}

fn default_max_workers() -> usize {
    16
}

fn default_stats_max_entries() -> i64 {
    -1
}

fn default_prune_interval() -> u64 {
    30 * 60
}

fn default_restart_delay() -> u64 {
    10
}

fn default_naptime() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_proto_version")]
    pub min_version: u32,
    #[serde(default = "default_proto_version")]
    pub max_version: u32,
    /// "native" or "json".
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub forward_origins: bool,
    /// Encoding the client expects; unset accepts the server's.
    #[serde(default)]
    pub encoding: Option<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_version: default_proto_version(),
            max_version: default_proto_version(),
            format: default_format(),
            forward_origins: false,
            encoding: None,
        }
    }
}

fn default_proto_version() -> u32 {
    logrep_proto::PROTO_VERSION_NUM
}

fn default_format() -> String {
    "native".to_string()
}

/// One `[[subscription]]` table.
#[derive(Debug, Deserialize)]
pub struct SubscriptionConfig {
    pub id: u32,
    pub name: String,
    /// Oid of the database the subscription lives in.
    pub database: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Replication origin the apply worker tracks progress under.
    #[serde(default)]
    pub origin: u16,
    /// Tables still waiting for their initial copy, as "schema.table".
    #[serde(default)]
    pub sync_tables: Vec<String>,
    /// Stop applying once this position (e.g. "0/16B3748") is reached.
    #[serde(default)]
    pub replay_stop_lsn: Option<String>,
}

fn default_enabled() -> bool {
    true
}
