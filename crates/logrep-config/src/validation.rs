use std::collections::HashSet;
use std::time::Duration;

use logrep_core::{parse_lsn, ContextConfig, Subscription};
use logrep_proto::{ProtoFormat, ServerCapabilities, StartupParams};

use crate::error::{ConfigError, ConfigResult};
use crate::instance::{InstanceConfig, ProtocolConfig, ReplicationConfig, SubscriptionConfig};

/// Validate an instance configuration.
pub fn validate_config(config: &InstanceConfig) -> ConfigResult<()> {
    validate_replication(&config.replication)?;
    validate_protocol(&config.protocol)?;
    validate_subscriptions(&config.subscriptions)?;
    Ok(())
}

fn validate_replication(config: &ReplicationConfig) -> ConfigResult<()> {
    if config.max_workers == 0 {
        return Err(ConfigError::NoWorkers);
    }
    if config.naptime_secs == 0 {
        return Err(ConfigError::InvalidNaptime);
    }
    if config.stats_max_entries < -1 {
        return Err(ConfigError::InvalidStatsMaxEntries(config.stats_max_entries));
    }
    Ok(())
}

fn validate_protocol(config: &ProtocolConfig) -> ConfigResult<()> {
    if config.min_version == 0 || config.min_version > config.max_version {
        return Err(ConfigError::InvalidProtoRange {
            min: config.min_version,
            max: config.max_version,
        });
    }
    proto_format(config)?;
    Ok(())
}

fn validate_subscriptions(subs: &[SubscriptionConfig]) -> ConfigResult<()> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();

    for sub in subs {
        if sub.name.trim().is_empty() {
            return Err(ConfigError::EmptySubscriptionName { id: sub.id });
        }
        if !ids.insert(sub.id) {
            return Err(ConfigError::DuplicateSubscription {
                field: "id",
                value: sub.id.to_string(),
            });
        }
        // Names are unique per database.
        if !names.insert((sub.database, sub.name.as_str())) {
            return Err(ConfigError::DuplicateSubscription {
                field: "name",
                value: sub.name.clone(),
            });
        }
        for table in &sub.sync_tables {
            split_table(table)?;
        }
        stop_lsn(sub)?;
    }
    Ok(())
}

fn proto_format(config: &ProtocolConfig) -> ConfigResult<ProtoFormat> {
    config
        .format
        .parse()
        .map_err(|_| ConfigError::InvalidProtoFormat {
            value: config.format.clone(),
        })
}

fn split_table(table: &str) -> ConfigResult<(String, String)> {
    match table.split_once('.') {
        Some((schema, name)) if !schema.is_empty() && !name.is_empty() && !name.contains('.') => {
            Ok((schema.to_string(), name.to_string()))
        }
        _ => Err(ConfigError::InvalidSyncTable {
            value: table.to_string(),
        }),
    }
}

fn stop_lsn(sub: &SubscriptionConfig) -> ConfigResult<Option<u64>> {
    sub.replay_stop_lsn
        .as_deref()
        .map(|value| {
            parse_lsn(value).map_err(|_| ConfigError::InvalidStopLsn {
                subscription: sub.name.clone(),
                value: value.to_string(),
            })
        })
        .transpose()
}

/// Convert the `[replication]` section to a context configuration.
pub fn to_context_config(config: &InstanceConfig) -> ConfigResult<ContextConfig> {
    validate_replication(&config.replication)?;

    let replication = &config.replication;
    let prune_interval = match replication.stats_prune_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Ok(ContextConfig {
        max_workers: replication.max_workers,
        stats_max_entries: replication.stats_max_entries,
        prune_interval,
    })
}

/// Convert the `[[subscription]]` tables to the manager's view of them.
pub fn to_subscriptions(config: &InstanceConfig) -> ConfigResult<Vec<Subscription>> {
    validate_subscriptions(&config.subscriptions)?;

    config
        .subscriptions
        .iter()
        .map(|sub| {
            let mut out = Subscription::new(sub.id, sub.name.clone(), sub.database);
            out.enabled = sub.enabled;
            out.origin = sub.origin;
            out.replay_stop_lsn = stop_lsn(sub)?;
            out.pending_sync = sub
                .sync_tables
                .iter()
                .map(|t| split_table(t))
                .collect::<ConfigResult<_>>()?;
            Ok(out)
        })
        .collect()
}

/// Startup parameters a client sends, from the `[protocol]` section.
pub fn to_startup_params(config: &InstanceConfig) -> ConfigResult<StartupParams> {
    validate_protocol(&config.protocol)?;

    let protocol = &config.protocol;
    Ok(StartupParams {
        min_proto_version: protocol.min_version,
        max_proto_version: protocol.max_version,
        proto_format: proto_format(protocol)?,
        forward_changeset_origins: protocol.forward_origins,
        expected_encoding: protocol.encoding.clone(),
        ..Default::default()
    })
}

/// Versions and features the sender side accepts, from the `[protocol]`
/// section.
pub fn to_server_capabilities(config: &InstanceConfig) -> ConfigResult<ServerCapabilities> {
    validate_protocol(&config.protocol)?;

    Ok(ServerCapabilities {
        min_proto_version: config.protocol.min_version,
        max_proto_version: config.protocol.max_version,
        forward_origins: config.protocol.forward_origins,
        ..Default::default()
    })
}
